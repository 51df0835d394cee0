// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! sqldb adapter for the embedded sqlite back-end.
//!
//! Besides the plain driver plumbing this installs a set of scalar
//! functions that paper over the dialect differences to the server
//! back-ends (`UNIX_TIMESTAMP`, `FROM_UNIXTIME`, `NOW`, `REGEXP`,
//! `DIRNAME`) and wires the native progress callback into the node's
//! progress handlers.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, warn};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::OpenFlags;

use sqldb::{
	Backend, ColumnInfo, Connection, Connector, Dialect, DriverHooks, Error, ErrorKind,
	ExecOutcome, Interrupter, OpenMode, QueryOptions, QueryRow, Result, RowCallback,
	RowControl, Specifier,
	Value, ValueType,
};

/// Default rendering of date-time text, matching the server back-ends.
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Virtual-machine steps between progress-handler polls.
const PROGRESS_STEPS: i32 = 1000;

/// Install the sqlite connector in the process-wide registry.
pub fn register() {
	sqldb::register_connector(Backend::Sqlite, Arc::new(SqliteConnector));
}

/// Opens sqlite connections for the registry.
pub struct SqliteConnector;

impl Connector for SqliteConnector {
	fn connect(
		&self,
		spec: &Specifier,
		mode: OpenMode,
		hooks: DriverHooks,
	) -> Result<Box<dyn Connection>> {
		let path = match spec {
			Specifier::Sqlite { path } => path.as_str(),
			other => {
				return Err(Error::new(
					ErrorKind::Connect,
					format!("not a sqlite specifier: {}", other),
				))
			},
		};
		let conn = SqliteConnection::open(path, mode, hooks)?;
		Ok(Box::new(conn))
	}
}

/// One open sqlite database.
pub struct SqliteConnection {
	conn: rusqlite::Connection,
}

impl SqliteConnection {
	fn open(path: &str, mode: OpenMode, hooks: DriverHooks) -> Result<SqliteConnection> {
		let memory = path.is_empty() || mode.contains(OpenMode::MEMORY);
		if mode.contains(OpenMode::FORCE_CREATE) && !memory {
			if let Err(err) = fs::remove_file(path) {
				if err.kind() != std::io::ErrorKind::NotFound {
					return Err(Error::new(
						ErrorKind::Connect,
						format!("cannot remove {}: {}", path, err),
					));
				}
			}
		}

		let mut flags = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
		if mode.contains(OpenMode::READ_ONLY) {
			flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
		} else {
			flags |= OpenFlags::SQLITE_OPEN_READ_WRITE;
			if mode.intersects(OpenMode::CREATE | OpenMode::FORCE_CREATE) || memory {
				flags |= OpenFlags::SQLITE_OPEN_CREATE;
			}
		}

		let conn = if memory {
			if mode.contains(OpenMode::SHARED) {
				rusqlite::Connection::open_with_flags("file::memory:?cache=shared", flags)
			} else {
				rusqlite::Connection::open_in_memory_with_flags(flags)
			}
		} else {
			rusqlite::Connection::open_with_flags(path, flags)
		}
		.map_err(map_error)?;

		if !memory && !mode.contains(OpenMode::READ_ONLY) {
			// The coordinator serialises writers; WAL keeps readers
			// unblocked inside the engine itself.
			conn.execute_batch("PRAGMA journal_mode=WAL")
				.map_err(map_error)?;
		}
		if mode.contains(OpenMode::AUX) {
			conn.execute_batch("ATTACH DATABASE ':memory:' AS aux").map_err(map_error)?;
		}

		install_functions(&conn)?;
		let progress = std::panic::AssertUnwindSafe(hooks.progress.clone());
		conn.progress_handler(
			PROGRESS_STEPS,
			Some(move || {
				let progress = &progress;
				!(progress.0)()
			}),
		);

		debug!("sqlite open {}", if memory { ":memory:" } else { path });
		Ok(SqliteConnection { conn })
	}

	fn bind_params(params: &[Value]) -> Result<Vec<rusqlite::types::Value>> {
		params.iter().map(to_sqlite_value).collect()
	}
}

impl Connection for SqliteConnection {
	fn dialect(&self) -> Dialect {
		Dialect::Sqlite
	}

	fn execute_batch(&mut self, sql: &str) -> Result<()> {
		self.conn.execute_batch(sql).map_err(map_error)
	}

	fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecOutcome> {
		let bound = Self::bind_params(params)?;
		let changed = {
			let mut statement = self.conn.prepare_cached(sql).map_err(map_error)?;
			statement
				.execute(rusqlite::params_from_iter(bound))
				.map_err(map_error)?
		};
		Ok(ExecOutcome {
			changed_rows: changed as u64,
			last_insert_id: Some(self.conn.last_insert_rowid()),
		})
	}

	fn query(
		&mut self,
		sql: &str,
		params: &[Value],
		_options: QueryOptions,
		row_fn: &mut RowCallback<'_>,
	) -> Result<u64> {
		let bound = Self::bind_params(params)?;
		let mut statement = self.conn.prepare_cached(sql).map_err(map_error)?;
		let names: Vec<String> =
			statement.column_names().iter().map(|name| name.to_string()).collect();
		let column_count = names.len();
		let mut rows = statement.query(rusqlite::params_from_iter(bound)).map_err(map_error)?;
		let mut delivered = 0;
		let mut values = Vec::with_capacity(column_count);
		loop {
			let row = match rows.next().map_err(map_error)? {
				Some(row) => row,
				None => break,
			};
			values.clear();
			for index in 0..column_count {
				values.push(from_sqlite_value(row.get_ref(index).map_err(map_error)?));
			}
			delivered += 1;
			match row_fn(&QueryRow { columns: &names, values: &values })? {
				RowControl::Continue => {},
				RowControl::Stop => break,
			}
		}
		Ok(delivered)
	}

	fn interrupter(&self) -> Arc<dyn Interrupter> {
		Arc::new(SqliteInterrupter { handle: self.conn.get_interrupt_handle() })
	}

	fn table_names(&mut self) -> Result<Vec<String>> {
		self.schema_names("table")
	}

	fn view_names(&mut self) -> Result<Vec<String>> {
		self.schema_names("view")
	}

	fn index_names(&mut self) -> Result<Vec<String>> {
		self.schema_names("index")
	}

	fn trigger_names(&mut self) -> Result<Vec<String>> {
		self.schema_names("trigger")
	}

	fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
		let sql = format!("PRAGMA table_info({})", table);
		let mut statement = self.conn.prepare(&sql).map_err(map_error)?;
		let mut rows = statement.query([]).map_err(map_error)?;
		let mut columns = Vec::new();
		while let Some(row) = rows.next().map_err(map_error)? {
			let name: String = row.get(1).map_err(map_error)?;
			let declared: String = row.get(2).map_err(map_error)?;
			let not_null: i64 = row.get(3).map_err(map_error)?;
			let pk: i64 = row.get(5).map_err(map_error)?;
			columns.push(ColumnInfo {
				name,
				kind: if pk > 0 { ValueType::PrimaryKey } else { map_declared_type(&declared) },
				primary_key: pk > 0,
				not_null: not_null != 0,
			});
		}
		if columns.is_empty() {
			return Err(Error::new(ErrorKind::MissingTable, format!("no such table {}", table)));
		}
		Ok(columns)
	}

	fn checkpoint(&mut self) -> Result<()> {
		self.conn
			.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")
			.map_err(map_error)
	}
}

impl SqliteConnection {
	fn schema_names(&mut self, kind: &str) -> Result<Vec<String>> {
		let mut statement = self
			.conn
			.prepare_cached(
				"SELECT name FROM sqlite_master \
				 WHERE type = ?1 AND name NOT LIKE 'sqlite_%' ORDER BY name",
			)
			.map_err(map_error)?;
		let mut rows = statement.query([kind]).map_err(map_error)?;
		let mut names = Vec::new();
		while let Some(row) = rows.next().map_err(map_error)? {
			names.push(row.get(0).map_err(map_error)?);
		}
		Ok(names)
	}
}

struct SqliteInterrupter {
	handle: rusqlite::InterruptHandle,
}

impl Interrupter for SqliteInterrupter {
	fn interrupt(&self) {
		self.handle.interrupt();
	}
}

fn to_sqlite_value(value: &Value) -> Result<rusqlite::types::Value> {
	use rusqlite::types::Value as Sql;
	Ok(match value {
		Value::Null => Sql::Null,
		Value::Key(v) | Value::Int64(v) | Value::DateTime(v) => Sql::Integer(*v),
		Value::Bool(v) => Sql::Integer(*v as i64),
		Value::Int32(v) => Sql::Integer(*v as i64),
		Value::UInt32(v) | Value::Enum(v) => Sql::Integer(*v as i64),
		Value::UInt64(v) => Sql::Integer(*v as i64),
		Value::Double(v) => Sql::Real(*v),
		Value::String(v) => Sql::Text(v.clone()),
		Value::CString(v) => Sql::Text((*v).to_owned()),
		Value::FullTextSearch(v) => Sql::Text(v.clone()),
		Value::Blob(v) => Sql::Blob(v.clone()),
		Value::KeyArray(_) | Value::Expression(_) => {
			return Err(Error::new(ErrorKind::Bind, "value must be spliced at build time"))
		},
	})
}

fn from_sqlite_value(value: ValueRef<'_>) -> Value {
	match value {
		ValueRef::Null => Value::Null,
		ValueRef::Integer(v) => Value::Int64(v),
		ValueRef::Real(v) => Value::Double(v),
		// Text is repaired to valid UTF-8 on the way in.
		ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
		ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
	}
}

fn map_declared_type(declared: &str) -> ValueType {
	let upper = declared.to_ascii_uppercase();
	if upper.contains("DATETIME") || upper.contains("TIMESTAMP") {
		ValueType::DateTime
	} else if upper.contains("INT") {
		ValueType::Int64
	} else if upper.contains("CHAR") || upper.contains("TEXT") || upper.contains("CLOB") {
		ValueType::String
	} else if upper.contains("BLOB") || upper.is_empty() {
		ValueType::Blob
	} else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
		ValueType::Double
	} else if upper.contains("BOOL") {
		ValueType::Bool
	} else {
		ValueType::String
	}
}

fn map_error(err: rusqlite::Error) -> Error {
	use rusqlite::ErrorCode;
	match &err {
		rusqlite::Error::SqliteFailure(failure, message) => {
			let text = message.clone().unwrap_or_else(|| failure.to_string());
			let code = failure.extended_code as i64;
			let kind = match failure.code {
				ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorKind::Busy,
				ErrorCode::OperationInterrupted => ErrorKind::Interrupted,
				ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt => ErrorKind::Invalid,
				ErrorCode::CannotOpen => ErrorKind::Connect,
				ErrorCode::PermissionDenied | ErrorCode::ReadOnly => ErrorKind::Authorization,
				ErrorCode::ConstraintViolation => ErrorKind::Exists,
				ErrorCode::ApiMisuse => {
					debug_assert!(false, "sqlite misuse: {}", text);
					ErrorKind::Database
				},
				_ => ErrorKind::Database,
			};
			Error::new(kind, text).with_code(code)
		},
		rusqlite::Error::QueryReturnedNoRows => {
			Error::new(ErrorKind::EntryNotFound, "query returned no rows")
		},
		other => Error::new(ErrorKind::Database, other.to_string()),
	}
}

/// Scalar functions papering over dialect differences.
fn install_functions(conn: &rusqlite::Connection) -> Result<()> {
	let deterministic = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

	conn.create_scalar_function("UNIX_TIMESTAMP", -1, FunctionFlags::SQLITE_UTF8, |ctx| {
		match ctx.len() {
			0 => Ok(Utc::now().timestamp()),
			_ => {
				if let Ok(seconds) = ctx.get::<i64>(0) {
					return Ok(seconds);
				}
				let text: String = ctx.get(0)?;
				let format = if ctx.len() > 1 {
					ctx.get::<String>(1)?
				} else {
					DATETIME_FORMAT.to_owned()
				};
				NaiveDateTime::parse_from_str(&text, &format)
					.map(|dt| dt.and_utc().timestamp())
					.map_err(|err| rusqlite::Error::UserFunctionError(Box::new(err)))
			},
		}
	})
	.map_err(map_error)?;

	conn.create_scalar_function("FROM_UNIXTIME", -1, deterministic, |ctx| {
		let seconds: i64 = ctx.get(0)?;
		let format =
			if ctx.len() > 1 { ctx.get::<String>(1)? } else { DATETIME_FORMAT.to_owned() };
		let stamp = DateTime::<Utc>::from_timestamp(seconds, 0).ok_or_else(|| {
			rusqlite::Error::UserFunctionError(format!("invalid timestamp {}", seconds).into())
		})?;
		Ok(stamp.format(&format).to_string())
	})
	.map_err(map_error)?;

	conn.create_scalar_function("NOW", 0, FunctionFlags::SQLITE_UTF8, |_ctx| {
		Ok(Utc::now().format(DATETIME_FORMAT).to_string())
	})
	.map_err(map_error)?;

	conn.create_scalar_function("REGEXP", 3, deterministic, |ctx| {
		let pattern: String = ctx.get(0)?;
		let case_sensitive: bool = ctx.get(1)?;
		let text: String = ctx.get(2)?;
		let pattern =
			if case_sensitive { pattern } else { format!("(?i){}", pattern) };
		let re = regex::Regex::new(&pattern)
			.map_err(|err| rusqlite::Error::UserFunctionError(Box::new(err)))?;
		Ok(re.is_match(&text))
	})
	.map_err(map_error)?;

	conn.create_scalar_function("DIRNAME", 1, deterministic, |ctx| {
		let path: String = ctx.get(0)?;
		Ok(Path::new(&path)
			.parent()
			.map(|parent| parent.to_string_lossy().into_owned())
			.unwrap_or_default())
	})
	.map_err(map_error)?;

	Ok(())
}

impl Drop for SqliteConnection {
	fn drop(&mut self) {
		// Flush the write-ahead log so a copied file is self-contained.
		if let Err(err) = self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE)") {
			warn!("closing checkpoint failed: {}", err);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn memory_conn() -> SqliteConnection {
		SqliteConnection::open("", OpenMode::default(), DriverHooks::none()).unwrap()
	}

	fn scalar(conn: &mut SqliteConnection, sql: &str) -> Value {
		let mut out = Value::Null;
		conn.query(sql, &[], QueryOptions::default(), &mut |row| {
			out = row.values[0].clone();
			Ok(RowControl::Stop)
		})
		.unwrap();
		out
	}

	#[test]
	fn unix_timestamp_parses_datetime_text() {
		let mut conn = memory_conn();
		let value = scalar(&mut conn, "SELECT UNIX_TIMESTAMP('2023-11-14 22:13:20')");
		assert_eq!(value, Value::Int64(1_700_000_000));
		// Integer input passes through.
		let value = scalar(&mut conn, "SELECT UNIX_TIMESTAMP(1700000000)");
		assert_eq!(value, Value::Int64(1_700_000_000));
	}

	#[test]
	fn from_unixtime_formats() {
		let mut conn = memory_conn();
		let value = scalar(&mut conn, "SELECT FROM_UNIXTIME(1700000000)");
		assert_eq!(value, Value::String("2023-11-14 22:13:20".into()));
		let value = scalar(&mut conn, "SELECT FROM_UNIXTIME(1700000000, '%Y')");
		assert_eq!(value, Value::String("2023".into()));
	}

	#[test]
	fn now_round_trips_through_unix_timestamp() {
		let mut conn = memory_conn();
		let now = Utc::now().timestamp();
		let value = scalar(&mut conn, "SELECT UNIX_TIMESTAMP(NOW())");
		let got = value.as_i64().unwrap();
		assert!((got - now).abs() < 5, "NOW drifted: {} vs {}", got, now);
	}

	#[test]
	fn regexp_honours_case_flag() {
		let mut conn = memory_conn();
		assert_eq!(
			scalar(&mut conn, "SELECT REGEXP('^ab.$', 1, 'abc')"),
			Value::Int64(1)
		);
		assert_eq!(
			scalar(&mut conn, "SELECT REGEXP('^AB.$', 1, 'abc')"),
			Value::Int64(0)
		);
		assert_eq!(
			scalar(&mut conn, "SELECT REGEXP('^AB.$', 0, 'abc')"),
			Value::Int64(1)
		);
	}

	#[test]
	fn dirname_strips_the_last_component() {
		let mut conn = memory_conn();
		assert_eq!(
			scalar(&mut conn, "SELECT DIRNAME('/var/lib/data.db')"),
			Value::String("/var/lib".into())
		);
	}

	#[test]
	fn execute_reports_changes_and_rowid() {
		let mut conn = memory_conn();
		conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
		let outcome = conn
			.execute("INSERT INTO t (name) VALUES (?)", &[Value::String("a".into())])
			.unwrap();
		assert_eq!(outcome.changed_rows, 1);
		assert_eq!(outcome.last_insert_id, Some(1));
	}

	#[test]
	fn table_columns_reports_primary_key_and_nullability() {
		let mut conn = memory_conn();
		conn.execute_batch(
			"CREATE TABLE t (id INTEGER PRIMARY KEY, stamp DATETIME NOT NULL, raw BLOB)",
		)
		.unwrap();
		let columns = conn.table_columns("t").unwrap();
		assert_eq!(columns.len(), 3);
		assert!(columns[0].primary_key);
		assert_eq!(columns[1].kind, ValueType::DateTime);
		assert!(columns[1].not_null);
		assert_eq!(columns[2].kind, ValueType::Blob);
		assert!(!columns[2].not_null);
	}

	#[test]
	fn aux_schema_is_attached_on_demand() {
		let mut conn =
			SqliteConnection::open("", OpenMode::READ_WRITE | OpenMode::AUX, DriverHooks::none())
				.unwrap();
		conn.execute_batch("CREATE TABLE aux.temporary1 (id INTEGER)").unwrap();
		let outcome = conn.execute("INSERT INTO aux.temporary1 VALUES (?)", &[Value::Key(7)]);
		assert!(outcome.is_ok());
	}

	#[test]
	fn invalid_utf8_text_is_repaired() {
		let mut conn = memory_conn();
		conn.execute_batch("CREATE TABLE t (b BLOB)").unwrap();
		conn.execute("INSERT INTO t VALUES (?)", &[Value::Blob(vec![b'h', 0xff, b'i'])])
			.unwrap();
		let value = scalar(&mut conn, "SELECT CAST(b AS TEXT) FROM t");
		assert_eq!(value, Value::String("h\u{fffd}i".into()));
	}
}
