// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! sqldb adapter for MySQL-lineage servers.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Timelike};
use log::debug;
use mysql::prelude::Queryable;
use mysql::{Conn, Opts, OptsBuilder, Params};

use sqldb::{
	Backend, ColumnInfo, Connection, Connector, Dialect, DriverHooks, Error, ErrorKind,
	ExecOutcome, Interrupter, NullInterrupter, OpenMode, QueryOptions, QueryRow, Result,
	RowCallback, RowControl, ServerSpec, Specifier, Value, ValueType,
};

/// Oldest server version the adapter accepts.
const MIN_SERVER_VERSION: (u16, u16, u16) = (5, 7, 0);

/// Session lock-wait budget; the portable retry loop sits above this.
const LOCK_WAIT_TIMEOUT_SECONDS: u32 = 60;

/// Install the MariaDB connector in the process-wide registry.
pub fn register() {
	sqldb::register_connector(Backend::MariaDb, Arc::new(MariaDbConnector));
}

/// Opens MariaDB connections for the registry.
pub struct MariaDbConnector;

impl Connector for MariaDbConnector {
	fn connect(
		&self,
		spec: &Specifier,
		mode: OpenMode,
		_hooks: DriverHooks,
	) -> Result<Box<dyn Connection>> {
		let server = match spec {
			Specifier::MariaDb(server) => server,
			other => {
				return Err(Error::new(
					ErrorKind::Connect,
					format!("not a mariadb specifier: {}", other),
				))
			},
		};
		Ok(Box::new(MariaDbConnection::open(server, mode)?))
	}
}

/// One open server connection.
pub struct MariaDbConnection {
	conn: Conn,
}

impl MariaDbConnection {
	fn open(server: &ServerSpec, mode: OpenMode) -> Result<MariaDbConnection> {
		let force_create = mode.contains(OpenMode::FORCE_CREATE);
		let builder = OptsBuilder::new()
			.ip_or_hostname(Some(server.host.clone()))
			.user(Some(server.user.clone()))
			.pass(Some(server.password.reveal().to_owned()))
			.db_name(if force_create { None } else { Some(server.database.clone()) });
		let mut conn = Conn::new(Opts::from(builder)).map_err(map_error)?;

		let version = conn.server_version();
		if version < MIN_SERVER_VERSION {
			return Err(Error::new(
				ErrorKind::Version,
				format!(
					"server {}.{}.{} is older than {}.{}.{}",
					version.0,
					version.1,
					version.2,
					MIN_SERVER_VERSION.0,
					MIN_SERVER_VERSION.1,
					MIN_SERVER_VERSION.2
				),
			));
		}

		if force_create {
			let database = &server.database;
			let created = conn.query_drop(format!(
				"CREATE DATABASE IF NOT EXISTS {} CHARACTER SET utf8mb4",
				database
			));
			if created.is_err() {
				conn.query_drop(format!(
					"CREATE DATABASE IF NOT EXISTS {} CHARACTER SET utf8",
					database
				))
				.map_err(map_error)?;
			}
			conn.query_drop(format!("USE {}", database)).map_err(map_error)?;
		}

		// Report division by zero, never substitute the storage engine,
		// tolerate over-long values.
		conn.query_drop(
			"SET SESSION sql_mode = 'ERROR_FOR_DIVISION_BY_ZERO,NO_ENGINE_SUBSTITUTION'",
		)
		.map_err(map_error)?;
		conn.query_drop(format!(
			"SET SESSION innodb_lock_wait_timeout = {}",
			LOCK_WAIT_TIMEOUT_SECONDS
		))
		.map_err(map_error)?;

		debug!("mariadb open {}@{}/{}", server.user, server.host, server.database);
		Ok(MariaDbConnection { conn })
	}

	fn params(values: &[Value]) -> Result<Params> {
		if values.is_empty() {
			return Ok(Params::Empty);
		}
		let converted: Result<Vec<mysql::Value>> = values.iter().map(to_mysql_value).collect();
		Ok(Params::Positional(converted?))
	}
}

impl Connection for MariaDbConnection {
	fn dialect(&self) -> Dialect {
		Dialect::MariaDb
	}

	fn execute_batch(&mut self, sql: &str) -> Result<()> {
		self.conn.query_drop(sql).map_err(map_error)
	}

	fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecOutcome> {
		let params = Self::params(params)?;
		let result = self.conn.exec_iter(sql, params).map_err(map_error)?;
		let outcome = ExecOutcome {
			changed_rows: result.affected_rows(),
			last_insert_id: result.last_insert_id().map(|id| id as i64),
		};
		drop(result);
		Ok(outcome)
	}

	fn query(
		&mut self,
		sql: &str,
		params: &[Value],
		options: QueryOptions,
		row_fn: &mut RowCallback<'_>,
	) -> Result<u64> {
		let params = Self::params(params)?;
		let mut result = self.conn.exec_iter(sql, params).map_err(map_error)?;
		let mut names: Vec<String> = Vec::new();
		let mut delivered = 0;

		let mut deliver = |row: mysql::Row,
		                   names: &mut Vec<String>,
		                   delivered: &mut u64|
		 -> Result<RowControl> {
			if names.is_empty() {
				*names = row
					.columns_ref()
					.iter()
					.map(|column| column.name_str().into_owned())
					.collect();
			}
			let raw = row.unwrap();
			let values: Vec<Value> = raw.into_iter().map(from_mysql_value).collect();
			*delivered += 1;
			row_fn(&QueryRow { columns: names, values: &values })
		};

		if options.fetch_all {
			let rows: Vec<mysql::Row> = result
				.by_ref()
				.collect::<std::result::Result<_, _>>()
				.map_err(map_error)?;
			drop(result);
			for row in rows {
				if deliver(row, &mut names, &mut delivered)? == RowControl::Stop {
					break;
				}
			}
		} else {
			while let Some(row) = result.next() {
				let row = row.map_err(map_error)?;
				if deliver(row, &mut names, &mut delivered)? == RowControl::Stop {
					break;
				}
			}
			drop(result);
		}
		Ok(delivered)
	}

	fn interrupter(&self) -> Arc<dyn Interrupter> {
		// Cancellation is best-effort on this back-end; there is no
		// side channel to kill a running statement.
		Arc::new(NullInterrupter)
	}

	fn table_names(&mut self) -> Result<Vec<String>> {
		self.object_names("BASE TABLE")
	}

	fn view_names(&mut self) -> Result<Vec<String>> {
		self.object_names("VIEW")
	}

	fn index_names(&mut self) -> Result<Vec<String>> {
		self.conn
			.query_map(
				"SELECT DISTINCT INDEX_NAME FROM information_schema.statistics \
				 WHERE table_schema = DATABASE()",
				|name: String| name,
			)
			.map_err(map_error)
	}

	fn trigger_names(&mut self) -> Result<Vec<String>> {
		self.conn
			.query_map(
				"SELECT TRIGGER_NAME FROM information_schema.triggers \
				 WHERE trigger_schema = DATABASE()",
				|name: String| name,
			)
			.map_err(map_error)
	}

	fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
		let rows: Vec<(String, String, String, String)> = self
			.conn
			.exec_map(
				"SELECT COLUMN_NAME, DATA_TYPE, COLUMN_KEY, IS_NULLABLE \
				 FROM information_schema.columns \
				 WHERE table_schema = DATABASE() AND table_name = ? \
				 ORDER BY ORDINAL_POSITION",
				(table,),
				|(name, data_type, key, nullable): (String, String, String, String)| {
					(name, data_type, key, nullable)
				},
			)
			.map_err(map_error)?;
		if rows.is_empty() {
			return Err(Error::new(ErrorKind::MissingTable, format!("no such table {}", table)));
		}
		Ok(rows
			.into_iter()
			.map(|(name, data_type, key, nullable)| {
				let primary_key = key == "PRI";
				ColumnInfo {
					name,
					kind: if primary_key {
						ValueType::PrimaryKey
					} else {
						map_data_type(&data_type)
					},
					primary_key,
					not_null: nullable == "NO",
				}
			})
			.collect())
	}
}

impl MariaDbConnection {
	fn object_names(&mut self, table_type: &str) -> Result<Vec<String>> {
		self.conn
			.exec_map(
				"SELECT TABLE_NAME FROM information_schema.tables \
				 WHERE table_schema = DATABASE() AND table_type = ?",
				(table_type,),
				|name: String| name,
			)
			.map_err(map_error)
	}
}

fn to_mysql_value(value: &Value) -> Result<mysql::Value> {
	use mysql::Value as My;
	Ok(match value {
		Value::Null => My::NULL,
		Value::Key(v) | Value::Int64(v) => My::Int(*v),
		Value::Bool(v) => My::Int(*v as i64),
		Value::Int32(v) => My::Int(*v as i64),
		Value::UInt32(v) | Value::Enum(v) => My::UInt(*v as u64),
		Value::UInt64(v) => My::UInt(*v),
		Value::Double(v) => My::Double(*v),
		// Decomposed into a civil date-time for DATETIME columns.
		Value::DateTime(seconds) => match chrono::DateTime::from_timestamp(*seconds, 0) {
			Some(stamp) => {
				let naive = stamp.naive_utc();
				My::Date(
					naive.year() as u16,
					naive.month() as u8,
					naive.day() as u8,
					naive.hour() as u8,
					naive.minute() as u8,
					naive.second() as u8,
					0,
				)
			},
			None => {
				return Err(Error::new(
					ErrorKind::Bind,
					format!("timestamp {} out of range", seconds),
				))
			},
		},
		Value::String(v) => My::Bytes(v.clone().into_bytes()),
		Value::CString(v) => My::Bytes(v.as_bytes().to_vec()),
		Value::FullTextSearch(v) => My::Bytes(v.clone().into_bytes()),
		Value::Blob(v) => My::Bytes(v.clone()),
		Value::KeyArray(_) | Value::Expression(_) => {
			return Err(Error::new(ErrorKind::Bind, "value must be spliced at build time"))
		},
	})
}

fn from_mysql_value(value: mysql::Value) -> Value {
	use mysql::Value as My;
	match value {
		My::NULL => Value::Null,
		My::Int(v) => Value::Int64(v),
		My::UInt(v) => Value::UInt64(v),
		My::Float(v) => Value::Double(v as f64),
		My::Double(v) => Value::Double(v),
		My::Bytes(bytes) => match String::from_utf8(bytes) {
			Ok(text) => Value::String(text),
			Err(err) => Value::Blob(err.into_bytes()),
		},
		My::Date(year, month, day, hour, minute, second, _micros) => {
			let stamp = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
				.and_then(|date| {
					date.and_hms_opt(hour as u32, minute as u32, second as u32)
				})
				.map(|naive| naive.and_utc().timestamp())
				.unwrap_or(0);
			Value::DateTime(stamp)
		},
		My::Time(negative, days, hours, minutes, seconds, _micros) => {
			let total = days as i64 * 86_400 +
				hours as i64 * 3_600 +
				minutes as i64 * 60 +
				seconds as i64;
			Value::Int64(if negative { -total } else { total })
		},
	}
}

fn map_data_type(data_type: &str) -> ValueType {
	match data_type.to_ascii_lowercase().as_str() {
		"tinyint" => ValueType::Bool,
		"smallint" | "mediumint" | "int" => ValueType::Int64,
		"bigint" => ValueType::Int64,
		"float" | "double" | "decimal" => ValueType::Double,
		"datetime" | "timestamp" | "date" => ValueType::DateTime,
		"blob" | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary" => {
			ValueType::Blob
		},
		_ => ValueType::String,
	}
}

fn map_error(err: mysql::Error) -> Error {
	match &err {
		mysql::Error::MySqlError(server) => {
			let kind = match server.code {
				1205 | 1213 => ErrorKind::Busy,
				1044 => ErrorKind::Authorization,
				1045 => ErrorKind::InvalidPassword,
				1049 => ErrorKind::NotFound,
				1050 => ErrorKind::Exists,
				1054 => ErrorKind::MissingColumn,
				1062 => ErrorKind::Exists,
				1146 => ErrorKind::MissingTable,
				_ => ErrorKind::Database,
			};
			Error::new(kind, server.message.clone()).with_code(server.code as i64)
		},
		mysql::Error::IoError(io) => {
			Error::new(ErrorKind::ConnectionLost, io.to_string())
		},
		mysql::Error::DriverError(driver) => {
			Error::new(ErrorKind::ConnectionLost, driver.to_string())
		},
		other => Error::new(ErrorKind::Database, other.to_string()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn datetime_decomposes_to_civil_time() {
		let value = to_mysql_value(&Value::DateTime(1_700_000_000)).unwrap();
		assert_eq!(value, mysql::Value::Date(2023, 11, 14, 22, 13, 20, 0));
	}

	#[test]
	fn civil_time_recomposes_to_unix_seconds() {
		let value = from_mysql_value(mysql::Value::Date(2023, 11, 14, 22, 13, 20, 0));
		assert_eq!(value, Value::DateTime(1_700_000_000));
	}

	#[test]
	fn bytes_become_text_when_valid_utf8() {
		assert_eq!(
			from_mysql_value(mysql::Value::Bytes(b"hello".to_vec())),
			Value::String("hello".into())
		);
		assert_eq!(
			from_mysql_value(mysql::Value::Bytes(vec![0xff, 0x00])),
			Value::Blob(vec![0xff, 0x00])
		);
	}

	#[test]
	fn key_arrays_are_rejected_as_binds() {
		let err = to_mysql_value(&Value::KeyArray(vec![1])).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::Bind);
	}

	#[test]
	fn lock_wait_maps_to_busy() {
		let err = map_error(mysql::Error::MySqlError(mysql::MySqlError {
			state: "HY000".into(),
			message: "Lock wait timeout exceeded".into(),
			code: 1205,
		}));
		assert_eq!(err.kind(), ErrorKind::Busy);
		assert_eq!(err.code(), Some(1205));
	}
}
