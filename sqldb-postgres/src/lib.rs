// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! sqldb adapter for PostgreSQL-lineage servers.
//!
//! Statements prepare into a per-connection reuse cache keyed by the SQL
//! text. Entries carry a use count and a last-use stamp; once the cache
//! crosses its size threshold, idle unused entries are dropped, which
//! closes them server-side. Queries stream row by row unless the caller
//! asked for the whole result set up front.

mod cache;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;
use postgres::fallible_iterator::FallibleIterator;
use postgres::types::{ToSql, Type};
use postgres::{Client, Config, NoTls};

use sqldb::{
	Backend, ColumnInfo, Connection, Connector, Dialect, DriverHooks, Error, ErrorKind,
	ExecOutcome, Interrupter, OpenMode, QueryOptions, QueryRow, Result, RowCallback,
	RowControl, ServerSpec, Specifier, Value, ValueType,
};

use crate::cache::StatementCache;

/// Install the PostgreSQL connector in the process-wide registry.
pub fn register() {
	sqldb::register_connector(Backend::PostgreSql, Arc::new(PostgresConnector));
}

/// Opens PostgreSQL connections for the registry.
pub struct PostgresConnector;

impl Connector for PostgresConnector {
	fn connect(
		&self,
		spec: &Specifier,
		mode: OpenMode,
		_hooks: DriverHooks,
	) -> Result<Box<dyn Connection>> {
		let server = match spec {
			Specifier::PostgreSql(server) => server,
			other => {
				return Err(Error::new(
					ErrorKind::Connect,
					format!("not a postgresql specifier: {}", other),
				))
			},
		};
		Ok(Box::new(PostgresConnection::open(server, mode)?))
	}
}

/// One open server connection plus its statement cache.
pub struct PostgresConnection {
	client: Client,
	cache: StatementCache,
}

impl PostgresConnection {
	fn open(server: &ServerSpec, mode: OpenMode) -> Result<PostgresConnection> {
		// The identifier folding of the server.
		let database = server.database.to_lowercase();

		if mode.contains(OpenMode::FORCE_CREATE) {
			let mut admin = config_for(server, "postgres").connect(NoTls).map_err(map_error)?;
			let created = admin.batch_execute(&format!(
				"CREATE DATABASE {} WITH ENCODING 'UTF8' \
				 LC_COLLATE 'en_US.UTF-8' TEMPLATE template0",
				database
			));
			if let Err(err) = created {
				let mapped = map_error(err);
				if mapped.kind() != ErrorKind::Exists {
					return Err(mapped);
				}
			}
		}

		let client = config_for(server, &database).connect(NoTls).map_err(map_error)?;
		debug!("postgresql open {}@{}/{}", server.user, server.host, database);
		Ok(PostgresConnection { client, cache: StatementCache::new() })
	}

	fn bind<'a>(
		params: &[Value],
		types: &[Type],
		storage: &'a mut Vec<Box<dyn ToSql + Sync + Send>>,
	) -> Result<Vec<&'a (dyn ToSql + Sync)>> {
		storage.clear();
		for (index, value) in params.iter().enumerate() {
			let ty = types.get(index).unwrap_or(&Type::TEXT);
			storage.push(bind_value(value, ty)?);
		}
		Ok(storage.iter().map(|boxed| boxed.as_ref() as &(dyn ToSql + Sync)).collect())
	}

	fn last_insert_id(&mut self) -> Option<i64> {
		match self.client.query_one("SELECT LASTVAL()", &[]) {
			Ok(row) => row.try_get::<_, i64>(0).ok(),
			// No sequence was touched in this session yet.
			Err(_) => None,
		}
	}
}

impl Connection for PostgresConnection {
	fn dialect(&self) -> Dialect {
		Dialect::PostgreSql
	}

	fn execute_batch(&mut self, sql: &str) -> Result<()> {
		self.client.batch_execute(sql).map_err(map_error)
	}

	fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecOutcome> {
		let statement = self.cache.checkout(&mut self.client, sql)?;
		let mut storage = Vec::new();
		let bound = Self::bind(params, statement.params(), &mut storage);
		let result = match bound {
			Ok(bound) => self.client.execute(&statement, &bound).map_err(map_error),
			Err(err) => Err(err),
		};
		self.cache.checkin(sql);
		let changed_rows = result?;
		let last_insert_id = if sql.trim_start().get(..6).map_or(false, |head| {
			head.eq_ignore_ascii_case("INSERT")
		}) {
			self.last_insert_id()
		} else {
			None
		};
		Ok(ExecOutcome { changed_rows, last_insert_id })
	}

	fn query(
		&mut self,
		sql: &str,
		params: &[Value],
		options: QueryOptions,
		row_fn: &mut RowCallback<'_>,
	) -> Result<u64> {
		let statement = self.cache.checkout(&mut self.client, sql)?;
		let names: Vec<String> =
			statement.columns().iter().map(|column| column.name().to_owned()).collect();
		let mut storage = Vec::new();

		let outcome = (|| {
			let bound = Self::bind(params, statement.params(), &mut storage)?;
			let mut delivered = 0;
			if options.fetch_all {
				let rows = self.client.query(&statement, &bound).map_err(map_error)?;
				for row in rows {
					let values = row_values(&row)?;
					delivered += 1;
					if row_fn(&QueryRow { columns: &names, values: &values })? ==
						RowControl::Stop
					{
						break;
					}
				}
			} else {
				// Single-row mode: rows stream off the wire one by one.
				let mut rows = self
					.client
					.query_raw(&statement, bound.iter().copied())
					.map_err(map_error)?;
				while let Some(row) = rows.next().map_err(map_error)? {
					let values = row_values(&row)?;
					delivered += 1;
					if row_fn(&QueryRow { columns: &names, values: &values })? ==
						RowControl::Stop
					{
						break;
					}
				}
			}
			Ok(delivered)
		})();
		self.cache.checkin(sql);
		outcome
	}

	fn interrupter(&self) -> Arc<dyn Interrupter> {
		Arc::new(PostgresInterrupter { token: self.client.cancel_token() })
	}

	fn table_names(&mut self) -> Result<Vec<String>> {
		self.name_query(
			"SELECT tablename FROM pg_catalog.pg_tables \
			 WHERE schemaname = 'public' ORDER BY tablename",
		)
	}

	fn view_names(&mut self) -> Result<Vec<String>> {
		self.name_query(
			"SELECT viewname FROM pg_catalog.pg_views \
			 WHERE schemaname = 'public' ORDER BY viewname",
		)
	}

	fn index_names(&mut self) -> Result<Vec<String>> {
		self.name_query(
			"SELECT indexname FROM pg_catalog.pg_indexes \
			 WHERE schemaname = 'public' ORDER BY indexname",
		)
	}

	fn trigger_names(&mut self) -> Result<Vec<String>> {
		self.name_query(
			"SELECT DISTINCT trigger_name FROM information_schema.triggers \
			 WHERE trigger_schema = 'public' ORDER BY trigger_name",
		)
	}

	fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
		let rows = self
			.client
			.query(
				"SELECT c.column_name, c.data_type, EXISTS ( \
				   SELECT 1 FROM information_schema.table_constraints tc \
				   JOIN information_schema.key_column_usage kcu \
				     ON tc.constraint_name = kcu.constraint_name \
				   WHERE tc.table_name = c.table_name \
				     AND tc.constraint_type = 'PRIMARY KEY' \
				     AND kcu.column_name = c.column_name) AS primary_key, \
				 c.is_nullable \
				 FROM information_schema.columns c \
				 WHERE c.table_schema = 'public' AND c.table_name = $1 \
				 ORDER BY c.ordinal_position",
				&[&table],
			)
			.map_err(map_error)?;
		if rows.is_empty() {
			return Err(Error::new(ErrorKind::MissingTable, format!("no such table {}", table)));
		}
		rows.into_iter()
			.map(|row| {
				let name: String = row.try_get(0).map_err(map_error)?;
				let data_type: String = row.try_get(1).map_err(map_error)?;
				let primary_key: bool = row.try_get(2).map_err(map_error)?;
				let nullable: String = row.try_get(3).map_err(map_error)?;
				Ok(ColumnInfo {
					name,
					kind: if primary_key {
						ValueType::PrimaryKey
					} else {
						map_data_type(&data_type)
					},
					primary_key,
					not_null: nullable == "NO",
				})
			})
			.collect()
	}
}

impl PostgresConnection {
	fn name_query(&mut self, sql: &str) -> Result<Vec<String>> {
		let rows = self.client.query(sql, &[]).map_err(map_error)?;
		rows.into_iter()
			.map(|row| row.try_get::<_, String>(0).map_err(map_error))
			.collect()
	}
}

fn config_for(server: &ServerSpec, database: &str) -> Config {
	let mut config = Config::new();
	config
		.host(&server.host)
		.user(&server.user)
		.password(server.password.reveal())
		.dbname(database)
		// Server notices are of no interest here.
		.notice_callback(|_notice| {});
	config
}

struct PostgresInterrupter {
	token: postgres::CancelToken,
}

impl Interrupter for PostgresInterrupter {
	fn interrupt(&self) {
		// Best effort; a failed cancellation leaves the statement to
		// finish normally.
		let _ = self.token.cancel_query(NoTls);
	}
}

fn bind_value(value: &Value, ty: &Type) -> Result<Box<dyn ToSql + Sync + Send>> {
	let mismatch = |value: &Value| {
		Err(Error::new(
			ErrorKind::Bind,
			format!("cannot bind {:?} as {}", value.value_type(), ty),
		))
	};
	Ok(match *ty {
		Type::INT2 => match value {
			Value::Null => Box::new(None::<i16>),
			other => match other.as_i64() {
				Some(v) => Box::new(v as i16),
				None => return mismatch(other),
			},
		},
		Type::INT4 => match value {
			Value::Null => Box::new(None::<i32>),
			other => match other.as_i64() {
				Some(v) => Box::new(v as i32),
				None => return mismatch(other),
			},
		},
		Type::INT8 | Type::OID => match value {
			Value::Null => Box::new(None::<i64>),
			other => match other.as_i64() {
				Some(v) => Box::new(v),
				None => return mismatch(other),
			},
		},
		Type::FLOAT4 => match value {
			Value::Null => Box::new(None::<f32>),
			other => match other.as_f64() {
				Some(v) => Box::new(v as f32),
				None => return mismatch(other),
			},
		},
		Type::FLOAT8 => match value {
			Value::Null => Box::new(None::<f64>),
			other => match other.as_f64() {
				Some(v) => Box::new(v),
				None => return mismatch(other),
			},
		},
		Type::BOOL => match value {
			Value::Null => Box::new(None::<bool>),
			other => match other.as_bool() {
				Some(v) => Box::new(v),
				None => return mismatch(other),
			},
		},
		Type::TIMESTAMP => match value {
			Value::Null => Box::new(None::<chrono::NaiveDateTime>),
			other => match other.as_i64().and_then(|s| DateTime::from_timestamp(s, 0)) {
				Some(stamp) => Box::new(stamp.naive_utc()),
				None => return mismatch(other),
			},
		},
		Type::TIMESTAMPTZ => match value {
			Value::Null => Box::new(None::<DateTime<Utc>>),
			other => match other.as_i64().and_then(|s| DateTime::from_timestamp(s, 0)) {
				Some(stamp) => Box::new(stamp),
				None => return mismatch(other),
			},
		},
		Type::BYTEA => match value {
			Value::Null => Box::new(None::<Vec<u8>>),
			Value::Blob(bytes) => Box::new(bytes.clone()),
			Value::String(text) => Box::new(text.clone().into_bytes()),
			other => return mismatch(other),
		},
		Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => match value {
			Value::Null => Box::new(None::<String>),
			Value::String(text) => Box::new(text.clone()),
			Value::CString(text) => Box::new((*text).to_owned()),
			Value::FullTextSearch(text) => Box::new(text.clone()),
			Value::Bool(v) => Box::new(if *v { "YES".to_owned() } else { "NO".to_owned() }),
			other => match other.as_i64() {
				Some(v) => Box::new(v.to_string()),
				None => return mismatch(other),
			},
		},
		_ => return mismatch(value),
	})
}

fn row_values(row: &postgres::Row) -> Result<Vec<Value>> {
	let mut values = Vec::with_capacity(row.len());
	for (index, column) in row.columns().iter().enumerate() {
		let value = match *column.type_() {
			Type::INT2 => row
				.try_get::<_, Option<i16>>(index)
				.map_err(map_error)?
				.map_or(Value::Null, |v| Value::Int64(v as i64)),
			Type::INT4 => row
				.try_get::<_, Option<i32>>(index)
				.map_err(map_error)?
				.map_or(Value::Null, |v| Value::Int64(v as i64)),
			Type::INT8 | Type::OID => row
				.try_get::<_, Option<i64>>(index)
				.map_err(map_error)?
				.map_or(Value::Null, Value::Int64),
			Type::FLOAT4 => row
				.try_get::<_, Option<f32>>(index)
				.map_err(map_error)?
				.map_or(Value::Null, |v| Value::Double(v as f64)),
			Type::FLOAT8 => row
				.try_get::<_, Option<f64>>(index)
				.map_err(map_error)?
				.map_or(Value::Null, Value::Double),
			Type::BOOL => row
				.try_get::<_, Option<bool>>(index)
				.map_err(map_error)?
				.map_or(Value::Null, Value::Bool),
			Type::TIMESTAMP => row
				.try_get::<_, Option<chrono::NaiveDateTime>>(index)
				.map_err(map_error)?
				.map_or(Value::Null, |v| Value::DateTime(v.and_utc().timestamp())),
			Type::TIMESTAMPTZ => row
				.try_get::<_, Option<DateTime<Utc>>>(index)
				.map_err(map_error)?
				.map_or(Value::Null, |v| Value::DateTime(v.timestamp())),
			Type::BYTEA => row
				.try_get::<_, Option<Vec<u8>>>(index)
				.map_err(map_error)?
				.map_or(Value::Null, Value::Blob),
			_ => row
				.try_get::<_, Option<String>>(index)
				.map_err(map_error)?
				.map_or(Value::Null, Value::String),
		};
		values.push(value);
	}
	Ok(values)
}

fn map_data_type(data_type: &str) -> ValueType {
	match data_type.to_ascii_lowercase().as_str() {
		"boolean" => ValueType::Bool,
		"smallint" | "integer" | "bigint" => ValueType::Int64,
		"real" | "double precision" | "numeric" => ValueType::Double,
		"bytea" => ValueType::Blob,
		other if other.starts_with("timestamp") || other == "date" => ValueType::DateTime,
		_ => ValueType::String,
	}
}

pub(crate) fn map_error(err: postgres::Error) -> Error {
	use postgres::error::SqlState;
	if let Some(state) = err.code() {
		let kind = if *state == SqlState::LOCK_NOT_AVAILABLE ||
			*state == SqlState::T_R_DEADLOCK_DETECTED ||
			*state == SqlState::T_R_SERIALIZATION_FAILURE
		{
			ErrorKind::Busy
		} else if *state == SqlState::QUERY_CANCELED {
			ErrorKind::Interrupted
		} else if *state == SqlState::INVALID_PASSWORD {
			ErrorKind::InvalidPassword
		} else if *state == SqlState::INVALID_AUTHORIZATION_SPECIFICATION ||
			*state == SqlState::INSUFFICIENT_PRIVILEGE
		{
			ErrorKind::Authorization
		} else if *state == SqlState::INVALID_CATALOG_NAME {
			ErrorKind::NotFound
		} else if *state == SqlState::UNDEFINED_TABLE {
			ErrorKind::MissingTable
		} else if *state == SqlState::UNDEFINED_COLUMN {
			ErrorKind::MissingColumn
		} else if *state == SqlState::UNIQUE_VIOLATION ||
			*state == SqlState::DUPLICATE_DATABASE ||
			*state == SqlState::DUPLICATE_TABLE
		{
			ErrorKind::Exists
		} else {
			ErrorKind::Database
		};
		let message = err
			.as_db_error()
			.map(|db| db.message().to_owned())
			.unwrap_or_else(|| err.to_string());
		return Error::new(kind, format!("{} ({})", message, state.code()));
	}
	if err.is_closed() {
		return Error::new(ErrorKind::ConnectionLost, err.to_string());
	}
	Error::new(ErrorKind::Database, err.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn data_types_map_to_storage_classes() {
		assert_eq!(map_data_type("bigint"), ValueType::Int64);
		assert_eq!(map_data_type("timestamp without time zone"), ValueType::DateTime);
		assert_eq!(map_data_type("character varying"), ValueType::String);
		assert_eq!(map_data_type("bytea"), ValueType::Blob);
	}

	#[test]
	fn binds_cover_the_expected_type_pairs() {
		assert!(bind_value(&Value::Bool(true), &Type::TEXT).is_ok());
		assert!(bind_value(&Value::Bool(true), &Type::BOOL).is_ok());
		assert!(bind_value(&Value::DateTime(1_700_000_000), &Type::TIMESTAMP).is_ok());
		assert!(bind_value(&Value::Null, &Type::INT8).is_ok());
	}

	#[test]
	fn unbindable_combinations_are_reported() {
		let err = bind_value(&Value::Blob(vec![1]), &Type::INT8).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::Bind);
	}
}
