// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! High-level operations: thin adapters that assemble columns, filters
//! and values and delegate to the statement façade under the right lock.

use log::debug;

use crate::builder::{self, SelectParts};
use crate::driver::Dialect;
use crate::error::{Error, ErrorKind, Result};
use crate::handle::Handle;
use crate::node::LockKind;
use crate::options::{CompareFlags, Flags, UNLIMITED};
use crate::statement::{Row, Statement};
use crate::value::{Column, ColumnInfo, Filter, Value, ValueType};

impl Handle {
	/// SELECT with a row-function callback. Multiple tables in `parts`
	/// are joined with `UNION SELECT`; the filter binds repeat per
	/// branch. The callback returns `false` to stop fetching. Returns
	/// the number of rows delivered.
	pub fn get<F>(
		&mut self,
		flags: Flags,
		parts: &SelectParts<'_>,
		filters: &[Filter],
		row_fn: F,
	) -> Result<u64>
	where
		F: FnMut(&Row<'_>) -> Result<bool>,
	{
		let (fragment, binds) = expand(parts.filter, filters)?;
		let parts = SelectParts { filter: fragment.as_deref(), ..*parts };
		let built = builder::select(self.dialect(), &parts);
		let branches = parts.tables.len();
		let columns = parts.columns.to_vec();

		let guard = self.lock_default(LockKind::Read)?;
		let mut statement = Statement::prepare(self, built, columns, flags)?;
		for _ in 0..branches {
			statement.bind_filters(binds.clone())?;
		}
		let rows = statement.query(row_fn);
		drop(guard);
		rows
	}

	/// Single-row INSERT. Returns the id the engine assigned, where the
	/// back-end reports one. `conflict_columns` names the uniqueness
	/// target for [`Flags::REPLACE`] on the PostgreSQL back-end.
	pub fn insert(
		&mut self,
		flags: Flags,
		table: &str,
		columns: &[Column],
		values: &[Value],
		conflict_columns: &[&str],
	) -> Result<Option<i64>> {
		let built =
			builder::insert(self.dialect(), table, columns, values, flags, conflict_columns)?;
		let guard = self.lock_default(LockKind::ReadWrite)?;
		let mut statement = Statement::prepare(self, built, Vec::new(), flags)?;
		statement.bind_values(columns, values)?;
		statement.execute()?;
		let id = statement.last_insert_id();
		drop(guard);
		Ok(id)
	}

	/// INSERT…SELECT. Returns the number of rows inserted.
	pub fn insert_select(
		&mut self,
		flags: Flags,
		table: &str,
		columns: &[Column],
		parts: &SelectParts<'_>,
		filters: &[Filter],
	) -> Result<u64> {
		let (fragment, binds) = expand(parts.filter, filters)?;
		let parts = SelectParts { filter: fragment.as_deref(), ..*parts };
		let built = builder::insert_select(self.dialect(), table, columns, &parts, flags);
		let branches = parts.tables.len();

		let guard = self.lock_default(LockKind::ReadWrite)?;
		let mut statement = Statement::prepare(self, built, Vec::new(), flags)?;
		for _ in 0..branches {
			statement.bind_filters(binds.clone())?;
		}
		let rows = statement.execute();
		drop(guard);
		rows
	}

	/// WHERE-based UPDATE. Returns the number of rows changed.
	pub fn update(
		&mut self,
		flags: Flags,
		table: &str,
		columns: &[Column],
		values: &[Value],
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<u64> {
		let (fragment, binds) = expand(filter, filters)?;
		let built =
			builder::update(self.dialect(), table, columns, values, fragment.as_deref());
		let guard = self.lock_default(LockKind::ReadWrite)?;
		let mut statement = Statement::prepare(self, built, Vec::new(), flags)?;
		statement.bind_values(columns, values)?;
		statement.bind_filters(binds)?;
		let rows = statement.execute();
		drop(guard);
		rows
	}

	/// WHERE-based DELETE. `limit` restricts the embedded back-end
	/// only; server callers pre-restrict via the filter.
	pub fn delete(
		&mut self,
		flags: Flags,
		table: &str,
		filter: Option<&str>,
		filters: &[Filter],
		limit: u64,
	) -> Result<u64> {
		let (fragment, binds) = expand(filter, filters)?;
		let built = builder::delete(self.dialect(), table, fragment.as_deref(), limit);
		let guard = self.lock_default(LockKind::ReadWrite)?;
		let mut statement = Statement::prepare(self, built, Vec::new(), flags)?;
		statement.bind_filters(binds)?;
		let rows = statement.execute();
		drop(guard);
		rows
	}

	/// Delete the rows whose `column` matches any of `ids`. Serial
	/// per-id deletes inside one write-locked scope.
	pub fn delete_by_ids(
		&mut self,
		flags: Flags,
		table: &str,
		column: &str,
		ids: &[i64],
	) -> Result<u64> {
		let filter = format!("{} = ?", builder::quote_name(self.dialect(), column));
		let built = builder::delete(self.dialect(), table, Some(&filter), UNLIMITED);
		let guard = self.lock_default(LockKind::ReadWrite)?;
		let mut deleted = 0;
		for &id in ids {
			let mut statement = Statement::prepare(self, built.clone(), Vec::new(), flags)?;
			statement.bind_filters(vec![Value::Key(id)])?;
			deleted += statement.execute()?;
		}
		drop(guard);
		Ok(deleted)
	}

	/// Whether any row matches the filter.
	pub fn exists(&mut self, table: &str, filter: Option<&str>, filters: &[Filter]) -> Result<bool> {
		let columns = [Column::new("1", ValueType::Int32)];
		let mut found = false;
		self.get(
			Flags::empty(),
			&SelectParts {
				filter,
				limit: 1,
				..SelectParts::new(&[table], &columns)
			},
			filters,
			|_row| {
				found = true;
				Ok(false)
			},
		)?;
		Ok(found)
	}

	/// First row's first column of a single-column SELECT, or `None` on
	/// an empty result.
	pub fn get_scalar(
		&mut self,
		table: &str,
		column: Column,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<Option<Value>> {
		let columns = [column];
		let mut value = None;
		self.get(
			Flags::empty(),
			&SelectParts {
				filter,
				limit: 1,
				..SelectParts::new(&[table], &columns)
			},
			filters,
			|row| {
				value = Some(row.get(0).clone());
				Ok(false)
			},
		)?;
		Ok(value)
	}

	/// Row id of the first match.
	pub fn get_id(
		&mut self,
		table: &str,
		column: &str,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<Option<i64>> {
		let value = self.get_scalar(table, Column::new(column, ValueType::Key), filter, filters)?;
		Ok(value.and_then(|v| v.as_i64()))
	}

	/// Row ids of every match.
	pub fn get_ids(
		&mut self,
		table: &str,
		column: &str,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<Vec<i64>> {
		let columns = [Column::new(column, ValueType::Key)];
		let mut ids = Vec::new();
		self.get(
			Flags::empty(),
			&SelectParts { filter, ..SelectParts::new(&[table], &columns) },
			filters,
			|row| {
				if let Some(id) = row.get(0).as_i64() {
					ids.push(id);
				}
				Ok(true)
			},
		)?;
		Ok(ids)
	}

	/// Largest id in `column`, 0 when the table is empty.
	pub fn get_max_id(
		&mut self,
		table: &str,
		column: &str,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<i64> {
		let expr = format!("MAX({})", builder::quote_name(self.dialect(), column));
		let value = self.get_scalar(table, Column::new(expr, ValueType::Key), filter, filters)?;
		Ok(value.and_then(|v| v.as_i64()).unwrap_or(0))
	}

	/// First match coerced to `i32`; 0 on an empty result.
	pub fn get_int(
		&mut self,
		table: &str,
		column: &str,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<i32> {
		Ok(self
			.get_scalar(table, Column::new(column, ValueType::Int32), filter, filters)?
			.and_then(|v| v.as_i64())
			.unwrap_or(0) as i32)
	}

	/// First match coerced to `u32`; 0 on an empty result.
	pub fn get_uint(
		&mut self,
		table: &str,
		column: &str,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<u32> {
		Ok(self
			.get_scalar(table, Column::new(column, ValueType::UInt32), filter, filters)?
			.and_then(|v| v.as_u64())
			.unwrap_or(0) as u32)
	}

	/// First match coerced to `i64`; 0 on an empty result.
	pub fn get_int64(
		&mut self,
		table: &str,
		column: &str,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<i64> {
		Ok(self
			.get_scalar(table, Column::new(column, ValueType::Int64), filter, filters)?
			.and_then(|v| v.as_i64())
			.unwrap_or(0))
	}

	/// First match coerced to `u64`; 0 on an empty result.
	pub fn get_uint64(
		&mut self,
		table: &str,
		column: &str,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<u64> {
		Ok(self
			.get_scalar(table, Column::new(column, ValueType::UInt64), filter, filters)?
			.and_then(|v| v.as_u64())
			.unwrap_or(0))
	}

	/// First match coerced to `f64`; 0.0 on an empty result.
	pub fn get_double(
		&mut self,
		table: &str,
		column: &str,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<f64> {
		Ok(self
			.get_scalar(table, Column::new(column, ValueType::Double), filter, filters)?
			.and_then(|v| v.as_f64())
			.unwrap_or(0.0))
	}

	/// First match as text; empty on an empty result.
	pub fn get_string(
		&mut self,
		table: &str,
		column: &str,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<String> {
		Ok(self
			.get_scalar(table, Column::new(column, ValueType::String), filter, filters)?
			.and_then(|v| v.as_str().map(str::to_owned))
			.unwrap_or_default())
	}

	/// Set one integer column on the matching rows.
	pub fn set_int(
		&mut self,
		table: &str,
		column: &str,
		value: i32,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<()> {
		self.set_value(table, Column::new(column, ValueType::Int32), Value::Int32(value), filter, filters)
	}

	/// Set one unsigned column on the matching rows.
	pub fn set_uint(
		&mut self,
		table: &str,
		column: &str,
		value: u32,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<()> {
		self.set_value(table, Column::new(column, ValueType::UInt32), Value::UInt32(value), filter, filters)
	}

	/// Set one 64-bit integer column on the matching rows.
	pub fn set_int64(
		&mut self,
		table: &str,
		column: &str,
		value: i64,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<()> {
		self.set_value(table, Column::new(column, ValueType::Int64), Value::Int64(value), filter, filters)
	}

	/// Set one unsigned 64-bit column on the matching rows.
	pub fn set_uint64(
		&mut self,
		table: &str,
		column: &str,
		value: u64,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<()> {
		self.set_value(table, Column::new(column, ValueType::UInt64), Value::UInt64(value), filter, filters)
	}

	/// Set one float column on the matching rows.
	pub fn set_double(
		&mut self,
		table: &str,
		column: &str,
		value: f64,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<()> {
		self.set_value(table, Column::new(column, ValueType::Double), Value::Double(value), filter, filters)
	}

	/// Set one text column on the matching rows.
	pub fn set_string(
		&mut self,
		table: &str,
		column: &str,
		value: &str,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<()> {
		self.set_value(
			table,
			Column::new(column, ValueType::String),
			Value::String(value.to_owned()),
			filter,
			filters,
		)
	}

	fn set_value(
		&mut self,
		table: &str,
		column: Column,
		value: Value,
		filter: Option<&str>,
		filters: &[Filter],
	) -> Result<()> {
		self.update(Flags::empty(), table, &[column], &[value], filter, filters)?;
		Ok(())
	}

	/// Add `column` to `table` with a default for existing rows.
	pub fn add_column(&mut self, table: &str, column: &Column, default: &Value) -> Result<()> {
		let dialect = self.dialect();
		let sql = format!(
			"ALTER TABLE {} ADD COLUMN {} {} DEFAULT {}",
			table,
			builder::quote_name(dialect, &column.name),
			sql_type(dialect, column.kind),
			literal(default),
		);
		let guard = self.lock_default(LockKind::ReadWrite)?;
		let result = self.connection().execute_batch(&sql);
		drop(guard);
		result
	}

	/// Remove `column` from `table`. The embedded engine has no native
	/// drop-column, so the table is rebuilt via CREATE/COPY/DROP/RENAME
	/// inside one write-locked scope.
	pub fn remove_column(&mut self, table: &str, column: &str) -> Result<()> {
		let dialect = self.dialect();
		if dialect != Dialect::Sqlite {
			let sql = format!(
				"ALTER TABLE {} DROP COLUMN {}",
				table,
				builder::quote_name(dialect, column)
			);
			let guard = self.lock_default(LockKind::ReadWrite)?;
			let result = self.connection().execute_batch(&sql);
			drop(guard);
			return result;
		}

		let guard = self.lock_default(LockKind::ReadWrite)?;
		let result = (|| {
			let kept: Vec<ColumnInfo> = self
				.connection()
				.table_columns(table)?
				.into_iter()
				.filter(|info| !info.name.eq_ignore_ascii_case(column))
				.collect();
			if kept.is_empty() {
				return Err(Error::new(
					ErrorKind::MissingColumn,
					format!("{}.{} is the only column", table, column),
				));
			}

			let mut definitions = Vec::with_capacity(kept.len());
			let mut names = Vec::with_capacity(kept.len());
			for info in &kept {
				let quoted = builder::quote_name(dialect, &info.name);
				let mut definition = if info.primary_key {
					format!("{} INTEGER PRIMARY KEY", quoted)
				} else {
					format!("{} {}", quoted, sql_type(dialect, info.kind))
				};
				if info.not_null && !info.primary_key {
					definition.push_str(" NOT NULL");
				}
				definitions.push(definition);
				names.push(quoted);
			}
			let names = names.join(", ");
			let sql = format!(
				"DROP TABLE IF EXISTS __migrate; \
				 CREATE TABLE __migrate ({defs}); \
				 INSERT INTO __migrate ({names}) SELECT {names} FROM {table}; \
				 DROP TABLE {table}; \
				 ALTER TABLE __migrate RENAME TO {table};",
				defs = definitions.join(", "),
				names = names,
				table = table,
			);
			debug!("rebuilding {} without column {}", table, column);
			self.connection().execute_batch(&sql)
		})();
		drop(guard);
		result
	}

	/// Names of the tables of the current database.
	pub fn table_list(&mut self) -> Result<Vec<String>> {
		let guard = self.lock_default(LockKind::Read)?;
		let names = self.connection().table_names();
		drop(guard);
		names
	}

	/// Names of the views of the current database.
	pub fn view_list(&mut self) -> Result<Vec<String>> {
		let guard = self.lock_default(LockKind::Read)?;
		let names = self.connection().view_names();
		drop(guard);
		names
	}

	/// Names of the indexes of the current database.
	pub fn index_list(&mut self) -> Result<Vec<String>> {
		let guard = self.lock_default(LockKind::Read)?;
		let names = self.connection().index_names();
		drop(guard);
		names
	}

	/// Names of the triggers of the current database.
	pub fn trigger_list(&mut self) -> Result<Vec<String>> {
		let guard = self.lock_default(LockKind::Read)?;
		let names = self.connection().trigger_names();
		drop(guard);
		names
	}

	/// Column descriptions of `table`.
	pub fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
		let guard = self.lock_default(LockKind::Read)?;
		let columns = self.connection().table_columns(table);
		drop(guard);
		columns
	}

	/// Run one or more statements that bind nothing and return no rows
	/// (DDL, session setup) under a write lock. Unlike the prepared
	/// paths this goes over the driver's plain-text channel, which every
	/// back-end accepts for any statement kind.
	pub fn batch(&mut self, sql: &str) -> Result<()> {
		let guard = self.lock_default(LockKind::ReadWrite)?;
		let result = self.connection().execute_batch(sql);
		drop(guard);
		result
	}

	/// Run caller-supplied SQL verbatim as a row-returning statement.
	pub fn query_raw<F>(
		&mut self,
		flags: Flags,
		sql: &str,
		filters: &[Filter],
		row_fn: F,
	) -> Result<u64>
	where
		F: FnMut(&Row<'_>) -> Result<bool>,
	{
		let (fragment, binds) = expand(Some(sql), filters)?;
		let built = builder::plain(self.dialect(), fragment.as_deref().unwrap_or(sql));
		let guard = self.lock_default(LockKind::Read)?;
		let mut statement = Statement::prepare(self, built, Vec::new(), flags | Flags::PLAIN)?;
		statement.bind_filters(binds)?;
		let rows = statement.query(row_fn);
		drop(guard);
		rows
	}

	/// Run caller-supplied SQL verbatim as a modification statement.
	pub fn execute_raw(&mut self, flags: Flags, sql: &str, filters: &[Filter]) -> Result<u64> {
		let (fragment, binds) = expand(Some(sql), filters)?;
		let built = builder::plain(self.dialect(), fragment.as_deref().unwrap_or(sql));
		let guard = self.lock_default(LockKind::ReadWrite)?;
		let mut statement = Statement::prepare(self, built, Vec::new(), flags | Flags::PLAIN)?;
		statement.bind_filters(binds)?;
		let rows = statement.execute();
		drop(guard);
		rows
	}
}

fn expand(filter: Option<&str>, filters: &[Filter]) -> Result<(Option<String>, Vec<Value>)> {
	match filter {
		Some(fragment) => {
			let (fragment, binds) = builder::expand_filters(fragment, filters)?;
			Ok((Some(fragment), binds))
		},
		None if filters.is_empty() => Ok((None, Vec::new())),
		None => Err(Error::new(ErrorKind::Bind, "filter values without a filter expression")),
	}
}

/// Column type rendering for DDL per dialect.
fn sql_type(dialect: Dialect, kind: ValueType) -> &'static str {
	match (dialect, kind) {
		(Dialect::Sqlite, ValueType::PrimaryKey | ValueType::Key) => "INTEGER",
		(Dialect::Sqlite, ValueType::Bool) => "INTEGER",
		(Dialect::Sqlite, ValueType::Int32 | ValueType::UInt32 | ValueType::Enum) => "INTEGER",
		(Dialect::Sqlite, ValueType::Int64 | ValueType::UInt64) => "INTEGER",
		(Dialect::Sqlite, ValueType::Double) => "REAL",
		(Dialect::Sqlite, ValueType::DateTime) => "INTEGER",
		(Dialect::Sqlite, ValueType::Blob) => "BLOB",
		(Dialect::Sqlite, _) => "TEXT",

		(Dialect::MariaDb, ValueType::PrimaryKey | ValueType::Key) => "BIGINT",
		(Dialect::MariaDb, ValueType::Bool) => "TINYINT",
		(Dialect::MariaDb, ValueType::Int32) => "INT",
		(Dialect::MariaDb, ValueType::UInt32 | ValueType::Enum) => "INT UNSIGNED",
		(Dialect::MariaDb, ValueType::Int64) => "BIGINT",
		(Dialect::MariaDb, ValueType::UInt64) => "BIGINT UNSIGNED",
		(Dialect::MariaDb, ValueType::Double) => "DOUBLE",
		(Dialect::MariaDb, ValueType::DateTime) => "DATETIME",
		(Dialect::MariaDb, ValueType::Blob) => "LONGBLOB",
		(Dialect::MariaDb, _) => "TEXT",

		(Dialect::PostgreSql, ValueType::PrimaryKey | ValueType::Key) => "BIGINT",
		(Dialect::PostgreSql, ValueType::Bool) => "BOOLEAN",
		(Dialect::PostgreSql, ValueType::Int32) => "INT",
		(Dialect::PostgreSql, ValueType::UInt32 | ValueType::Enum) => "BIGINT",
		(Dialect::PostgreSql, ValueType::Int64 | ValueType::UInt64) => "BIGINT",
		(Dialect::PostgreSql, ValueType::Double) => "DOUBLE PRECISION",
		(Dialect::PostgreSql, ValueType::DateTime) => "TIMESTAMP",
		(Dialect::PostgreSql, ValueType::Blob) => "BYTEA",
		(Dialect::PostgreSql, _) => "TEXT",
	}
}

/// Literal rendering of a default value for DDL.
fn literal(value: &Value) -> String {
	match value {
		Value::Null => "NULL".to_owned(),
		Value::String(s) => format!("'{}'", s.replace('\'', "''")),
		Value::CString(s) => format!("'{}'", s.replace('\'', "''")),
		Value::Double(v) => v.to_string(),
		other => other.as_i64().unwrap_or(0).to_string(),
	}
}

/// Cross-check the schemas of `target` against `reference` column by
/// column. Names compare case-insensitively. Returns one error per
/// difference; an empty list means the schemas agree.
pub fn compare(
	reference: &mut Handle,
	target: &mut Handle,
	flags: CompareFlags,
) -> Result<Vec<Error>> {
	let mut report = Vec::new();
	let reference_tables = reference.table_list()?;
	let target_tables = target.table_list()?;

	for table in &reference_tables {
		if !contains_name(&target_tables, table) {
			report.push(Error::new(ErrorKind::MissingTable, format!("table {}", table)));
			continue;
		}
		let reference_columns = reference.table_columns(table)?;
		let target_columns = target.table_columns(table)?;
		for column in &reference_columns {
			match find_column(&target_columns, &column.name) {
				None => report.push(Error::new(
					ErrorKind::MissingColumn,
					format!("column {}.{}", table, column.name),
				)),
				Some(found) if !types_compatible(column.kind, found.kind) => {
					report.push(Error::new(
						ErrorKind::TypeMismatch,
						format!(
							"column {}.{}: {:?} vs {:?}",
							table, column.name, column.kind, found.kind
						),
					))
				},
				Some(_) => {},
			}
		}
		if !flags.contains(CompareFlags::IGNORE_OBSOLETE) {
			for column in &target_columns {
				if find_column(&reference_columns, &column.name).is_none() {
					report.push(Error::new(
						ErrorKind::ObsoleteColumn,
						format!("column {}.{}", table, column.name),
					));
				}
			}
		}
	}

	if !flags.contains(CompareFlags::IGNORE_OBSOLETE) {
		for table in &target_tables {
			if !contains_name(&reference_tables, table) {
				report.push(Error::new(ErrorKind::ObsoleteTable, format!("table {}", table)));
			}
		}
	}
	Ok(report)
}

fn contains_name(names: &[String], name: &str) -> bool {
	names.iter().any(|candidate| candidate.eq_ignore_ascii_case(name))
}

fn find_column<'a>(columns: &'a [ColumnInfo], name: &str) -> Option<&'a ColumnInfo> {
	columns.iter().find(|column| column.name.eq_ignore_ascii_case(name))
}

/// Storage classes that compare equal across back-ends.
fn types_compatible(a: ValueType, b: ValueType) -> bool {
	fn family(kind: ValueType) -> u8 {
		match kind {
			ValueType::PrimaryKey |
			ValueType::Key |
			ValueType::Bool |
			ValueType::Int32 |
			ValueType::Int64 |
			ValueType::UInt32 |
			ValueType::UInt64 |
			ValueType::Enum |
			ValueType::DateTime => 0,
			ValueType::Double => 1,
			ValueType::String | ValueType::CString | ValueType::FullTextSearch => 2,
			ValueType::Blob => 3,
			ValueType::None | ValueType::KeyArray => 4,
		}
	}
	family(a) == family(b)
}
