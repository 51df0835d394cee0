// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Assembles back-end-neutral SQL strings.
//!
//! The builder produces the final statement text and the number of
//! placeholders it expects. Placeholder syntax (`?` vs `$n`), reserved
//! name quoting, date-time projection wrapping and the `%1..%9`
//! temporary-table short-hand are the only dialect-specific parts; the
//! rest of the statement is identical across back-ends.

use crate::driver::Dialect;
use crate::error::{Error, ErrorKind, Result};
use crate::options::{Flags, UNLIMITED};
use crate::value::{Column, Filter, Value, ValueType};

/// An assembled statement and the number of parameters it binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Built {
	/// Final statement text.
	pub sql: String,
	/// Placeholders counted outside string literals.
	pub placeholders: usize,
}

/// Inputs of a SELECT (and of the SELECT half of INSERT…SELECT).
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectParts<'a> {
	/// One table, or several joined with `UNION SELECT`.
	pub tables: &'a [&'a str],
	/// Projection; empty selects `*`.
	pub columns: &'a [Column],
	/// Filter fragment with `?` placeholders, or none.
	pub filter: Option<&'a str>,
	/// GROUP BY fragment.
	pub group_by: Option<&'a str>,
	/// ORDER BY fragment, applied to the whole result.
	pub order_by: Option<&'a str>,
	/// Rows to skip.
	pub offset: u64,
	/// Row cap; [`UNLIMITED`] for none.
	pub limit: u64,
}

impl<'a> SelectParts<'a> {
	/// Parts selecting everything from `tables`.
	pub fn new(tables: &'a [&'a str], columns: &'a [Column]) -> Self {
		Self { tables, columns, filter: None, group_by: None, order_by: None, offset: 0, limit: UNLIMITED }
	}
}

/// Build a SELECT across one or more tables.
pub fn select(dialect: Dialect, parts: &SelectParts<'_>) -> Built {
	finish(dialect, select_raw(dialect, parts))
}

fn select_raw(dialect: Dialect, parts: &SelectParts<'_>) -> String {
	let mut sql = String::new();
	for (i, table) in parts.tables.iter().enumerate() {
		if i > 0 {
			sql.push_str(" UNION ");
		}
		sql.push_str("SELECT ");
		push_projection(&mut sql, dialect, parts.columns);
		sql.push_str(" FROM ");
		sql.push_str(table);
		if let Some(filter) = parts.filter {
			sql.push_str(" WHERE ");
			sql.push_str(filter);
		}
		if let Some(group_by) = parts.group_by {
			sql.push_str(" GROUP BY ");
			sql.push_str(group_by);
		}
	}
	if let Some(order_by) = parts.order_by {
		sql.push_str(" ORDER BY ");
		sql.push_str(order_by);
	}
	push_window(&mut sql, parts.offset, parts.limit);
	sql
}

/// Build a single-row INSERT. `values` decides per slot whether a
/// placeholder or a spliced sub-SQL expression is emitted, so it must
/// match `columns` in length.
pub fn insert(
	dialect: Dialect,
	table: &str,
	columns: &[Column],
	values: &[Value],
	flags: Flags,
	conflict_columns: &[&str],
) -> Result<Built> {
	debug_assert_eq!(columns.len(), values.len());
	let mut sql = String::new();
	let head = match dialect {
		Dialect::Sqlite if flags.contains(Flags::REPLACE) => "INSERT OR REPLACE INTO ",
		Dialect::Sqlite if flags.contains(Flags::IGNORE) => "INSERT OR IGNORE INTO ",
		Dialect::MariaDb if flags.contains(Flags::REPLACE) => "REPLACE INTO ",
		Dialect::MariaDb if flags.contains(Flags::IGNORE) => "INSERT IGNORE INTO ",
		_ => "INSERT INTO ",
	};
	sql.push_str(head);
	sql.push_str(table);
	sql.push_str(" (");
	for (i, column) in columns.iter().enumerate() {
		if i > 0 {
			sql.push_str(", ");
		}
		sql.push_str(&quote_name(dialect, &column.name));
	}
	sql.push_str(") VALUES (");
	for (i, value) in values.iter().enumerate() {
		if i > 0 {
			sql.push_str(", ");
		}
		match value {
			Value::Expression(expr) => {
				sql.push('(');
				sql.push_str(expr);
				sql.push(')');
			},
			_ => sql.push('?'),
		}
	}
	sql.push(')');

	if dialect == Dialect::PostgreSql {
		if flags.contains(Flags::REPLACE) {
			if conflict_columns.is_empty() {
				return Err(Error::new(
					ErrorKind::Bind,
					"replace on this back-end requires conflict columns",
				));
			}
			sql.push_str(" ON CONFLICT (");
			for (i, name) in conflict_columns.iter().enumerate() {
				if i > 0 {
					sql.push_str(", ");
				}
				sql.push_str(&quote_name(dialect, name));
			}
			sql.push_str(") DO UPDATE SET ");
			let mut first = true;
			for column in columns {
				if conflict_columns.iter().any(|c| c.eq_ignore_ascii_case(&column.name)) {
					continue;
				}
				if !first {
					sql.push_str(", ");
				}
				first = false;
				let quoted = quote_name(dialect, &column.name);
				sql.push_str(&quoted);
				sql.push_str(" = EXCLUDED.");
				sql.push_str(&quoted);
			}
		} else if flags.contains(Flags::IGNORE) {
			sql.push_str(" ON CONFLICT DO NOTHING");
		}
	}
	Ok(finish(dialect, sql))
}

/// Build an INSERT…SELECT from `parts` into `table`.
pub fn insert_select(
	dialect: Dialect,
	table: &str,
	columns: &[Column],
	parts: &SelectParts<'_>,
	flags: Flags,
) -> Built {
	let mut sql = String::new();
	let head = match dialect {
		Dialect::Sqlite if flags.contains(Flags::REPLACE) => "INSERT OR REPLACE INTO ",
		Dialect::Sqlite if flags.contains(Flags::IGNORE) => "INSERT OR IGNORE INTO ",
		Dialect::MariaDb if flags.contains(Flags::REPLACE) => "REPLACE INTO ",
		Dialect::MariaDb if flags.contains(Flags::IGNORE) => "INSERT IGNORE INTO ",
		_ => "INSERT INTO ",
	};
	sql.push_str(head);
	sql.push_str(table);
	sql.push_str(" (");
	for (i, column) in columns.iter().enumerate() {
		if i > 0 {
			sql.push_str(", ");
		}
		sql.push_str(&quote_name(dialect, &column.name));
	}
	sql.push_str(") ");
	sql.push_str(&select_raw(dialect, parts));
	if dialect == Dialect::PostgreSql && flags.contains(Flags::IGNORE) {
		sql.push_str(" ON CONFLICT DO NOTHING");
	}
	finish(dialect, sql)
}

/// Build an UPDATE of `columns` under an optional filter.
pub fn update(
	dialect: Dialect,
	table: &str,
	columns: &[Column],
	values: &[Value],
	filter: Option<&str>,
) -> Built {
	debug_assert_eq!(columns.len(), values.len());
	let mut sql = String::from("UPDATE ");
	sql.push_str(table);
	sql.push_str(" SET ");
	for (i, column) in columns.iter().enumerate() {
		if i > 0 {
			sql.push_str(", ");
		}
		sql.push_str(&quote_name(dialect, &column.name));
		sql.push_str(" = ");
		match &values[i] {
			Value::Expression(expr) => {
				sql.push('(');
				sql.push_str(expr);
				sql.push(')');
			},
			_ => sql.push('?'),
		}
	}
	if let Some(filter) = filter {
		sql.push_str(" WHERE ");
		sql.push_str(filter);
	}
	finish(dialect, sql)
}

/// Build a DELETE. A limit is honoured on the embedded engine only
/// (restricted through a rowid subquery, which every build accepts);
/// callers targeting a server must pre-restrict the filter.
pub fn delete(dialect: Dialect, table: &str, filter: Option<&str>, limit: u64) -> Built {
	let mut sql = String::from("DELETE FROM ");
	sql.push_str(table);
	if limit < UNLIMITED && dialect == Dialect::Sqlite {
		sql.push_str(" WHERE rowid IN (SELECT rowid FROM ");
		sql.push_str(table);
		if let Some(filter) = filter {
			sql.push_str(" WHERE ");
			sql.push_str(filter);
		}
		sql.push_str(&format!(" LIMIT {})", limit));
	} else if let Some(filter) = filter {
		sql.push_str(" WHERE ");
		sql.push_str(filter);
	}
	finish(dialect, sql)
}

/// Adapt pre-built SQL without re-assembling it: expand the `%1..%9`
/// short-hand, renumber placeholders for the dialect and count them.
pub fn plain(dialect: Dialect, sql: &str) -> Built {
	finish(dialect, sql.to_owned())
}

/// Substitute the filters into a filter fragment.
///
/// Placeholders are matched positionally. Row-id lists and sub-SQL
/// expressions are spliced into the text (no bind is consumed for
/// them); every other filter stays a placeholder and its value is
/// returned in bind order.
pub fn expand_filters(fragment: &str, filters: &[Filter]) -> Result<(String, Vec<Value>)> {
	let mut out = String::with_capacity(fragment.len());
	let mut binds = Vec::new();
	let mut index = 0;
	let mut chars = fragment.chars().peekable();
	let mut in_string = false;
	while let Some(c) = chars.next() {
		match c {
			'\\' if in_string => {
				// Escapes inside literals are preserved verbatim.
				out.push(c);
				if let Some(next) = chars.next() {
					out.push(next);
				}
			},
			'\'' => {
				in_string = !in_string;
				out.push(c);
			},
			'?' if !in_string => {
				let filter = filters.get(index).ok_or_else(|| {
					Error::new(
						ErrorKind::Bind,
						format!("filter expects more than {} values", filters.len()),
					)
				})?;
				index += 1;
				match &filter.value {
					Value::KeyArray(ids) => {
						let list: Vec<String> = ids.iter().map(i64::to_string).collect();
						out.push_str(&list.join(","));
					},
					Value::Expression(expr) => out.push_str(expr),
					value => {
						out.push('?');
						binds.push(value.clone().coerce(filter.kind)?);
					},
				}
			},
			_ => out.push(c),
		}
	}
	if index != filters.len() {
		return Err(Error::new(
			ErrorKind::Bind,
			format!("filter has {} placeholders but {} values", index, filters.len()),
		));
	}
	Ok((out, binds))
}

/// Quote `name` when it collides with a reserved word of `dialect`.
pub fn quote_name(dialect: Dialect, name: &str) -> String {
	let reserved: &[&str] = match dialect {
		Dialect::Sqlite => &["index", "order", "group", "limit", "offset"],
		Dialect::MariaDb => &["index", "order", "group", "key", "keys", "limit"],
		Dialect::PostgreSql => &["offset", "order", "group", "limit", "user", "end", "window"],
	};
	if reserved.iter().any(|word| name.eq_ignore_ascii_case(word)) {
		match dialect {
			Dialect::MariaDb => format!("`{}`", name),
			_ => format!("\"{}\"", name),
		}
	} else {
		name.to_owned()
	}
}

fn push_projection(sql: &mut String, dialect: Dialect, columns: &[Column]) {
	if columns.is_empty() {
		sql.push('*');
		return;
	}
	for (i, column) in columns.iter().enumerate() {
		if i > 0 {
			sql.push_str(", ");
		}
		let quoted = quote_name(dialect, &column.name);
		match column.kind {
			// Returned as UNIX seconds regardless of the storage type.
			ValueType::DateTime => {
				match dialect {
					Dialect::Sqlite | Dialect::MariaDb => {
						sql.push_str("UNIX_TIMESTAMP(");
						sql.push_str(&quoted);
						sql.push(')');
					},
					Dialect::PostgreSql => {
						// EXTRACT yields numeric; readers want int64.
						sql.push_str("CAST(EXTRACT(EPOCH FROM ");
						sql.push_str(&quoted);
						sql.push_str(") AS BIGINT)");
					},
				}
				sql.push_str(" AS ");
				sql.push_str(&quote_name(dialect, column.result_name()));
			},
			_ => {
				sql.push_str(&quoted);
				if let Some(alias) = &column.alias {
					sql.push_str(" AS ");
					sql.push_str(&quote_name(dialect, alias));
				}
			},
		}
	}
}

fn push_window(sql: &mut String, offset: u64, limit: u64) {
	if limit < UNLIMITED {
		sql.push_str(&format!(" LIMIT {}", limit));
	}
	if offset > 0 {
		sql.push_str(&format!(" OFFSET {}", offset));
	}
}

/// Final pass over the assembled text: expand the `%1..%9` short-hand
/// and renumber or count placeholders. String literals are copied
/// verbatim, escapes included.
fn finish(dialect: Dialect, sql: String) -> Built {
	let mut out = String::with_capacity(sql.len());
	let mut count = 0;
	let mut chars = sql.chars().peekable();
	let mut in_string = false;
	while let Some(c) = chars.next() {
		match c {
			'\\' if in_string => {
				out.push(c);
				if let Some(next) = chars.next() {
					out.push(next);
				}
			},
			'\'' => {
				in_string = !in_string;
				out.push(c);
			},
			'?' if !in_string => {
				count += 1;
				match dialect {
					Dialect::PostgreSql => out.push_str(&format!("${}", count)),
					_ => out.push('?'),
				}
			},
			'%' if !in_string => match chars.peek() {
				Some(&digit @ '1'..='9') => {
					chars.next();
					out.push_str("aux.temporary");
					out.push(digit);
				},
				_ => out.push(c),
			},
			_ => out.push(c),
		}
	}
	Built { sql: out, placeholders: count }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn select_single_table() {
		let columns = [Column::new("id", ValueType::Key), Column::new("name", ValueType::String)];
		let built = select(
			Dialect::Sqlite,
			&SelectParts {
				filter: Some("name = ?"),
				..SelectParts::new(&["entries"], &columns)
			},
		);
		assert_eq!(built.sql, "SELECT id, name FROM entries WHERE name = ?");
		assert_eq!(built.placeholders, 1);
	}

	#[test]
	fn union_select_renumbers_across_branches_on_postgresql() {
		let columns = [Column::new("id", ValueType::Key)];
		let built = select(
			Dialect::PostgreSql,
			&SelectParts {
				filter: Some("size > ? AND size < ?"),
				..SelectParts::new(&["a", "b"], &columns)
			},
		);
		assert_eq!(
			built.sql,
			"SELECT id FROM a WHERE size > $1 AND size < $2 UNION \
			 SELECT id FROM b WHERE size > $3 AND size < $4"
		);
		assert_eq!(built.placeholders, 4);
	}

	#[test]
	fn quoted_literals_are_skipped_when_counting() {
		let columns = [Column::new("id", ValueType::Key)];
		let built = select(
			Dialect::PostgreSql,
			&SelectParts {
				filter: Some("name = 'what?' AND note = 'it\\'s ?' AND size = ?"),
				..SelectParts::new(&["t"], &columns)
			},
		);
		assert_eq!(built.placeholders, 1);
		assert!(built.sql.ends_with("size = $1"));
		assert!(built.sql.contains("'it\\'s ?'"));
	}

	#[test]
	fn datetime_projection_is_wrapped_per_dialect() {
		let columns = [Column::new("updated", ValueType::DateTime)];
		let parts = SelectParts::new(&["t"], &columns);
		assert_eq!(
			select(Dialect::MariaDb, &parts).sql,
			"SELECT UNIX_TIMESTAMP(updated) AS updated FROM t"
		);
		assert_eq!(
			select(Dialect::PostgreSql, &parts).sql,
			"SELECT CAST(EXTRACT(EPOCH FROM updated) AS BIGINT) AS updated FROM t"
		);
	}

	#[test]
	fn reserved_names_are_quoted() {
		let columns = [Column::new("offset", ValueType::UInt64)];
		let built = select(Dialect::PostgreSql, &SelectParts::new(&["t"], &columns));
		assert_eq!(built.sql, "SELECT \"offset\" FROM t");
		let built = select(Dialect::MariaDb, &SelectParts::new(&["t"], &columns));
		assert_eq!(built.sql, "SELECT offset FROM t");
	}

	#[test]
	fn limit_and_offset_are_appended() {
		let columns = [Column::new("id", ValueType::Key)];
		let built = select(
			Dialect::Sqlite,
			&SelectParts { offset: 20, limit: 10, ..SelectParts::new(&["t"], &columns) },
		);
		assert_eq!(built.sql, "SELECT id FROM t LIMIT 10 OFFSET 20");
	}

	#[test]
	fn aux_shorthand_expands() {
		let columns = [Column::new("id", ValueType::Key)];
		let built = select(
			Dialect::Sqlite,
			&SelectParts {
				filter: Some("id IN (SELECT id FROM %1)"),
				..SelectParts::new(&["t"], &columns)
			},
		);
		assert_eq!(built.sql, "SELECT id FROM t WHERE id IN (SELECT id FROM aux.temporary1)");
	}

	#[test]
	fn insert_flag_variants() {
		let columns = [Column::new("id", ValueType::Key), Column::new("name", ValueType::String)];
		let values = [Value::Key(1), Value::String("x".into())];
		let built =
			insert(Dialect::Sqlite, "t", &columns, &values, Flags::IGNORE, &[]).unwrap();
		assert_eq!(built.sql, "INSERT OR IGNORE INTO t (id, name) VALUES (?, ?)");
		let built =
			insert(Dialect::MariaDb, "t", &columns, &values, Flags::REPLACE, &[]).unwrap();
		assert_eq!(built.sql, "REPLACE INTO t (id, name) VALUES (?, ?)");
		let built =
			insert(Dialect::PostgreSql, "t", &columns, &values, Flags::IGNORE, &[]).unwrap();
		assert_eq!(built.sql, "INSERT INTO t (id, name) VALUES ($1, $2) ON CONFLICT DO NOTHING");
	}

	#[test]
	fn postgresql_replace_builds_upsert() {
		let columns = [Column::new("id", ValueType::Key), Column::new("name", ValueType::String)];
		let values = [Value::Key(1), Value::String("x".into())];
		let built =
			insert(Dialect::PostgreSql, "t", &columns, &values, Flags::REPLACE, &["id"]).unwrap();
		assert_eq!(
			built.sql,
			"INSERT INTO t (id, name) VALUES ($1, $2) \
			 ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name"
		);
		let err = insert(Dialect::PostgreSql, "t", &columns, &values, Flags::REPLACE, &[]);
		assert_eq!(err.unwrap_err().kind(), ErrorKind::Bind);
	}

	#[test]
	fn insert_splices_expressions() {
		let columns = [Column::new("id", ValueType::Key), Column::new("stamp", ValueType::DateTime)];
		let values = [Value::Key(1), Value::Expression("NOW()".into())];
		let built = insert(Dialect::Sqlite, "t", &columns, &values, Flags::empty(), &[]).unwrap();
		assert_eq!(built.sql, "INSERT INTO t (id, stamp) VALUES (?, (NOW()))");
		assert_eq!(built.placeholders, 1);
	}

	#[test]
	fn update_and_delete() {
		let columns = [Column::new("name", ValueType::String)];
		let values = [Value::String("y".into())];
		let built = update(Dialect::Sqlite, "t", &columns, &values, Some("id = ?"));
		assert_eq!(built.sql, "UPDATE t SET name = ? WHERE id = ?");
		assert_eq!(built.placeholders, 2);

		let built = delete(Dialect::Sqlite, "t", Some("id = ?"), 1);
		assert_eq!(
			built.sql,
			"DELETE FROM t WHERE rowid IN (SELECT rowid FROM t WHERE id = ? LIMIT 1)"
		);
		assert_eq!(built.placeholders, 1);
		let built = delete(Dialect::MariaDb, "t", Some("id = ?"), 1);
		assert_eq!(built.sql, "DELETE FROM t WHERE id = ?");
	}

	#[test]
	fn expand_filters_splices_key_arrays() {
		let filters =
			[Filter::string("x"), Filter::keys(vec![1, 2, 3]), Filter::expression("MAX(id)")];
		let (fragment, binds) =
			expand_filters("name = ? AND id IN (?) AND top = ?", &filters).unwrap();
		assert_eq!(fragment, "name = ? AND id IN (1,2,3) AND top = MAX(id)");
		assert_eq!(binds, vec![Value::String("x".into())]);
	}

	#[test]
	fn expand_filters_rejects_count_mismatch() {
		let err = expand_filters("a = ? AND b = ?", &[Filter::int(1)]).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::Bind);
		let err = expand_filters("a = ?", &[Filter::int(1), Filter::int(2)]).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::Bind);
	}

	#[test]
	fn insert_select_unions_sources() {
		let dst = [Column::new("id", ValueType::Key)];
		let src = [Column::new("id", ValueType::Key)];
		let built = insert_select(
			Dialect::Sqlite,
			"target",
			&dst,
			&SelectParts::new(&["a", "b"], &src),
			Flags::empty(),
		);
		assert_eq!(built.sql, "INSERT INTO target (id) SELECT id FROM a UNION SELECT id FROM b");
	}
}
