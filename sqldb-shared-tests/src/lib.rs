// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Shared behavioural tests, executed against the real adapters. The
//! caller registers its connector first and passes the specifier to run
//! against; every test cleans up the objects it creates so one server
//! database can host the whole suite.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sqldb::builder::SelectParts;
use sqldb::{
	compare, copy_table, Column, CompareFlags, CopyCallbacks, CopyOptions, Dialect, ErrorKind,
	Filter, Flags, Handle, LockKind, OpenMode, ProgressHandler, Result, Specifier, Timeout,
	TransactionType, Value, ValueType, PRIMARY_KEY_ANY,
};

fn open(spec: &Specifier) -> Result<Handle> {
	sqldb::open(spec, OpenMode::READ_WRITE | OpenMode::CREATE, Timeout::ms(5000))
}

/// Identity column DDL per dialect.
fn id_column(dialect: Dialect) -> &'static str {
	match dialect {
		Dialect::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
		Dialect::MariaDb => "id BIGINT AUTO_INCREMENT PRIMARY KEY",
		Dialect::PostgreSql => "id BIGSERIAL PRIMARY KEY",
	}
}

/// Date-time column DDL per dialect.
fn datetime_column(dialect: Dialect) -> &'static str {
	match dialect {
		Dialect::Sqlite => "INTEGER",
		Dialect::MariaDb => "DATETIME",
		Dialect::PostgreSql => "TIMESTAMP",
	}
}

fn recreate(handle: &mut Handle, table: &str, body: &str) -> Result<()> {
	handle.batch(&format!("DROP TABLE IF EXISTS {}", table))?;
	handle.batch(&format!("CREATE TABLE {} ({})", table, body))
}

fn drop_table(handle: &mut Handle, table: &str) -> Result<()> {
	handle.batch(&format!("DROP TABLE IF EXISTS {}", table))
}

/// Values inserted through the façade come back equal modulo the
/// declared coercions.
pub fn test_round_trip(spec: &Specifier) -> Result<()> {
	let mut handle = open(spec)?;
	let dialect = handle.dialect();
	recreate(
		&mut handle,
		"sqldb_test_roundtrip",
		&format!(
			"{}, name TEXT, size BIGINT, flag {}, updated {}, ratio {}",
			id_column(dialect),
			if dialect == Dialect::PostgreSql { "BOOLEAN" } else { "INTEGER" },
			datetime_column(dialect),
			if dialect == Dialect::PostgreSql { "DOUBLE PRECISION" } else { "REAL" },
		),
	)?;

	let columns = [
		Column::new("name", ValueType::String),
		Column::new("size", ValueType::Int64),
		Column::new("flag", ValueType::Bool),
		Column::new("updated", ValueType::DateTime),
		Column::new("ratio", ValueType::Double),
	];
	let values = [
		Value::String("backup-1".into()),
		Value::Int64(4096),
		Value::Bool(true),
		Value::DateTime(1_700_000_000),
		Value::Double(0.5),
	];
	let id = handle
		.insert(Flags::empty(), "sqldb_test_roundtrip", &columns, &values, &[])?
		.expect("engine assigns an id");
	assert!(id > 0);

	let mut seen = Vec::new();
	handle.get(
		Flags::empty(),
		&SelectParts {
			filter: Some("id = ?"),
			..SelectParts::new(&["sqldb_test_roundtrip"], &columns)
		},
		&[Filter::key(id)],
		|row| {
			seen = row.values().to_vec();
			Ok(false)
		},
	)?;
	assert_eq!(
		seen,
		vec![
			Value::String("backup-1".into()),
			Value::Int64(4096),
			Value::Bool(true),
			Value::DateTime(1_700_000_000),
			Value::Double(0.5),
		]
	);
	drop_table(&mut handle, "sqldb_test_roundtrip")
}

/// Inserting the same logical row twice with `IGNORE` leaves one row.
pub fn test_insert_ignore_idempotent(spec: &Specifier) -> Result<()> {
	let mut handle = open(spec)?;
	let dialect = handle.dialect();
	recreate(
		&mut handle,
		"sqldb_test_ignore",
		&format!(
			"{}, name {} UNIQUE, size BIGINT",
			id_column(dialect),
			if dialect == Dialect::MariaDb { "VARCHAR(190)" } else { "TEXT" },
		),
	)?;

	let columns = [Column::new("name", ValueType::String), Column::new("size", ValueType::Int64)];
	let values = [Value::String("same".into()), Value::Int64(1)];
	handle.insert(Flags::IGNORE, "sqldb_test_ignore", &columns, &values, &[])?;
	handle.insert(Flags::IGNORE, "sqldb_test_ignore", &columns, &values, &[])?;

	let count = handle.get_int64("sqldb_test_ignore", "COUNT(*)", None, &[])?;
	assert_eq!(count, 1);
	drop_table(&mut handle, "sqldb_test_ignore")
}

/// `REPLACE` on the same conflict key overwrites without duplicating.
pub fn test_insert_replace_overwrites(spec: &Specifier) -> Result<()> {
	let mut handle = open(spec)?;
	let dialect = handle.dialect();
	recreate(
		&mut handle,
		"sqldb_test_replace",
		&format!(
			"{}, name {} UNIQUE, size BIGINT",
			id_column(dialect),
			if dialect == Dialect::MariaDb { "VARCHAR(190)" } else { "TEXT" },
		),
	)?;

	let columns = [Column::new("name", ValueType::String), Column::new("size", ValueType::Int64)];
	handle.insert(
		Flags::empty(),
		"sqldb_test_replace",
		&columns,
		&[Value::String("entry".into()), Value::Int64(1)],
		&[],
	)?;
	handle.insert(
		Flags::REPLACE,
		"sqldb_test_replace",
		&columns,
		&[Value::String("entry".into()), Value::Int64(2)],
		&["name"],
	)?;

	let count = handle.get_int64("sqldb_test_replace", "COUNT(*)", None, &[])?;
	assert_eq!(count, 1);
	let size = handle.get_int64(
		"sqldb_test_replace",
		"size",
		Some("name = ?"),
		&[Filter::string("entry")],
	)?;
	assert_eq!(size, 2);
	drop_table(&mut handle, "sqldb_test_replace")
}

/// Typed getters default on an empty result.
pub fn test_typed_getters(spec: &Specifier) -> Result<()> {
	let mut handle = open(spec)?;
	let dialect = handle.dialect();
	recreate(
		&mut handle,
		"sqldb_test_typed",
		&format!("{}, num BIGINT, ratio {}, label TEXT", id_column(dialect), {
			if dialect == Dialect::PostgreSql {
				"DOUBLE PRECISION"
			} else {
				"REAL"
			}
		}),
	)?;
	let columns = [
		Column::new("num", ValueType::Int64),
		Column::new("ratio", ValueType::Double),
		Column::new("label", ValueType::String),
	];
	handle.insert(
		Flags::empty(),
		"sqldb_test_typed",
		&columns,
		&[Value::Int64(-7), Value::Double(1.25), Value::String("x".into())],
		&[],
	)?;

	assert_eq!(handle.get_int("sqldb_test_typed", "num", None, &[])?, -7);
	assert_eq!(handle.get_int64("sqldb_test_typed", "num", None, &[])?, -7);
	assert_eq!(handle.get_double("sqldb_test_typed", "ratio", None, &[])?, 1.25);
	assert_eq!(handle.get_string("sqldb_test_typed", "label", None, &[])?, "x");
	// Defaults on no match.
	let none = [Filter::string("missing")];
	assert_eq!(handle.get_int64("sqldb_test_typed", "num", Some("label = ?"), &none)?, 0);
	assert_eq!(handle.get_string("sqldb_test_typed", "label", Some("label = ?"), &none)?, "");
	assert_eq!(handle.get_id("sqldb_test_typed", "id", Some("label = ?"), &none)?, None);

	// Setters write through.
	handle.set_int64("sqldb_test_typed", "num", 42, Some("label = ?"), &[Filter::string("x")])?;
	assert_eq!(handle.get_int64("sqldb_test_typed", "num", None, &[])?, 42);
	drop_table(&mut handle, "sqldb_test_typed")
}

/// A date-time inserted as UNIX seconds reads back as the same number
/// on every back-end.
pub fn test_datetime_normalisation(spec: &Specifier) -> Result<()> {
	let mut handle = open(spec)?;
	let dialect = handle.dialect();
	recreate(
		&mut handle,
		"sqldb_test_datetime",
		&format!("{}, updated {}", id_column(dialect), datetime_column(dialect)),
	)?;
	let columns = [Column::new("updated", ValueType::DateTime)];
	handle.insert(
		Flags::empty(),
		"sqldb_test_datetime",
		&columns,
		&[Value::DateTime(1_700_000_000)],
		&[],
	)?;
	let mut seen = Value::Null;
	handle.get(
		Flags::empty(),
		&SelectParts::new(&["sqldb_test_datetime"], &columns),
		&[],
		|row| {
			seen = row.get(0).clone();
			Ok(false)
		},
	)?;
	assert_eq!(seen, Value::DateTime(1_700_000_000));
	drop_table(&mut handle, "sqldb_test_datetime")
}

/// `exists`, `get_ids`, `get_max_id`, `delete_by_ids` and `delete` with
/// a limit behave as documented.
pub fn test_id_operations(spec: &Specifier) -> Result<()> {
	let mut handle = open(spec)?;
	let dialect = handle.dialect();
	recreate(&mut handle, "sqldb_test_ids", &format!("{}, bucket BIGINT", id_column(dialect)))?;

	let columns = [Column::new("bucket", ValueType::Int64)];
	for bucket in [1i64, 1, 2, 2, 2] {
		handle.insert(Flags::empty(), "sqldb_test_ids", &columns, &[Value::Int64(bucket)], &[])?;
	}

	assert!(handle.exists("sqldb_test_ids", Some("bucket = ?"), &[Filter::int(2)])?);
	assert!(!handle.exists("sqldb_test_ids", Some("bucket = ?"), &[Filter::int(9)])?);

	let ids = handle.get_ids("sqldb_test_ids", "id", Some("bucket = ?"), &[Filter::int(2)])?;
	assert_eq!(ids.len(), 3);
	assert_eq!(handle.get_max_id("sqldb_test_ids", "id", None, &[])?, 5);

	let deleted = handle.delete_by_ids(Flags::empty(), "sqldb_test_ids", "id", &ids)?;
	assert_eq!(deleted, 3);
	assert_eq!(handle.get_int64("sqldb_test_ids", "COUNT(*)", None, &[])?, 2);

	// Key lists splice into IN clauses.
	let remaining =
		handle.get_ids("sqldb_test_ids", "id", Some("id IN (?)"), &[Filter::keys(vec![1, 2])])?;
	assert_eq!(remaining.len(), 2);
	drop_table(&mut handle, "sqldb_test_ids")
}

/// A multi-table get assembles UNION branches with repeated binds.
pub fn test_union_get(spec: &Specifier) -> Result<()> {
	let mut handle = open(spec)?;
	let dialect = handle.dialect();
	recreate(&mut handle, "sqldb_test_union_a", &format!("{}, v BIGINT", id_column(dialect)))?;
	recreate(&mut handle, "sqldb_test_union_b", &format!("{}, v BIGINT", id_column(dialect)))?;
	let columns = [Column::new("v", ValueType::Int64)];
	handle.insert(Flags::empty(), "sqldb_test_union_a", &columns, &[Value::Int64(10)], &[])?;
	handle.insert(Flags::empty(), "sqldb_test_union_b", &columns, &[Value::Int64(20)], &[])?;
	handle.insert(Flags::empty(), "sqldb_test_union_b", &columns, &[Value::Int64(1)], &[])?;

	let mut seen = Vec::new();
	handle.get(
		Flags::empty(),
		&SelectParts {
			filter: Some("v >= ?"),
			order_by: Some("v"),
			..SelectParts::new(&["sqldb_test_union_a", "sqldb_test_union_b"], &columns)
		},
		&[Filter::int(5)],
		|row| {
			seen.push(row.get(0).as_i64().unwrap());
			Ok(true)
		},
	)?;
	assert_eq!(seen, vec![10, 20]);
	drop_table(&mut handle, "sqldb_test_union_a")?;
	drop_table(&mut handle, "sqldb_test_union_b")
}

/// Column add/remove primitives. The embedded engine rebuilds the
/// table, so the surviving column's NOT NULL constraint must come
/// through as well.
pub fn test_add_remove_column(spec: &Specifier) -> Result<()> {
	let mut handle = open(spec)?;
	let dialect = handle.dialect();
	recreate(
		&mut handle,
		"sqldb_test_alter",
		&format!("{}, name TEXT NOT NULL", id_column(dialect)),
	)?;
	let columns = [Column::new("name", ValueType::String)];
	handle.insert(Flags::empty(), "sqldb_test_alter", &columns, &[Value::String("a".into())], &[])?;

	handle.add_column(
		"sqldb_test_alter",
		&Column::new("extra", ValueType::Int64),
		&Value::Int64(7),
	)?;
	assert_eq!(handle.get_int64("sqldb_test_alter", "extra", None, &[])?, 7);

	handle.remove_column("sqldb_test_alter", "extra")?;
	let survivors = handle.table_columns("sqldb_test_alter")?;
	assert!(!survivors.iter().any(|info| info.name.eq_ignore_ascii_case("extra")));
	let name = survivors
		.iter()
		.find(|info| info.name.eq_ignore_ascii_case("name"))
		.expect("name column survives");
	assert!(name.not_null, "NOT NULL lost in the rebuild");
	// Data survived the rebuild, and the constraint still bites.
	assert_eq!(handle.get_string("sqldb_test_alter", "name", None, &[])?, "a");
	let rejected =
		handle.insert(Flags::empty(), "sqldb_test_alter", &columns, &[Value::Null], &[]);
	assert!(rejected.is_err(), "NULL accepted by a NOT NULL column");
	drop_table(&mut handle, "sqldb_test_alter")
}

/// Schema introspection lists the created objects.
pub fn test_schema_lists(spec: &Specifier) -> Result<()> {
	let mut handle = open(spec)?;
	let dialect = handle.dialect();
	recreate(
		&mut handle,
		"sqldb_test_schema",
		&format!(
			"{}, name {}",
			id_column(dialect),
			if dialect == Dialect::MariaDb { "VARCHAR(190)" } else { "TEXT" },
		),
	)?;
	handle.batch("DROP VIEW IF EXISTS sqldb_test_view")?;
	handle.batch("CREATE VIEW sqldb_test_view AS SELECT name FROM sqldb_test_schema")?;
	handle.batch("CREATE INDEX sqldb_test_index ON sqldb_test_schema (name)")?;

	let tables = handle.table_list()?;
	assert!(tables.iter().any(|name| name.eq_ignore_ascii_case("sqldb_test_schema")));
	let views = handle.view_list()?;
	assert!(views.iter().any(|name| name.eq_ignore_ascii_case("sqldb_test_view")));
	let indexes = handle.index_list()?;
	assert!(indexes.iter().any(|name| name.eq_ignore_ascii_case("sqldb_test_index")));
	let _ = handle.trigger_list()?;

	handle.batch("DROP VIEW sqldb_test_view")?;
	drop_table(&mut handle, "sqldb_test_schema")
}

/// `compare` reports exactly the missing and obsolete column, and
/// `IGNORE_OBSOLETE` suppresses the latter.
pub fn test_schema_compare(reference_spec: &Specifier, target_spec: &Specifier) -> Result<()> {
	let mut reference = open(reference_spec)?;
	let mut target = open(target_spec)?;
	let dialect = reference.dialect();
	recreate(
		&mut reference,
		"sqldb_test_cmp",
		&format!("{}, needed BIGINT, common TEXT", id_column(dialect)),
	)?;
	let target_dialect = target.dialect();
	recreate(
		&mut target,
		"sqldb_test_cmp",
		&format!("{}, common TEXT, ghost BIGINT", id_column(target_dialect)),
	)?;

	let report = compare(&mut reference, &mut target, CompareFlags::empty())?;
	let kinds: Vec<ErrorKind> = report.iter().map(|err| err.kind()).collect();
	assert!(kinds.contains(&ErrorKind::MissingColumn), "missing column not reported: {:?}", kinds);
	assert!(kinds.contains(&ErrorKind::ObsoleteColumn), "obsolete column not reported: {:?}", kinds);

	let report = compare(&mut reference, &mut target, CompareFlags::IGNORE_OBSOLETE)?;
	let kinds: Vec<ErrorKind> = report.iter().map(|err| err.kind()).collect();
	assert!(kinds.contains(&ErrorKind::MissingColumn));
	assert!(!kinds.contains(&ErrorKind::ObsoleteColumn));

	drop_table(&mut reference, "sqldb_test_cmp")?;
	drop_table(&mut target, "sqldb_test_cmp")
}

/// Spec scenario: copy with remap assigns fresh ids, carries matching
/// columns, leaves the destination-only column at its default, and the
/// hooks observe the sentinel and the assigned id.
pub fn test_table_copy_remap(spec: &Specifier) -> Result<()> {
	let mut source = open(spec)?;
	let mut destination = open(spec)?;
	let dialect = source.dialect();
	recreate(
		&mut source,
		"sqldb_test_copy_src",
		&format!("{}, name TEXT, value BIGINT", id_column(dialect)),
	)?;
	recreate(
		&mut destination,
		"sqldb_test_copy_dst",
		&format!("{}, name TEXT, extra BIGINT DEFAULT 0, value BIGINT", id_column(dialect)),
	)?;

	let columns = [Column::new("name", ValueType::String), Column::new("value", ValueType::Int64)];
	for i in 0..5i64 {
		source.insert(
			Flags::empty(),
			"sqldb_test_copy_src",
			&columns,
			&[Value::String(format!("row-{}", i)), Value::Int64(i * 11)],
			&[],
		)?;
	}

	let pre_calls = AtomicU32::new(0);
	let post_calls = AtomicU32::new(0);
	let mut pre_row = |src: &sqldb::RowImage<'_>, dst: &mut sqldb::RowImage<'_>| {
		pre_calls.fetch_add(1, Ordering::SeqCst);
		assert!(src.by_name("id").and_then(|v| v.as_i64()).unwrap() > 0);
		assert_eq!(dst.by_name("id"), Some(&Value::Key(PRIMARY_KEY_ANY)));
		Ok(())
	};
	let mut post_row = |_src: &sqldb::RowImage<'_>, dst: &sqldb::RowImage<'_>| {
		post_calls.fetch_add(1, Ordering::SeqCst);
		assert!(dst.by_name("id").and_then(|v| v.as_i64()).unwrap() > 0);
		Ok(())
	};
	let copied = copy_table(
		&mut source,
		&mut destination,
		"sqldb_test_copy_src",
		"sqldb_test_copy_dst",
		&CopyOptions { order_by: Some("id"), ..CopyOptions::default() },
		CopyCallbacks {
			pre_row: Some(&mut pre_row),
			post_row: Some(&mut post_row),
			..CopyCallbacks::default()
		},
	)?;
	assert_eq!(copied, 5);
	assert_eq!(pre_calls.load(Ordering::SeqCst), 5);
	assert_eq!(post_calls.load(Ordering::SeqCst), 5);

	let check = [
		Column::new("name", ValueType::String),
		Column::new("extra", ValueType::Int64),
		Column::new("value", ValueType::Int64),
	];
	let mut rows = Vec::new();
	destination.get(
		Flags::empty(),
		&SelectParts {
			order_by: Some("value"),
			..SelectParts::new(&["sqldb_test_copy_dst"], &check)
		},
		&[],
		|row| {
			rows.push((
				row.get(0).as_str().unwrap().to_owned(),
				row.get(1).as_i64().unwrap(),
				row.get(2).as_i64().unwrap(),
			));
			Ok(true)
		},
	)?;
	assert_eq!(rows.len(), 5);
	for (i, (name, extra, value)) in rows.iter().enumerate() {
		assert_eq!(name, &format!("row-{}", i));
		assert_eq!(*extra, 0);
		assert_eq!(*value, i as i64 * 11);
	}

	drop_table(&mut source, "sqldb_test_copy_src")?;
	drop_table(&mut destination, "sqldb_test_copy_dst")
}

/// Spec scenario: a writer blocks a reader only until it unlocks; the
/// reader then sees the lock-free counters.
pub fn test_concurrent_reader_writer(spec: &Specifier) -> Result<()> {
	let writer = open(spec)?;
	let guard = writer.lock(LockKind::ReadWrite, Timeout::Forever)?;

	let reader_spec = spec.clone();
	let reader = thread::spawn(move || -> Result<(Duration, u32, u32)> {
		let handle = open(&reader_spec)?;
		let started = Instant::now();
		let read_guard = handle.lock(LockKind::Read, Timeout::ms(1000))?;
		let waited = started.elapsed();
		let counters = handle.node().counters();
		drop(read_guard);
		Ok((waited, counters.read, counters.read_write))
	});

	thread::sleep(Duration::from_millis(200));
	drop(guard);

	let (waited, read, read_write) = reader.join().expect("reader thread")?;
	assert!(waited >= Duration::from_millis(150), "reader did not wait: {:?}", waited);
	assert_eq!(read, 1);
	assert_eq!(read_write, 0);
	Ok(())
}

/// Spec scenario: a small write times out while a foreign transaction
/// holds the node, then succeeds once the transaction commits in time.
pub fn test_busy_timeout_then_success(spec: &Specifier) -> Result<()> {
	let mut a = open(spec)?;
	let a_dialect = a.dialect();
	recreate(&mut a, "sqldb_test_busy", &format!("{}, v BIGINT", id_column(a_dialect)))?;
	let columns = [Column::new("v", ValueType::Int64)];
	a.insert(Flags::empty(), "sqldb_test_busy", &columns, &[Value::Int64(1)], &[])?;

	a.begin_transaction(TransactionType::Immediate, Timeout::ms(5000))?;

	// Phase 1: B times out inside the transaction window.
	let spec_b = spec.clone();
	let blocked = thread::spawn(move || -> Result<ErrorKind> {
		let mut b = open(&spec_b)?;
		b.set_timeout(Timeout::ms(500));
		let err = b
			.update(
				Flags::empty(),
				"sqldb_test_busy",
				&[Column::new("v", ValueType::Int64)],
				&[Value::Int64(2)],
				None,
				&[],
			)
			.expect_err("update must time out under a foreign transaction");
		Ok(err.kind())
	});
	assert_eq!(blocked.join().expect("blocked thread")?, ErrorKind::Timeout);

	// Phase 2: A commits inside B's window; B succeeds.
	let spec_b = spec.clone();
	let unblocked = thread::spawn(move || -> Result<u64> {
		let mut b = open(&spec_b)?;
		b.set_timeout(Timeout::ms(2000));
		b.update(
			Flags::empty(),
			"sqldb_test_busy",
			&[Column::new("v", ValueType::Int64)],
			&[Value::Int64(3)],
			None,
			&[],
		)
	});
	thread::sleep(Duration::from_millis(200));
	a.end_transaction()?;
	assert_eq!(unblocked.join().expect("unblocked thread")?, 1);

	assert_eq!(a.get_int64("sqldb_test_busy", "v", None, &[])?, 3);
	drop_table(&mut a, "sqldb_test_busy")
}

/// Spec scenario: a progress handler returning `false` interrupts the
/// statement, the read lock is released and the handle stays usable.
pub fn test_progress_cancel(spec: &Specifier) -> Result<()> {
	let mut handle = open(spec)?;
	let handle_dialect = handle.dialect();
	recreate(
		&mut handle,
		"sqldb_test_progress",
		&format!("{}, v BIGINT", id_column(handle_dialect)),
	)?;
	let columns = [Column::new("v", ValueType::Int64)];
	for i in 0..100i64 {
		handle.insert(Flags::empty(), "sqldb_test_progress", &columns, &[Value::Int64(i)], &[])?;
	}

	let calls = Arc::new(AtomicU32::new(0));
	let observed = calls.clone();
	let handler: ProgressHandler = Arc::new(move || observed.fetch_add(1, Ordering::SeqCst) < 5);
	handle.register_progress_handler(&handler);

	// A million-row cross join keeps the cursor busy long enough for
	// the handler to fire on every back-end.
	let long_query = "SELECT a.v FROM sqldb_test_progress a, \
		sqldb_test_progress b, sqldb_test_progress c";
	let err = handle
		.query_raw(Flags::empty(), long_query, &[], |_row| Ok(true))
		.expect_err("the progress handler interrupts the query");
	assert_eq!(err.kind(), ErrorKind::Interrupted);
	assert!(calls.load(Ordering::SeqCst) >= 5);
	assert_eq!(handle.read_lock_count(), 0);

	handle.unregister_progress_handler(&handler);
	// The handle keeps working afterwards.
	let mut got = Value::Null;
	handle.query_raw(Flags::empty(), "SELECT 1", &[], |row| {
		got = row.get(0).clone();
		Ok(false)
	})?;
	assert_eq!(got.as_i64(), Some(1));
	drop_table(&mut handle, "sqldb_test_progress")
}

/// Locks restore their counters, and the node leaves the registry when
/// the last handle closes.
pub fn test_lock_accounting_and_teardown(spec: &Specifier) -> Result<()> {
	let a = open(spec)?;
	let b = open(spec)?;
	assert!(Arc::ptr_eq(a.node(), b.node()));

	let before = a.node().counters();
	let read = a.lock(LockKind::Read, Timeout::Forever)?;
	let write = a.lock(LockKind::ReadWrite, Timeout::Forever)?;
	assert_eq!(a.read_lock_count(), 1);
	assert_eq!(a.read_write_lock_count(), 1);
	drop(write);
	drop(read);
	assert_eq!(a.node().counters(), before);
	assert_eq!(a.read_lock_count(), 0);

	drop(a);
	assert!(sqldb::registry::is_open(spec));
	drop(b);
	assert!(!sqldb::registry::is_open(spec));
	Ok(())
}

/// A dropped scoped transaction rolls its writes back.
pub fn test_transaction_rollback(spec: &Specifier) -> Result<()> {
	let mut handle = open(spec)?;
	let handle_dialect = handle.dialect();
	recreate(&mut handle, "sqldb_test_tx", &format!("{}, v BIGINT", id_column(handle_dialect)))?;
	let columns = [Column::new("v", ValueType::Int64)];

	{
		let mut tx = handle.transaction(TransactionType::Deferred, Timeout::ms(5000))?;
		tx.insert(Flags::empty(), "sqldb_test_tx", &columns, &[Value::Int64(1)], &[])?;
		// Dropped without commit.
	}
	assert_eq!(handle.get_int64("sqldb_test_tx", "COUNT(*)", None, &[])?, 0);

	let tx = {
		let mut tx = handle.transaction(TransactionType::Immediate, Timeout::ms(5000))?;
		tx.insert(Flags::empty(), "sqldb_test_tx", &columns, &[Value::Int64(2)], &[])?;
		tx
	};
	tx.commit()?;
	assert_eq!(handle.get_int64("sqldb_test_tx", "COUNT(*)", None, &[])?, 1);
	assert_eq!(handle.read_write_lock_count(), 0);
	drop_table(&mut handle, "sqldb_test_tx")
}

/// The copy engine yields its transaction when another thread wants the
/// destination: the waiter gets through while the copy is running.
pub fn test_copy_yields_to_waiters(spec: &Specifier) -> Result<()> {
	let mut source = open(spec)?;
	let mut destination = open(spec)?;
	let dialect = source.dialect();
	recreate(
		&mut source,
		"sqldb_test_yield_src",
		&format!("{}, v BIGINT", id_column(dialect)),
	)?;
	recreate(
		&mut destination,
		"sqldb_test_yield_dst",
		&format!("{}, v BIGINT", id_column(dialect)),
	)?;
	let columns = [Column::new("v", ValueType::Int64)];
	for i in 0..600i64 {
		source.insert(Flags::empty(), "sqldb_test_yield_src", &columns, &[Value::Int64(i)], &[])?;
	}

	let spec_other = spec.clone();
	let waiter_done = Arc::new(AtomicU64::new(0));
	let waiter_flag = waiter_done.clone();
	let waiter = thread::spawn(move || -> Result<()> {
		let other = open(&spec_other)?;
		thread::sleep(Duration::from_millis(20));
		let guard = other.lock(LockKind::ReadWrite, Timeout::ms(20_000))?;
		waiter_flag.store(1, Ordering::SeqCst);
		drop(guard);
		Ok(())
	});

	let copied = copy_table(
		&mut source,
		&mut destination,
		"sqldb_test_yield_src",
		"sqldb_test_yield_dst",
		&CopyOptions::default(),
		CopyCallbacks::default(),
	)?;
	assert_eq!(copied, 600);
	waiter.join().expect("waiter thread")?;
	assert_eq!(waiter_done.load(Ordering::SeqCst), 1);

	drop_table(&mut source, "sqldb_test_yield_src")?;
	drop_table(&mut destination, "sqldb_test_yield_dst")
}
