// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Behavioural suite and sqlite-only scenarios against real database
//! files.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sqldb::{
	Column, ErrorKind, Filter, Flags, OpenMode, Specifier, Timeout, Value, ValueType,
};
use tempfile::TempDir;

fn spec_in(dir: &TempDir, name: &str) -> Specifier {
	sqldb_sqlite::register();
	let path = dir.path().join(name);
	Specifier::parse(&format!("sqlite:{}", path.display()), None)
}

#[test]
fn shared_suite() {
	let dir = TempDir::new().unwrap();
	let spec = spec_in(&dir, "suite.db");

	sqldb_shared_tests::test_round_trip(&spec).unwrap();
	sqldb_shared_tests::test_insert_ignore_idempotent(&spec).unwrap();
	sqldb_shared_tests::test_insert_replace_overwrites(&spec).unwrap();
	sqldb_shared_tests::test_typed_getters(&spec).unwrap();
	sqldb_shared_tests::test_datetime_normalisation(&spec).unwrap();
	sqldb_shared_tests::test_id_operations(&spec).unwrap();
	sqldb_shared_tests::test_union_get(&spec).unwrap();
	sqldb_shared_tests::test_add_remove_column(&spec).unwrap();
	sqldb_shared_tests::test_schema_lists(&spec).unwrap();
	sqldb_shared_tests::test_table_copy_remap(&spec).unwrap();
	sqldb_shared_tests::test_transaction_rollback(&spec).unwrap();
}

#[test]
fn shared_concurrency_suite() {
	let dir = TempDir::new().unwrap();
	let spec = spec_in(&dir, "concurrency.db");

	sqldb_shared_tests::test_concurrent_reader_writer(&spec).unwrap();
	sqldb_shared_tests::test_busy_timeout_then_success(&spec).unwrap();
	sqldb_shared_tests::test_progress_cancel(&spec).unwrap();
	sqldb_shared_tests::test_copy_yields_to_waiters(&spec).unwrap();
}

#[test]
fn lock_accounting_and_node_teardown() {
	let dir = TempDir::new().unwrap();
	let spec = spec_in(&dir, "teardown.db");
	sqldb_shared_tests::test_lock_accounting_and_teardown(&spec).unwrap();
}

#[test]
fn schema_compare_across_two_files() {
	let dir = TempDir::new().unwrap();
	let reference = spec_in(&dir, "reference.db");
	let target = spec_in(&dir, "target.db");
	sqldb_shared_tests::test_schema_compare(&reference, &target).unwrap();
}

#[test]
fn empty_path_opens_in_memory() {
	sqldb_sqlite::register();
	let spec = Specifier::parse("sqlite3:", None);
	let mut handle = sqldb::open(&spec, OpenMode::default(), Timeout::ms(1000)).unwrap();
	handle.batch("CREATE TABLE t (v INTEGER)").unwrap();
	handle
		.insert(
			Flags::empty(),
			"t",
			&[Column::new("v", ValueType::Int64)],
			&[Value::Int64(3)],
			&[],
		)
		.unwrap();
	assert_eq!(handle.get_int64("t", "v", None, &[]).unwrap(), 3);
}

#[test]
fn force_create_resets_the_file() {
	let dir = TempDir::new().unwrap();
	let spec = spec_in(&dir, "force.db");
	{
		let mut handle =
			sqldb::open(&spec, OpenMode::READ_WRITE | OpenMode::CREATE, Timeout::ms(1000))
				.unwrap();
		handle.batch("CREATE TABLE keepsake (v INTEGER)").unwrap();
	}
	{
		let mut handle =
			sqldb::open(&spec, OpenMode::READ_WRITE | OpenMode::FORCE_CREATE, Timeout::ms(1000))
				.unwrap();
		let tables = handle.table_list().unwrap();
		assert!(tables.is_empty(), "force create kept tables: {:?}", tables);
	}
}

#[test]
fn aux_schema_hosts_temporary_tables() {
	let dir = TempDir::new().unwrap();
	let spec = spec_in(&dir, "aux.db");
	let mut handle = sqldb::open(
		&spec,
		OpenMode::READ_WRITE | OpenMode::CREATE | OpenMode::AUX,
		Timeout::ms(1000),
	)
	.unwrap();
	handle.batch("CREATE TABLE aux.temporary1 (v INTEGER)").unwrap();
	// The %1 short-hand reaches the same table through the builder.
	handle
		.execute_raw(Flags::empty(), "INSERT INTO %1 VALUES (?)", &[Filter::int(9)])
		.unwrap();
	assert_eq!(handle.get_int64("aux.temporary1", "v", None, &[]).unwrap(), 9);
}

#[test]
fn interrupt_cancels_from_another_thread() {
	let dir = TempDir::new().unwrap();
	let spec = spec_in(&dir, "interrupt.db");
	let mut handle = sqldb::open(
		&spec,
		OpenMode::READ_WRITE | OpenMode::CREATE,
		Timeout::ms(5000),
	)
	.unwrap();
	handle.batch("CREATE TABLE t (v INTEGER)").unwrap();
	let columns = [Column::new("v", ValueType::Int64)];
	for i in 0..100i64 {
		handle.insert(Flags::empty(), "t", &columns, &[Value::Int64(i)], &[]).unwrap();
	}

	let interrupter = handle.interrupter();
	let fired = Arc::new(AtomicBool::new(false));
	let witness = fired.clone();
	let trigger = thread::spawn(move || {
		thread::sleep(Duration::from_millis(50));
		interrupter.interrupt();
		witness.store(true, Ordering::SeqCst);
	});

	let result = handle.query_raw(
		Flags::empty(),
		"SELECT a.v FROM t a, t b, t c, t d",
		&[],
		|_row| Ok(true),
	);
	trigger.join().unwrap();
	assert!(fired.load(Ordering::SeqCst));
	let err = result.expect_err("the statement was interrupted");
	assert_eq!(err.kind(), ErrorKind::Interrupted);

	// The lock was released; the handle keeps working.
	assert_eq!(handle.read_lock_count(), 0);
	assert_eq!(handle.get_int64("t", "COUNT(*)", None, &[]).unwrap(), 100);
}

#[test]
fn delete_with_limit_restricts_rows() {
	let dir = TempDir::new().unwrap();
	let spec = spec_in(&dir, "delete.db");
	let mut handle =
		sqldb::open(&spec, OpenMode::READ_WRITE | OpenMode::CREATE, Timeout::ms(1000)).unwrap();
	handle.batch("CREATE TABLE t (v INTEGER)").unwrap();
	let columns = [Column::new("v", ValueType::Int64)];
	for i in 0..4i64 {
		handle.insert(Flags::empty(), "t", &columns, &[Value::Int64(i)], &[]).unwrap();
	}
	let deleted = handle.delete(Flags::empty(), "t", Some("v >= ?"), &[Filter::int(0)], 2).unwrap();
	assert_eq!(deleted, 2);
	assert_eq!(handle.get_int64("t", "COUNT(*)", None, &[]).unwrap(), 2);
}
