// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Behavioural suite against a live server. Skipped unless
//! `SQLDB_POSTGRES_TEST_URI` points at one, e.g.
//! `postgresql:127.0.0.1:postgres:secret:sqldb_test`.

use sqldb::Specifier;

fn server_spec() -> Option<Specifier> {
	let uri = std::env::var("SQLDB_POSTGRES_TEST_URI").ok()?;
	sqldb_postgres::register();
	Some(Specifier::parse(&uri, Some("sqldb_test")))
}

#[test]
fn shared_suite() {
	let Some(spec) = server_spec() else { return };

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
	let Some(spec) = server_spec() else { return };

	sqldb_shared_tests::test_concurrent_reader_writer(&spec).unwrap();
	sqldb_shared_tests::test_busy_timeout_then_success(&spec).unwrap();
	sqldb_shared_tests::test_progress_cancel(&spec).unwrap();
	sqldb_shared_tests::test_lock_accounting_and_teardown(&spec).unwrap();
}
