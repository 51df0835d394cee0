// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The seam between the portable core and the back-end driver crates.
//!
//! Each adapter crate implements [`Connection`] over its native client
//! and installs a [`Connector`] in the process-wide registry. The
//! statement façade programs only against these traits; every piece of
//! back-end-specific branching lives behind them.

use std::sync::Arc;

use crate::error::Result;
use crate::options::OpenMode;
use crate::specifier::Specifier;
use crate::value::{ColumnInfo, Value};

/// SQL dialect spoken by a connection. The builder adapts placeholder
/// syntax, quoting and date-time wrapping per dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
	/// Embedded single-file engine.
	Sqlite,
	/// MySQL lineage.
	MariaDb,
	/// PostgreSQL lineage.
	PostgreSql,
}

/// Outcome of a modification statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOutcome {
	/// Rows affected by the statement.
	pub changed_rows: u64,
	/// Id assigned by the most recent insert, where the back-end
	/// reports one.
	pub last_insert_id: Option<i64>,
}

/// Options applied to a row-returning statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
	/// Materialise the whole result set before the first row callback
	/// instead of streaming row by row.
	pub fetch_all: bool,
}

/// Returned by a row callback to continue or stop the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowControl {
	/// Fetch the next row.
	Continue,
	/// Close the cursor; not an error.
	Stop,
}

/// One result row as the driver produced it: column names captured at
/// cursor open, values in declaration order. Invalid UTF-8 in text
/// columns is repaired by the adapter before it gets here.
#[derive(Debug)]
pub struct QueryRow<'a> {
	/// Result column names.
	pub columns: &'a [String],
	/// Row values, one per column.
	pub values: &'a [Value],
}

/// Callback invoked once per fetched row.
pub type RowCallback<'a> = dyn FnMut(&QueryRow<'_>) -> Result<RowControl> + 'a;

/// Cancels an in-flight statement from another thread. Synchronous on
/// the embedded engine, best-effort on the servers.
pub trait Interrupter: Send + Sync {
	/// Ask the driver to abort the running statement.
	fn interrupt(&self);
}

/// A no-op interrupter for back-ends without cancellation support.
pub struct NullInterrupter;

impl Interrupter for NullInterrupter {
	fn interrupt(&self) {}
}

/// One open back-end connection. Owned by exactly one [`Handle`] and
/// used from one thread at a time.
///
/// [`Handle`]: crate::Handle
pub trait Connection: Send {
	/// The dialect this connection speaks.
	fn dialect(&self) -> Dialect;

	/// Run one or more statements that bind no parameters and return
	/// no rows (DDL, transaction control, session setup).
	fn execute_batch(&mut self, sql: &str) -> Result<()>;

	/// Run a modification statement with bound parameters.
	fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecOutcome>;

	/// Run a row-returning statement, invoking `row_fn` per row.
	/// Returns the number of rows delivered.
	fn query(
		&mut self,
		sql: &str,
		params: &[Value],
		options: QueryOptions,
		row_fn: &mut RowCallback<'_>,
	) -> Result<u64>;

	/// A token that cancels this connection's in-flight statement.
	fn interrupter(&self) -> Arc<dyn Interrupter>;

	/// Names of the tables of the current database.
	fn table_names(&mut self) -> Result<Vec<String>>;

	/// Names of the views of the current database.
	fn view_names(&mut self) -> Result<Vec<String>>;

	/// Names of the indexes of the current database.
	fn index_names(&mut self) -> Result<Vec<String>>;

	/// Names of the triggers of the current database.
	fn trigger_names(&mut self) -> Result<Vec<String>>;

	/// Column descriptions of `table`.
	fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>>;

	/// Back-end maintenance after a committed transaction. The embedded
	/// engine truncates its write-ahead log here; servers do nothing.
	fn checkpoint(&mut self) -> Result<()> {
		Ok(())
	}
}

/// Hooks handed to the adapter at connect time so driver-level callbacks
/// can reach the shared per-database state.
#[derive(Clone)]
pub struct DriverHooks {
	/// Polled during long operations; `false` means interrupt. The
	/// embedded engine wires this into its native progress callback,
	/// the servers poll it between rows.
	pub progress: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl DriverHooks {
	/// Hooks that never interrupt; used by tests and tools.
	pub fn none() -> Self {
		Self { progress: Arc::new(|| true) }
	}
}

/// Opens connections for one back-end family. Adapter crates install an
/// implementation via [`register_connector`].
///
/// [`register_connector`]: crate::registry::register_connector
pub trait Connector: Send + Sync {
	/// Open a connection described by `spec` with the given mode flags.
	fn connect(
		&self,
		spec: &Specifier,
		mode: OpenMode,
		hooks: DriverHooks,
	) -> Result<Box<dyn Connection>>;
}
