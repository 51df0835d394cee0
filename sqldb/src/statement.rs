// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The portable statement façade.
//!
//! A [`Statement`] carries an assembled SQL string, the values bound so
//! far and the declared result shape. Execution drives the adapter with
//! a retry loop: busy conditions run the node's busy handlers and are
//! retried until the timeout budget is spent. Result values are coerced
//! into the declared column types before the caller's row function sees
//! them.

use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::builder::Built;
use crate::driver::{Dialect, QueryOptions, QueryRow, RowControl};
use crate::error::{Error, ErrorKind, Result};
use crate::handle::Handle;
use crate::options::{Deadline, Flags, Timeout};
use crate::value::{Column, Value};

/// Upper bound on one sleep between busy retries.
const BUSY_RETRY_SLEEP: Duration = Duration::from_millis(500);

/// One result row. Fields are addressable by index always and by column
/// name when the statement was prepared with [`Flags::COLUMN_NAMES`].
pub struct Row<'a> {
	names: Option<&'a [String]>,
	values: &'a [Value],
}

impl<'a> Row<'a> {
	/// Number of columns.
	pub fn len(&self) -> usize {
		self.values.len()
	}

	/// Whether the row has no columns.
	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}

	/// Value at `index`; NULL beyond the last column.
	pub fn get(&self, index: usize) -> &Value {
		self.values.get(index).unwrap_or(&Value::Null)
	}

	/// Name of column `index`, when names were requested.
	pub fn name(&self, index: usize) -> Option<&str> {
		self.names.and_then(|names| names.get(index)).map(String::as_str)
	}

	/// Value of the column called `name`, when names were requested.
	/// Comparison is case-insensitive, matching the schema rules.
	pub fn by_name(&self, name: &str) -> Option<&Value> {
		let names = self.names?;
		names
			.iter()
			.position(|candidate| candidate.eq_ignore_ascii_case(name))
			.map(|index| &self.values[index])
	}

	/// All values of the row.
	pub fn values(&self) -> &[Value] {
		self.values
	}
}

/// A prepared portable statement bound to one handle.
pub struct Statement<'h> {
	handle: &'h mut Handle,
	sql: String,
	flags: Flags,
	timeout: Timeout,
	parameter_count: usize,
	parameters: Vec<Value>,
	columns: Vec<Column>,
	changed_rows: u64,
	last_insert_id: Option<i64>,
}

impl<'h> Statement<'h> {
	/// Prepare an assembled statement. `columns` declares the result
	/// shape and drives per-column coercion; it may be empty for
	/// modification statements.
	pub fn prepare(
		handle: &'h mut Handle,
		built: Built,
		columns: Vec<Column>,
		flags: Flags,
	) -> Result<Statement<'h>> {
		if flags.contains(Flags::DEBUG) {
			eprintln!("sqldb: {}", built.sql);
		}
		let timeout = handle.timeout();
		Ok(Statement {
			handle,
			sql: built.sql,
			flags,
			timeout,
			parameter_count: built.placeholders,
			parameters: Vec::new(),
			columns,
			changed_rows: 0,
			last_insert_id: None,
		})
	}

	/// Prepare caller-supplied SQL verbatim ([`Flags::PLAIN`]); the
	/// expected parameter count must be supplied by the caller.
	pub fn prepare_plain(
		handle: &'h mut Handle,
		sql: &str,
		parameter_count: usize,
		flags: Flags,
	) -> Result<Statement<'h>> {
		Self::prepare(
			handle,
			Built { sql: sql.to_owned(), placeholders: parameter_count },
			Vec::new(),
			flags | Flags::PLAIN,
		)
	}

	/// The statement text.
	pub fn sql(&self) -> &str {
		&self.sql
	}

	/// Override the handle's timeout for this statement.
	pub fn set_timeout(&mut self, timeout: Timeout) {
		self.timeout = timeout;
	}

	/// How many parameters have been bound so far.
	pub fn parameter_index(&self) -> usize {
		self.parameters.len()
	}

	/// Append pre-coerced filter binds (from
	/// [`builder::expand_filters`]).
	///
	/// [`builder::expand_filters`]: crate::builder::expand_filters
	pub fn bind_filters(&mut self, values: Vec<Value>) -> Result<()> {
		for value in values {
			self.push_parameter(value)?;
		}
		Ok(())
	}

	/// Append insert/update values, coercing each to its column's
	/// declared type. Spliced sub-SQL expressions consume no bind.
	pub fn bind_values(&mut self, columns: &[Column], values: &[Value]) -> Result<()> {
		debug_assert_eq!(columns.len(), values.len());
		for (column, value) in columns.iter().zip(values) {
			if matches!(value, Value::Expression(_)) {
				continue;
			}
			let value = value.clone().coerce(column.kind).map_err(|err| {
				Error::new(
					ErrorKind::Bind,
					format!("column {}: {}", column.name, err.message()),
				)
			})?;
			self.push_parameter(value)?;
		}
		Ok(())
	}

	fn push_parameter(&mut self, value: Value) -> Result<()> {
		if self.parameters.len() == self.parameter_count {
			return Err(Error::new(
				ErrorKind::Bind,
				format!("statement takes {} parameters", self.parameter_count),
			)
			.with_sql(&self.sql));
		}
		self.parameters.push(value);
		Ok(())
	}

	fn check_bound(&self) -> Result<()> {
		if self.parameters.len() != self.parameter_count {
			return Err(Error::new(
				ErrorKind::Bind,
				format!(
					"{} of {} parameters bound",
					self.parameters.len(),
					self.parameter_count
				),
			)
			.with_sql(&self.sql));
		}
		Ok(())
	}

	/// Run a modification statement. Returns the changed-row count.
	pub fn execute(&mut self) -> Result<u64> {
		self.check_bound()?;
		let deadline = Deadline::new(self.timeout);
		let mut attempt = 0u32;
		loop {
			match self.handle.connection().execute(&self.sql, &self.parameters) {
				Ok(outcome) => {
					self.changed_rows = outcome.changed_rows;
					self.last_insert_id = outcome.last_insert_id;
					return Ok(outcome.changed_rows);
				},
				Err(err) if err.is_busy() => {
					self.wait_retry(&deadline, &mut attempt, &err)?;
				},
				Err(err) => return Err(err.with_sql(&self.sql)),
			}
		}
	}

	/// Run a row-returning statement, invoking `row_fn` per row with
	/// values coerced to the declared columns. The function returns
	/// `false` to stop fetching. Returns the number of rows delivered.
	pub fn query<F>(&mut self, mut row_fn: F) -> Result<u64>
	where
		F: FnMut(&Row<'_>) -> Result<bool>,
	{
		self.check_bound()?;
		let deadline = Deadline::new(self.timeout);
		let mut attempt = 0u32;
		let options = QueryOptions { fetch_all: self.flags.contains(Flags::FETCH_ALL) };
		let named = self.flags.contains(Flags::COLUMN_NAMES);
		let columns = std::mem::take(&mut self.columns);
		let dialect = self.handle.dialect();
		let node = self.handle.node().clone();
		// The embedded engine polls the progress handlers through its
		// native hook; for the servers the row loop polls them here.
		let poll_progress = dialect != Dialect::Sqlite && node.has_progress_handlers();

		let result = loop {
			let mut delivered = 0u64;
			let mut scratch: Vec<Value> = Vec::new();
			let outcome = self.handle.connection().query(
				&self.sql,
				&self.parameters,
				options,
				&mut |raw: &QueryRow<'_>| {
					if poll_progress && !node.progress_ok() {
						return Err(Error::new(ErrorKind::Interrupted, "progress handler"));
					}
					delivered += 1;
					scratch.clear();
					for (index, value) in raw.values.iter().enumerate() {
						let coerced = match columns.get(index) {
							Some(column) => value.clone().coerce(column.kind)?,
							None => value.clone(),
						};
						scratch.push(coerced);
					}
					let row = Row {
						names: named.then_some(raw.columns),
						values: &scratch,
					};
					match row_fn(&row)? {
						true => Ok(RowControl::Continue),
						false => Ok(RowControl::Stop),
					}
				},
			);
			match outcome {
				Ok(rows) => break Ok(rows),
				Err(err) if err.is_busy() && delivered == 0 => {
					if let Err(err) = self.wait_retry(&deadline, &mut attempt, &err) {
						break Err(err);
					}
				},
				Err(err) => break Err(err.with_sql(&self.sql)),
			}
		};
		self.columns = columns;
		result
	}

	/// Run the busy handlers and sleep before the next attempt, or give
	/// up with a timeout once the budget is spent.
	fn wait_retry(&mut self, deadline: &Deadline, attempt: &mut u32, cause: &Error) -> Result<()> {
		let node = self.handle.node().clone();
		node.run_busy_handlers(*attempt);
		*attempt += 1;
		if deadline.expired() {
			warn!("busy retry budget spent: {}", cause);
			return Err(Error::new(
				ErrorKind::Timeout,
				format!("database busy after {} attempts", attempt),
			)
			.with_sql(&self.sql));
		}
		debug!("database busy, retry {} for: {}", attempt, self.sql);
		thread::sleep(deadline.clamp(BUSY_RETRY_SLEEP));
		Ok(())
	}

	/// Rows changed by the most recent execution.
	pub fn changed_rows(&self) -> u64 {
		self.changed_rows
	}

	/// Id assigned by the most recent insert on this statement.
	pub fn last_insert_id(&self) -> Option<i64> {
		self.last_insert_id
	}
}
