// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Streaming table copy between two connections.
//!
//! Rows flow from a source cursor straight into destination inserts,
//! remapped by case-insensitive column name. The destination's primary
//! key is never taken from the source: the slot is marked "assign new"
//! and the freshly assigned id is written back so the post-row hook can
//! maintain an id-remap table. The engine periodically yields the
//! destination's transaction and locks to waiting threads; that yield is
//! a fairness contract, not an optimisation.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::builder::{self, SelectParts};
use crate::error::{Error, ErrorKind, Result};
use crate::handle::{Handle, LockGuard};
use crate::node::LockKind;
use crate::options::{Flags, TransactionType, UNLIMITED};
use crate::statement::Statement;
use crate::value::{Column, ColumnInfo, Filter, Value};

/// Sentinel placed in the destination primary-key slot to signal "the
/// engine assigns this".
pub const PRIMARY_KEY_ANY: i64 = -1;

/// Rows between checks for waiting threads and pause requests.
const YIELD_INTERVAL: u64 = 128;

/// Poll spacing while paused.
const PAUSE_POLL: Duration = Duration::from_secs(10);

/// Source restriction and transaction behaviour of a copy.
#[derive(Clone, Copy)]
pub struct CopyOptions<'a> {
	/// Filter fragment applied to the source.
	pub filter: Option<&'a str>,
	/// Values for the filter's placeholders.
	pub filters: &'a [Filter],
	/// GROUP BY applied to the source.
	pub group_by: Option<&'a str>,
	/// ORDER BY applied to the source.
	pub order_by: Option<&'a str>,
	/// Source rows to skip.
	pub offset: u64,
	/// Source row cap; [`UNLIMITED`] for none.
	pub limit: u64,
	/// Wrap the destination inserts in a transaction.
	pub transaction: bool,
}

impl<'a> Default for CopyOptions<'a> {
	fn default() -> Self {
		Self {
			filter: None,
			filters: &[],
			group_by: None,
			order_by: None,
			offset: 0,
			limit: UNLIMITED,
			transaction: true,
		}
	}
}

/// One table's columns and the values of the row in flight.
pub struct RowImage<'a> {
	columns: &'a [ColumnInfo],
	values: &'a mut [Value],
}

impl<'a> RowImage<'a> {
	/// Column descriptions.
	pub fn columns(&self) -> &[ColumnInfo] {
		self.columns
	}

	/// Value at `index`; NULL beyond the last column.
	pub fn value(&self, index: usize) -> &Value {
		self.values.get(index).unwrap_or(&Value::Null)
	}

	/// Value of the column called `name`, case-insensitive.
	pub fn by_name(&self, name: &str) -> Option<&Value> {
		self.position(name).map(|index| &self.values[index])
	}

	/// Overwrite the value at `index`.
	pub fn set(&mut self, index: usize, value: Value) {
		if let Some(slot) = self.values.get_mut(index) {
			*slot = value;
		}
	}

	/// Overwrite the value of the column called `name`. Returns whether
	/// the column exists.
	pub fn set_by_name(&mut self, name: &str, value: Value) -> bool {
		match self.position(name) {
			Some(index) => {
				self.values[index] = value;
				true
			},
			None => false,
		}
	}

	fn position(&self, name: &str) -> Option<usize> {
		self.columns.iter().position(|column| column.name.eq_ignore_ascii_case(name))
	}
}

/// Hooks and callbacks of one copy run. All of them are optional.
#[derive(Default)]
pub struct CopyCallbacks<'a> {
	/// Runs before each insert with the source row and the mutable
	/// destination row; errors abort the copy.
	pub pre_row: Option<&'a mut dyn FnMut(&RowImage<'_>, &mut RowImage<'_>) -> Result<()>>,
	/// Runs after each insert; the destination image carries the
	/// freshly assigned primary key.
	pub post_row: Option<&'a mut dyn FnMut(&RowImage<'_>, &RowImage<'_>) -> Result<()>>,
	/// Polled between rows; while it returns `true` the copy parks,
	/// holding no locks.
	pub pause: Option<&'a dyn Fn() -> bool>,
	/// Called with the running row count after each insert.
	pub progress: Option<&'a mut dyn FnMut(u64)>,
	/// Accumulates the wall-clock time the copy took.
	pub duration: Option<&'a mut Duration>,
}

struct DestinationState {
	guard: Option<LockGuard>,
	tx_open: bool,
}

/// Copy rows of `source_table` on `source` into `destination_table` on
/// `destination`. Returns the number of rows copied.
pub fn copy_table(
	source: &mut Handle,
	destination: &mut Handle,
	source_table: &str,
	destination_table: &str,
	options: &CopyOptions<'_>,
	mut callbacks: CopyCallbacks<'_>,
) -> Result<u64> {
	let started = Instant::now();

	let source_columns = source.table_columns(source_table)?;
	let destination_columns = destination.table_columns(destination_table)?;

	// Destination slot -> source slot, by case-insensitive name.
	let from_column_map: Vec<Option<usize>> = destination_columns
		.iter()
		.map(|dst| {
			source_columns.iter().position(|src| src.name.eq_ignore_ascii_case(&dst.name))
		})
		.collect();
	let primary_key = destination_columns.iter().position(|column| column.primary_key);

	// Destination columns fed by the insert: everything mapped from the
	// source except the primary key.
	let parameter_map: Vec<usize> = (0..destination_columns.len())
		.filter(|&index| Some(index) != primary_key && from_column_map[index].is_some())
		.collect();
	if parameter_map.is_empty() {
		return Err(Error::new(
			ErrorKind::MissingColumn,
			format!("{} and {} share no columns", source_table, destination_table),
		));
	}
	let insert_columns: Vec<Column> = parameter_map
		.iter()
		.map(|&index| {
			let info = &destination_columns[index];
			Column::new(info.name.clone(), info.kind)
		})
		.collect();

	let select_columns: Vec<Column> = source_columns
		.iter()
		.map(|info| Column::new(info.name.clone(), info.kind))
		.collect();

	let (fragment, binds) = match options.filter {
		Some(filter) => {
			let (fragment, binds) = builder::expand_filters(filter, options.filters)?;
			(Some(fragment), binds)
		},
		None => (None, Vec::new()),
	};
	let tables = [source_table];
	let select_built = builder::select(
		source.dialect(),
		&SelectParts {
			tables: &tables,
			columns: &select_columns,
			filter: fragment.as_deref(),
			group_by: options.group_by,
			order_by: options.order_by,
			offset: options.offset,
			limit: options.limit,
		},
	);
	let insert_built = builder::insert(
		destination.dialect(),
		destination_table,
		&insert_columns,
		&vec![Value::Null; insert_columns.len()],
		Flags::empty(),
		&[],
	)?;

	// Lock plumbing the row callback can drop and reacquire while the
	// source cursor keeps the handles borrowed.
	let same_node = Arc::ptr_eq(source.node(), destination.node());
	let src_node = source.node().clone();
	let src_counts = source.lock_counts();
	let src_id = source.id();
	let dst_node = destination.node().clone();
	let dst_counts = destination.lock_counts();
	let dst_id = destination.id();
	let timeout = destination.timeout();

	let mut source_guard = if same_node {
		None
	} else {
		Some(LockGuard::acquire(
			src_node.clone(),
			src_counts.clone(),
			src_id,
			LockKind::Read,
			source.timeout(),
		)?)
	};
	let mut state = DestinationState {
		guard: Some(LockGuard::acquire(
			dst_node.clone(),
			dst_counts.clone(),
			dst_id,
			LockKind::ReadWrite,
			timeout,
		)?),
		tx_open: false,
	};
	if options.transaction {
		if let Err(err) = destination.begin_transaction(TransactionType::Deferred, timeout) {
			return Err(err);
		}
		state.tx_open = true;
	}

	let mut copied: u64 = 0;
	let mut statement =
		Statement::prepare(source, select_built, select_columns.clone(), Flags::empty())?;
	statement.bind_filters(binds)?;

	let destination_columns_ref = &destination_columns;
	let source_columns_ref = &source_columns;
	let result = statement.query(|row| {
		// a. Remap source values; the primary key gets the sentinel.
		let mut src_values: Vec<Value> = row.values().to_vec();
		let mut dst_values: Vec<Value> = from_column_map
			.iter()
			.map(|mapped| match mapped {
				Some(index) => row.get(*index).clone(),
				None => Value::Null,
			})
			.collect();
		if let Some(pk) = primary_key {
			dst_values[pk] = Value::Key(PRIMARY_KEY_ANY);
		}

		// b. Pre-row hook may rewrite the destination values.
		if let Some(pre_row) = callbacks.pre_row.as_mut() {
			let src_image = RowImage { columns: source_columns_ref, values: &mut src_values };
			let mut dst_image =
				RowImage { columns: destination_columns_ref, values: &mut dst_values };
			pre_row(&src_image, &mut dst_image)?;
		}

		// c/d. Insert through the parameter map and fetch the new id.
		let params: Vec<Value> =
			parameter_map.iter().map(|&index| dst_values[index].clone()).collect();
		let mut insert =
			Statement::prepare(destination, insert_built.clone(), Vec::new(), Flags::empty())?;
		insert.bind_values(&insert_columns, &params)?;
		insert.execute()?;
		let new_id = insert.last_insert_id();
		drop(insert);
		if let (Some(pk), Some(id)) = (primary_key, new_id) {
			dst_values[pk] = Value::Key(id);
		}

		// e. Post-row hook and progress callback.
		copied += 1;
		if let Some(post_row) = callbacks.post_row.as_mut() {
			let src_image = RowImage { columns: source_columns_ref, values: &mut src_values };
			let dst_image =
				RowImage { columns: destination_columns_ref, values: &mut dst_values };
			post_row(&src_image, &dst_image)?;
		}
		if let Some(progress) = callbacks.progress.as_mut() {
			progress(copied);
		}

		// f. Fairness: yield the destination to waiting threads, park
		// entirely while paused.
		let pausing = callbacks.pause.map_or(false, |pause| pause());
		if pausing || copied % YIELD_INTERVAL == 0 {
			if pausing {
				debug!("copy {} -> {}: pausing", source_table, destination_table);
				if state.tx_open {
					destination.end_transaction()?;
					state.tx_open = false;
				}
				state.guard = None;
				source_guard = None;
				while callbacks.pause.map_or(false, |pause| pause()) {
					thread::sleep(PAUSE_POLL);
				}
				if !same_node {
					source_guard = Some(LockGuard::acquire(
						src_node.clone(),
						src_counts.clone(),
						src_id,
						LockKind::Read,
						timeout,
					)?);
				}
				state.guard = Some(LockGuard::acquire(
					dst_node.clone(),
					dst_counts.clone(),
					dst_id,
					LockKind::ReadWrite,
					timeout,
				)?);
				if options.transaction {
					destination.begin_transaction(TransactionType::Deferred, timeout)?;
					state.tx_open = true;
				}
			} else if dst_node.has_waiters() {
				debug!("copy {} -> {}: yielding to waiters", source_table, destination_table);
				if state.tx_open {
					destination.end_transaction()?;
					state.tx_open = false;
				}
				state.guard = None;
				thread::yield_now();
				state.guard = Some(LockGuard::acquire(
					dst_node.clone(),
					dst_counts.clone(),
					dst_id,
					LockKind::ReadWrite,
					timeout,
				)?);
				if options.transaction {
					destination.begin_transaction(TransactionType::Deferred, timeout)?;
					state.tx_open = true;
				}
			}
		}
		Ok(true)
	});

	// 7. Wind down on every outcome; an abort rolls back.
	match result {
		Ok(_) => {
			if state.tx_open {
				destination.end_transaction()?;
			}
			drop(state.guard);
			drop(source_guard);
			if let Some(duration) = callbacks.duration {
				*duration += started.elapsed();
			}
			Ok(copied)
		},
		Err(err) => {
			if state.tx_open {
				let _ = destination.rollback_transaction();
			}
			drop(state.guard);
			drop(source_guard);
			if let Some(duration) = callbacks.duration {
				*duration += started.elapsed();
			}
			Err(err)
		},
	}
}
