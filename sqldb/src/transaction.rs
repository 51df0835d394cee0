// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Transaction control.
//!
//! A transaction is a write-locked scope: `begin` takes the node's write
//! lock and keeps it until `end` or `rollback`, so readers and writers on
//! other handles of the same node block for the transaction's duration.
//! The lock is released on every outcome, including SQL failures.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use log::warn;

use crate::driver::Dialect;
use crate::error::{Error, ErrorKind, Result};
use crate::handle::Handle;
use crate::node::LockKind;
use crate::options::{Timeout, TransactionType};

/// How long `begin` waits for already-pending lock requests to drain
/// before it competes for the write lock.
const DRAIN_WAIT: Duration = Duration::from_millis(250);

/// Minimum spacing of the opportunistic write-ahead-log truncation on
/// the embedded back-end.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(600);

impl Handle {
	/// Whether this handle has an open transaction.
	pub fn in_transaction(&self) -> bool {
		self.tx_guard.is_some()
	}

	/// Begin a transaction, promoting the handle to writer for the
	/// whole transaction scope.
	pub fn begin_transaction(&mut self, ty: TransactionType, timeout: Timeout) -> Result<()> {
		if self.in_transaction() {
			return Err(Error::new(ErrorKind::Database, "transaction already open"));
		}
		let node = self.node().clone();

		// Let requests that were already queued go first; the grant of
		// the last pending request signals the transaction trigger.
		node.wait_requests_drained(DRAIN_WAIT);

		node.transaction_pending_add();
		let locked = self.lock(LockKind::ReadWrite, timeout);
		node.transaction_pending_sub();
		let guard = locked?;

		let sql = match (self.dialect(), ty) {
			(Dialect::Sqlite, TransactionType::Deferred) => "BEGIN DEFERRED TRANSACTION",
			(Dialect::Sqlite, TransactionType::Immediate) => "BEGIN IMMEDIATE TRANSACTION",
			(Dialect::Sqlite, TransactionType::Exclusive) => "BEGIN EXCLUSIVE TRANSACTION",
			(Dialect::MariaDb, _) => "START TRANSACTION",
			(Dialect::PostgreSql, _) => "START TRANSACTION READ WRITE",
		};
		// A failed begin releases the write lock before returning.
		self.connection().execute_batch(sql)?;
		if let Err(err) = node.transaction_begin_mark(self.id()) {
			let rollback = rollback_sql(self.dialect());
			let _ = self.connection().execute_batch(rollback);
			drop(guard);
			return Err(err);
		}
		self.tx_guard = Some(guard);
		Ok(())
	}

	/// Commit the open transaction and release the write lock. The lock
	/// is released even when the commit itself fails.
	pub fn end_transaction(&mut self) -> Result<()> {
		let guard = self
			.tx_guard
			.take()
			.ok_or_else(|| Error::new(ErrorKind::Database, "no open transaction"))?;
		let sql = match self.dialect() {
			Dialect::Sqlite => "END TRANSACTION",
			_ => "COMMIT",
		};
		let node = self.node().clone();
		let result = self.connection().execute_batch(sql);
		node.transaction_end_mark(self.id());
		drop(guard);
		result?;
		self.maybe_checkpoint();
		Ok(())
	}

	/// Abort the open transaction and release the write lock.
	pub fn rollback_transaction(&mut self) -> Result<()> {
		let guard = self
			.tx_guard
			.take()
			.ok_or_else(|| Error::new(ErrorKind::Database, "no open transaction"))?;
		let node = self.node().clone();
		let rollback = rollback_sql(self.dialect());
		let result = self.connection().execute_batch(rollback);
		node.transaction_end_mark(self.id());
		drop(guard);
		result
	}

	/// Begin a scoped transaction that rolls back on drop unless
	/// committed.
	pub fn transaction(
		&mut self,
		ty: TransactionType,
		timeout: Timeout,
	) -> Result<Transaction<'_>> {
		self.begin_transaction(ty, timeout)?;
		Ok(Transaction { handle: self, open: true })
	}

	/// Truncate the embedded engine's write-ahead log when enough time
	/// has passed, under a fresh short-lived write lock.
	fn maybe_checkpoint(&mut self) {
		if self.dialect() != Dialect::Sqlite {
			return;
		}
		let node = self.node().clone();
		if !node.checkpoint_due(CHECKPOINT_INTERVAL) {
			return;
		}
		match self.lock(LockKind::ReadWrite, self.timeout()) {
			Ok(guard) => {
				if let Err(err) = self.connection().checkpoint() {
					warn!("write-ahead log checkpoint failed: {}", err);
				}
				drop(guard);
			},
			Err(err) => warn!("skipping checkpoint, write lock unavailable: {}", err),
		}
	}
}

fn rollback_sql(_dialect: Dialect) -> &'static str {
	"ROLLBACK"
}

/// Scoped transaction over a handle. Dereferences to the handle so
/// operations run inside the transaction; rolls back on drop unless
/// [`commit`] was called.
///
/// [`commit`]: Transaction::commit
pub struct Transaction<'h> {
	handle: &'h mut Handle,
	open: bool,
}

impl<'h> Transaction<'h> {
	/// Commit and release the write lock.
	pub fn commit(mut self) -> Result<()> {
		self.open = false;
		self.handle.end_transaction()
	}

	/// Roll back and release the write lock.
	pub fn rollback(mut self) -> Result<()> {
		self.open = false;
		self.handle.rollback_transaction()
	}
}

impl<'h> Deref for Transaction<'h> {
	type Target = Handle;

	fn deref(&self) -> &Handle {
		self.handle
	}
}

impl<'h> DerefMut for Transaction<'h> {
	fn deref_mut(&mut self) -> &mut Handle {
		self.handle
	}
}

impl<'h> Drop for Transaction<'h> {
	fn drop(&mut self) {
		if self.open {
			if let Err(err) = self.handle.rollback_transaction() {
				warn!("implicit rollback failed: {}", err);
			}
		}
	}
}
