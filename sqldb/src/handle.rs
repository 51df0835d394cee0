// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A single caller's connection to a node.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::driver::{Connection, Dialect, Interrupter};
use crate::error::Result;
use crate::node::{BusyHandler, LockKind, Node, ProgressHandler};
use crate::options::Timeout;
use crate::registry;

/// Re-entrant lock counters of one handle. Shared with the guards so a
/// guard can release exactly what its handle acquired without borrowing
/// the handle across the SQL it protects.
#[derive(Default)]
pub(crate) struct LockCounts {
	read: AtomicU32,
	read_write: AtomicU32,
}

/// A caller's connection to one database.
///
/// A handle references exactly one shared [`Node`], owns one back-end
/// connection and is used from one thread at a time. Locks taken through
/// a handle are re-entrant; dropping the handle decrements the node's
/// open count and removes the node once the last handle is gone.
pub struct Handle {
	id: u64,
	node: Arc<Node>,
	conn: Box<dyn Connection>,
	counts: Arc<LockCounts>,
	interrupter: Arc<dyn Interrupter>,
	timeout: Timeout,
	/// Write lock held for the lifetime of an open transaction.
	pub(crate) tx_guard: Option<LockGuard>,
}

impl std::fmt::Debug for Handle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Handle").field("id", &self.id).finish_non_exhaustive()
	}
}

impl Handle {
	pub(crate) fn new(id: u64, node: Arc<Node>, conn: Box<dyn Connection>, timeout: Timeout) -> Self {
		let interrupter = conn.interrupter();
		Self {
			id,
			node,
			conn,
			counts: Arc::new(LockCounts::default()),
			interrupter,
			timeout,
			tx_guard: None,
		}
	}

	/// The shared node this handle belongs to.
	pub fn node(&self) -> &Arc<Node> {
		&self.node
	}

	/// The dialect of the underlying connection.
	pub fn dialect(&self) -> Dialect {
		self.conn.dialect()
	}

	/// Default timeout applied to locks and busy retries.
	pub fn timeout(&self) -> Timeout {
		self.timeout
	}

	/// Change the default timeout.
	pub fn set_timeout(&mut self, timeout: Timeout) {
		self.timeout = timeout;
	}

	/// Read locks currently held by this handle.
	pub fn read_lock_count(&self) -> u32 {
		self.counts.read.load(Ordering::SeqCst)
	}

	/// Write locks currently held by this handle.
	pub fn read_write_lock_count(&self) -> u32 {
		self.counts.read_write.load(Ordering::SeqCst)
	}

	pub(crate) fn id(&self) -> u64 {
		self.id
	}

	pub(crate) fn lock_counts(&self) -> Arc<LockCounts> {
		self.counts.clone()
	}

	pub(crate) fn connection(&mut self) -> &mut dyn Connection {
		&mut *self.conn
	}

	/// Acquire `kind` on the node, returning a guard that releases it on
	/// drop. The guard does not borrow the handle, so SQL may run on the
	/// handle while the guard is alive.
	pub fn lock(&self, kind: LockKind, timeout: Timeout) -> Result<LockGuard> {
		LockGuard::acquire(self.node.clone(), self.counts.clone(), self.id, kind, timeout)
	}

	/// Acquire `kind` with the handle's default timeout.
	pub fn lock_default(&self, kind: LockKind) -> Result<LockGuard> {
		self.lock(kind, self.timeout)
	}

	/// A token that cancels this connection's in-flight statement. Safe
	/// to call from another thread; the interrupted statement surfaces
	/// `ErrorKind::Interrupted` and its locks are released as usual.
	pub fn interrupter(&self) -> Arc<dyn Interrupter> {
		self.interrupter.clone()
	}

	/// Cancel this connection's in-flight statement. Synchronous on the
	/// embedded engine, best-effort on the servers.
	pub fn interrupt(&self) {
		self.interrupter.interrupt();
	}

	/// Register a busy handler on the shared node.
	pub fn register_busy_handler(&self, handler: &BusyHandler) {
		self.node.register_busy_handler(handler)
	}

	/// Remove a busy handler from the shared node.
	pub fn unregister_busy_handler(&self, handler: &BusyHandler) {
		self.node.unregister_busy_handler(handler)
	}

	/// Register a progress handler on the shared node.
	pub fn register_progress_handler(&self, handler: &ProgressHandler) {
		self.node.register_progress_handler(handler)
	}

	/// Remove a progress handler from the shared node.
	pub fn unregister_progress_handler(&self, handler: &ProgressHandler) {
		self.node.unregister_progress_handler(handler)
	}
}

impl Drop for Handle {
	fn drop(&mut self) {
		if self.tx_guard.take().is_some() {
			debug_assert!(false, "handle dropped inside an open transaction");
			self.node.transaction_end_mark(self.id);
		}
		debug_assert_eq!(self.read_lock_count(), 0, "handle dropped with read locks held");
		debug_assert_eq!(self.read_write_lock_count(), 0, "handle dropped with write locks held");
		registry::release_node(&self.node);
	}
}

/// Scoped lock on a node. Releases on drop on every exit path.
pub struct LockGuard {
	node: Arc<Node>,
	counts: Arc<LockCounts>,
	handle: u64,
	kind: LockKind,
}

impl std::fmt::Debug for LockGuard {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LockGuard")
			.field("handle", &self.handle)
			.field("kind", &self.kind)
			.finish_non_exhaustive()
	}
}

impl LockGuard {
	/// Acquire a lock on behalf of a handle whose connection is busy
	/// elsewhere (the table-copy engine yields and reacquires its locks
	/// while its source cursor is open).
	pub(crate) fn acquire(
		node: Arc<Node>,
		counts: Arc<LockCounts>,
		handle: u64,
		kind: LockKind,
		timeout: Timeout,
	) -> Result<LockGuard> {
		node.lock(handle, kind, timeout)?;
		match kind {
			LockKind::Read => counts.read.fetch_add(1, Ordering::SeqCst),
			LockKind::ReadWrite => counts.read_write.fetch_add(1, Ordering::SeqCst),
		};
		Ok(LockGuard { node, counts, handle, kind })
	}
}

impl Drop for LockGuard {
	fn drop(&mut self) {
		match self.kind {
			LockKind::Read => self.counts.read.fetch_sub(1, Ordering::SeqCst),
			LockKind::ReadWrite => self.counts.read_write.fetch_sub(1, Ordering::SeqCst),
		};
		self.node.unlock(self.handle, self.kind);
	}
}
