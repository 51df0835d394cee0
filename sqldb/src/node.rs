// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The shared per-database node and its lock coordinator.
//!
//! One `Node` exists per distinct database; every handle opened against
//! that database shares it. The coordinator schedules shared readers and
//! one exclusive writer over native OS threads with a single mutex and
//! three broadcast condition variables. Re-entrance is per handle: a
//! handle that already holds a lock may acquire it again, and a reading
//! handle may promote itself to writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Error, ErrorKind, Result};
use crate::options::{Deadline, Timeout};
use crate::specifier::Specifier;

#[cfg(debug_assertions)]
use crate::history::{History, LockAction};

/// Kind of lock requested on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
	/// Shared; excludes foreign writers only.
	Read,
	/// Exclusive; excludes foreign readers and writers.
	ReadWrite,
}

/// Ceiling on any single condition-variable wait. Waits re-check their
/// predicate on every wake, so a lost trigger costs at most this long
/// even under `Timeout::Forever`.
const WAIT_CEILING: Duration = Duration::from_secs(5);

/// Callback invoked between busy retries; receives the attempt number.
pub type BusyHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// Callback polled during long operations; `false` interrupts.
pub type ProgressHandler = Arc<dyn Fn() -> bool + Send + Sync>;

/// Counter snapshot used by diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockCounters {
	/// Readers waiting to acquire.
	pub pending_read: u32,
	/// Granted read locks, re-entrant acquisitions included.
	pub read: u32,
	/// Writers waiting to acquire.
	pub pending_read_write: u32,
	/// Granted write locks; at most one distinct owner.
	pub read_write: u32,
	/// Transactions waiting to begin.
	pub pending_transaction: u32,
	/// Open transactions; zero or one.
	pub transaction: u32,
}

#[derive(Default)]
struct LockState {
	pending_read: u32,
	pending_read_write: u32,
	pending_transaction: u32,
	/// Granted read locks per handle.
	readers: HashMap<u64, u32>,
	/// Write owner and its re-entrant depth.
	writer: Option<(u64, u32)>,
	transaction: u32,
	transaction_owner: Option<u64>,
}

impl LockState {
	fn foreign_reader(&self, handle: u64) -> bool {
		self.readers.iter().any(|(&id, &count)| id != handle && count > 0)
	}

	fn foreign_writer(&self, handle: u64) -> bool {
		matches!(self.writer, Some((owner, _)) if owner != handle)
	}

	fn read_count(&self) -> u32 {
		self.readers.values().sum()
	}

	fn read_write_count(&self) -> u32 {
		self.writer.map_or(0, |(_, depth)| depth)
	}
}

/// Shared per-database entity: identity, open count, the lock
/// coordinator and the busy/progress handler lists.
pub struct Node {
	specifier: Specifier,
	open_count: AtomicU32,
	state: Mutex<LockState>,
	read_trigger: Condvar,
	read_write_trigger: Condvar,
	transaction_trigger: Condvar,
	busy_handlers: Mutex<Vec<BusyHandler>>,
	progress_handlers: Mutex<Vec<ProgressHandler>>,
	/// When the write-ahead log was last truncated.
	last_checkpoint: Mutex<Instant>,
	#[cfg(debug_assertions)]
	history: Mutex<History>,
}

impl Node {
	pub(crate) fn new(specifier: Specifier) -> Self {
		Self {
			specifier,
			open_count: AtomicU32::new(0),
			state: Mutex::new(LockState::default()),
			read_trigger: Condvar::new(),
			read_write_trigger: Condvar::new(),
			transaction_trigger: Condvar::new(),
			busy_handlers: Mutex::new(Vec::new()),
			progress_handlers: Mutex::new(Vec::new()),
			last_checkpoint: Mutex::new(Instant::now()),
			#[cfg(debug_assertions)]
			history: Mutex::new(History::default()),
		}
	}

	/// The identity this node was opened under.
	pub fn specifier(&self) -> &Specifier {
		&self.specifier
	}

	pub(crate) fn open_count(&self) -> u32 {
		self.open_count.load(Ordering::SeqCst)
	}

	pub(crate) fn retain(&self) -> u32 {
		self.open_count.fetch_add(1, Ordering::SeqCst) + 1
	}

	pub(crate) fn release(&self) -> u32 {
		self.open_count.fetch_sub(1, Ordering::SeqCst) - 1
	}

	/// Acquire `kind` for `handle`, waiting up to `timeout`.
	pub(crate) fn lock(&self, handle: u64, kind: LockKind, timeout: Timeout) -> Result<()> {
		let deadline = Deadline::new(timeout);
		let mut state = self.state.lock();
		match kind {
			LockKind::Read => {
				state.pending_read += 1;
				while state.foreign_writer(handle) {
					if !self.wait(&mut state, kind, handle, &deadline) {
						state.pending_read -= 1;
						self.notify_if_drained(&state);
						#[cfg(debug_assertions)]
						self.history.lock().record(LockAction::TimedOut, kind, handle);
						return Err(self.timeout_error(&state, kind));
					}
				}
				*state.readers.entry(handle).or_insert(0) += 1;
				state.pending_read -= 1;
			},
			LockKind::ReadWrite => {
				state.pending_read_write += 1;
				// Both predicates are re-checked after every wake: a
				// fresh reader may arrive while we wait out a writer.
				while state.foreign_reader(handle) || state.foreign_writer(handle) {
					if !self.wait(&mut state, kind, handle, &deadline) {
						state.pending_read_write -= 1;
						self.notify_if_drained(&state);
						#[cfg(debug_assertions)]
						self.history.lock().record(LockAction::TimedOut, kind, handle);
						return Err(self.timeout_error(&state, kind));
					}
				}
				if let Some((owner, depth)) = state.writer.as_mut() {
					debug_assert_eq!(*owner, handle);
					*depth += 1;
				} else {
					state.writer = Some((handle, 1));
				}
				state.pending_read_write -= 1;
			},
		}
		self.notify_if_drained(&state);
		#[cfg(debug_assertions)]
		self.history.lock().record(LockAction::Locked, kind, handle);
		trace!("{}: locked {:?} for handle {}", self.specifier, kind, handle);
		Ok(())
	}

	/// Release `kind` for `handle`. When the affected counter reaches
	/// zero every waiter is woken to re-evaluate its predicate.
	pub(crate) fn unlock(&self, handle: u64, kind: LockKind) {
		let mut state = self.state.lock();
		match kind {
			LockKind::Read => {
				match state.readers.get_mut(&handle) {
					Some(count) => {
						*count -= 1;
						if *count == 0 {
							state.readers.remove(&handle);
						}
					},
					None => debug_assert!(false, "read unlock without lock"),
				}
				if state.readers.is_empty() {
					self.read_trigger.notify_all();
					self.read_write_trigger.notify_all();
				}
			},
			LockKind::ReadWrite => {
				match state.writer.as_mut() {
					Some((owner, depth)) => {
						debug_assert_eq!(*owner, handle, "write unlock by foreign handle");
						*depth -= 1;
						if *depth == 0 {
							state.writer = None;
						}
					},
					None => debug_assert!(false, "write unlock without lock"),
				}
				if state.writer.is_none() {
					self.read_trigger.notify_all();
					self.read_write_trigger.notify_all();
				}
			},
		}
		#[cfg(debug_assertions)]
		self.history.lock().record(LockAction::Unlocked, kind, handle);
		trace!("{}: unlocked {:?} for handle {}", self.specifier, kind, handle);
	}

	/// One bounded wait on the trigger matching what blocks `kind`.
	/// Returns `false` once the deadline is spent.
	fn wait(
		&self,
		state: &mut MutexGuard<'_, LockState>,
		kind: LockKind,
		handle: u64,
		deadline: &Deadline,
	) -> bool {
		if deadline.expired() {
			return false;
		}
		let chunk = deadline.clamp(WAIT_CEILING);
		let trigger = match kind {
			// Readers only ever wait out a writer.
			LockKind::Read => &self.read_write_trigger,
			LockKind::ReadWrite => {
				if state.foreign_reader(handle) {
					&self.read_trigger
				} else {
					&self.read_write_trigger
				}
			},
		};
		trigger.wait_for(state, chunk);
		!deadline.expired()
	}

	fn timeout_error(&self, _state: &LockState, kind: LockKind) -> Error {
		#[cfg(debug_assertions)]
		{
			if let Some(holder) = self.history.lock().current_holder() {
				return Error::new(
					ErrorKind::Timeout,
					format!("{:?} lock on {} timed out; locked by {}", kind, self.specifier, holder),
				);
			}
		}
		Error::new(ErrorKind::Timeout, format!("{:?} lock on {} timed out", kind, self.specifier))
	}

	/// Wake transaction-trigger waiters once no read or write request
	/// is pending any more.
	fn notify_if_drained(&self, state: &LockState) {
		if state.pending_read + state.pending_read_write == 0 {
			self.transaction_trigger.notify_all();
		}
	}

	/// Block until no read or write request is pending, or `max` has
	/// passed. Transaction begin lets already-queued requests go first
	/// through this wait.
	pub(crate) fn wait_requests_drained(&self, max: Duration) {
		let deadline = Deadline::new(Timeout::Duration(max));
		let mut state = self.state.lock();
		while state.pending_read + state.pending_read_write > 0 && !deadline.expired() {
			let chunk = deadline.clamp(WAIT_CEILING);
			self.transaction_trigger.wait_for(&mut state, chunk);
		}
	}

	/// Whether any other request is waiting on this node's locks. The
	/// table-copy engine yields its transaction when this turns true.
	pub(crate) fn has_waiters(&self) -> bool {
		let state = self.state.lock();
		state.pending_read + state.pending_read_write + state.pending_transaction > 0
	}

	/// Counter snapshot for diagnostics and tests.
	pub fn counters(&self) -> LockCounters {
		let state = self.state.lock();
		LockCounters {
			pending_read: state.pending_read,
			read: state.read_count(),
			pending_read_write: state.pending_read_write,
			read_write: state.read_write_count(),
			pending_transaction: state.pending_transaction,
			transaction: state.transaction,
		}
	}

	pub(crate) fn transaction_pending_add(&self) {
		self.state.lock().pending_transaction += 1;
	}

	pub(crate) fn transaction_pending_sub(&self) {
		let mut state = self.state.lock();
		debug_assert!(state.pending_transaction > 0);
		state.pending_transaction -= 1;
	}

	/// Mark a transaction open. The caller holds the write lock.
	pub(crate) fn transaction_begin_mark(&self, handle: u64) -> Result<()> {
		let mut state = self.state.lock();
		debug_assert!(state.writer.is_some(), "transaction without write lock");
		if state.transaction != 0 {
			// The write lock serialises transactions; getting here with
			// one open means a handle tried to nest.
			return Err(Error::new(
				ErrorKind::Database,
				format!("nested transaction on {}", self.specifier),
			));
		}
		state.transaction = 1;
		state.transaction_owner = Some(handle);
		Ok(())
	}

	/// Mark the transaction closed and wake transaction waiters.
	pub(crate) fn transaction_end_mark(&self, handle: u64) {
		let mut state = self.state.lock();
		debug_assert_eq!(state.transaction_owner, Some(handle));
		state.transaction = 0;
		state.transaction_owner = None;
		self.transaction_trigger.notify_all();
	}

	/// Register `handler` to run between busy retries. Registration is
	/// idempotent on handler identity.
	pub fn register_busy_handler(&self, handler: &BusyHandler) {
		let mut handlers = self.busy_handlers.lock();
		if !handlers.iter().any(|h| Arc::ptr_eq(h, handler)) {
			handlers.push(handler.clone());
		}
	}

	/// Remove a previously registered busy handler.
	pub fn unregister_busy_handler(&self, handler: &BusyHandler) {
		self.busy_handlers.lock().retain(|h| !Arc::ptr_eq(h, handler));
	}

	/// Invoke every busy handler in registration order. Handlers run
	/// outside the list lock so they may re-register.
	pub(crate) fn run_busy_handlers(&self, attempt: u32) {
		let handlers: Vec<_> = self.busy_handlers.lock().clone();
		for handler in handlers {
			handler(attempt);
		}
	}

	/// Register `handler` to be polled during long operations.
	/// Registration is idempotent on handler identity.
	pub fn register_progress_handler(&self, handler: &ProgressHandler) {
		let mut handlers = self.progress_handlers.lock();
		if !handlers.iter().any(|h| Arc::ptr_eq(h, handler)) {
			handlers.push(handler.clone());
		}
	}

	/// Remove a previously registered progress handler.
	pub fn unregister_progress_handler(&self, handler: &ProgressHandler) {
		self.progress_handlers.lock().retain(|h| !Arc::ptr_eq(h, handler));
	}

	/// Poll every progress handler; `false` as soon as any interrupts.
	pub(crate) fn progress_ok(&self) -> bool {
		let handlers: Vec<_> = self.progress_handlers.lock().clone();
		handlers.iter().all(|handler| handler())
	}

	pub(crate) fn has_progress_handlers(&self) -> bool {
		!self.progress_handlers.lock().is_empty()
	}

	/// Whether the periodic write-ahead-log truncation is due, and if
	/// so, reset the clock.
	pub(crate) fn checkpoint_due(&self, interval: Duration) -> bool {
		let mut last = self.last_checkpoint.lock();
		if last.elapsed() >= interval {
			*last = Instant::now();
			true
		} else {
			false
		}
	}

	/// Dump the debug lock history.
	#[cfg(debug_assertions)]
	pub fn lock_history(&self) -> String {
		self.history.lock().dump()
	}
}

impl Drop for Node {
	fn drop(&mut self) {
		let state = self.state.get_mut();
		debug_assert!(state.readers.is_empty(), "node dropped with read locks held");
		debug_assert!(state.writer.is_none(), "node dropped with write lock held");
		debug!("{}: node destroyed", self.specifier);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::thread;

	fn test_node() -> Arc<Node> {
		Arc::new(Node::new(Specifier::parse("sqlite:coordinator-test", None)))
	}

	#[test]
	fn counters_restored_after_unlock() {
		let node = test_node();
		let before = node.counters();
		node.lock(1, LockKind::Read, Timeout::Forever).unwrap();
		node.lock(1, LockKind::Read, Timeout::Forever).unwrap();
		assert_eq!(node.counters().read, 2);
		node.unlock(1, LockKind::Read);
		node.unlock(1, LockKind::Read);
		assert_eq!(node.counters(), before);
	}

	#[test]
	fn same_handle_reenters_write_lock() {
		let node = test_node();
		node.lock(1, LockKind::ReadWrite, Timeout::Forever).unwrap();
		node.lock(1, LockKind::ReadWrite, Timeout::ms(50)).unwrap();
		assert_eq!(node.counters().read_write, 2);
		node.unlock(1, LockKind::ReadWrite);
		node.unlock(1, LockKind::ReadWrite);
		assert_eq!(node.counters().read_write, 0);
	}

	#[test]
	fn reading_handle_promotes_to_writer() {
		let node = test_node();
		node.lock(1, LockKind::Read, Timeout::Forever).unwrap();
		node.lock(1, LockKind::ReadWrite, Timeout::ms(50)).unwrap();
		node.unlock(1, LockKind::ReadWrite);
		node.unlock(1, LockKind::Read);
	}

	#[test]
	fn writer_blocks_foreign_reader_until_released() {
		let node = test_node();
		node.lock(1, LockKind::ReadWrite, Timeout::Forever).unwrap();

		let other = node.clone();
		let reader = thread::spawn(move || {
			let started = Instant::now();
			other.lock(2, LockKind::Read, Timeout::ms(1000)).unwrap();
			let waited = started.elapsed();
			let counters = other.counters();
			other.unlock(2, LockKind::Read);
			(waited, counters)
		});

		thread::sleep(Duration::from_millis(200));
		node.unlock(1, LockKind::ReadWrite);

		let (waited, counters) = reader.join().unwrap();
		assert!(waited >= Duration::from_millis(150), "reader returned early: {:?}", waited);
		assert_eq!(counters.read, 1);
		assert_eq!(counters.read_write, 0);
	}

	#[test]
	fn foreign_writer_times_out_within_budget() {
		let node = test_node();
		node.lock(1, LockKind::ReadWrite, Timeout::Forever).unwrap();

		let other = node.clone();
		let waiter = thread::spawn(move || {
			let started = Instant::now();
			let result = other.lock(2, LockKind::ReadWrite, Timeout::ms(100));
			(result, started.elapsed())
		});
		let (result, waited) = waiter.join().unwrap();
		assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
		assert!(waited >= Duration::from_millis(100));
		assert!(waited < Duration::from_secs(2));
		assert_eq!(node.counters().pending_read_write, 0);

		node.unlock(1, LockKind::ReadWrite);
	}

	#[test]
	fn writer_waits_for_foreign_readers() {
		let node = test_node();
		node.lock(1, LockKind::Read, Timeout::Forever).unwrap();

		let other = node.clone();
		let writer = thread::spawn(move || {
			other.lock(2, LockKind::ReadWrite, Timeout::ms(1000)).unwrap();
			let counters = other.counters();
			other.unlock(2, LockKind::ReadWrite);
			counters
		});

		thread::sleep(Duration::from_millis(100));
		assert_eq!(node.counters().pending_read_write, 1);
		node.unlock(1, LockKind::Read);

		let counters = writer.join().unwrap();
		assert_eq!(counters.read_write, 1);
		assert_eq!(counters.read, 0);
	}

	#[test]
	fn drain_wait_wakes_on_grant() {
		let node = test_node();
		// Nothing pending: returns at once.
		let started = Instant::now();
		node.wait_requests_drained(Duration::from_millis(500));
		assert!(started.elapsed() < Duration::from_millis(100));

		node.lock(1, LockKind::ReadWrite, Timeout::Forever).unwrap();
		let other = node.clone();
		let reader = thread::spawn(move || {
			other.lock(2, LockKind::Read, Timeout::ms(2000)).unwrap();
			other.unlock(2, LockKind::Read);
		});
		while node.counters().pending_read == 0 {
			thread::sleep(Duration::from_millis(5));
		}

		let drainer = node.clone();
		let drained = thread::spawn(move || {
			let started = Instant::now();
			drainer.wait_requests_drained(Duration::from_secs(2));
			started.elapsed()
		});
		thread::sleep(Duration::from_millis(50));
		node.unlock(1, LockKind::ReadWrite);

		// The grant of the queued read drains the pending count and
		// wakes the transaction trigger.
		let waited = drained.join().unwrap();
		assert!(waited < Duration::from_secs(1), "drain missed the wakeup: {:?}", waited);
		reader.join().unwrap();
	}

	#[test]
	fn busy_handler_registration_is_idempotent() {
		let node = test_node();
		let calls = Arc::new(AtomicU32::new(0));
		let observed = calls.clone();
		let handler: BusyHandler = Arc::new(move |_| {
			observed.fetch_add(1, Ordering::SeqCst);
		});
		node.register_busy_handler(&handler);
		node.register_busy_handler(&handler);
		node.run_busy_handlers(0);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		node.unregister_busy_handler(&handler);
		node.run_busy_handlers(1);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn progress_handlers_poll_until_one_interrupts() {
		let node = test_node();
		let continue_all: ProgressHandler = Arc::new(|| true);
		node.register_progress_handler(&continue_all);
		assert!(node.progress_ok());
		let interrupt: ProgressHandler = Arc::new(|| false);
		node.register_progress_handler(&interrupt);
		assert!(!node.progress_ok());
	}

	#[test]
	fn nested_transaction_is_rejected() {
		let node = test_node();
		node.lock(1, LockKind::ReadWrite, Timeout::Forever).unwrap();
		node.transaction_begin_mark(1).unwrap();
		assert!(node.transaction_begin_mark(1).is_err());
		node.transaction_end_mark(1);
		node.unlock(1, LockKind::ReadWrite);
	}
}
