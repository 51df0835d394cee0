// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Open modes, operation flags, timeouts and transaction types.

use std::time::{Duration, Instant};

use bitflags::bitflags;

bitflags! {
	/// How a database is opened. Modes compose as a flag set.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct OpenMode: u32 {
		/// Open for reading only.
		const READ_ONLY = 1 << 0;
		/// Open for reading and writing.
		const READ_WRITE = 1 << 1;
		/// Create the database if it does not exist.
		const CREATE = 1 << 2;
		/// Delete an existing sqlite file first; create the database
		/// on server back-ends.
		const FORCE_CREATE = 1 << 3;
		/// Embedded back-end only: keep the database in memory.
		const MEMORY = 1 << 4;
		/// Embedded back-end only: shared cache between handles.
		const SHARED = 1 << 5;
		/// Attach an in-memory auxiliary schema named `aux` hosting the
		/// temporary tables addressed via `%1..%9`.
		const AUX = 1 << 6;
	}
}

impl Default for OpenMode {
	fn default() -> Self {
		OpenMode::READ_WRITE
	}
}

bitflags! {
	/// Per-operation behaviour flags for select/insert/update/delete.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct Flags: u32 {
		/// Duplicates are silently skipped on insert.
		const IGNORE = 1 << 0;
		/// On conflict, overwrite. PostgreSQL requires conflict columns.
		const REPLACE = 1 << 1;
		/// Treat the SQL as pre-built; do not re-assemble.
		const PLAIN = 1 << 2;
		/// Emit the assembled SQL to stderr.
		const DEBUG = 1 << 3;
		/// Populate the name field of each result slot.
		const COLUMN_NAMES = 1 << 4;
		/// Materialise all rows before returning (PostgreSQL).
		const FETCH_ALL = 1 << 5;
	}
}

bitflags! {
	/// Schema-comparison behaviour.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct CompareFlags: u32 {
		/// Do not report tables or columns that exist only in the target.
		const IGNORE_OBSOLETE = 1 << 0;
	}
}

/// Sentinel for "no limit" in select/delete operations.
pub const UNLIMITED: u64 = u64::MAX;

/// How long a lock acquisition or busy retry may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
	/// Wait until the lock is granted.
	Forever,
	/// Give up after this long.
	Duration(Duration),
}

impl Timeout {
	/// A timeout of `ms` milliseconds.
	pub fn ms(ms: u64) -> Self {
		Timeout::Duration(Duration::from_millis(ms))
	}
}

/// Tracks the remaining budget of a [`Timeout`] across several waits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
	end: Option<Instant>,
}

impl Deadline {
	pub(crate) fn new(timeout: Timeout) -> Self {
		let end = match timeout {
			Timeout::Forever => None,
			Timeout::Duration(d) => Some(Instant::now() + d),
		};
		Self { end }
	}

	/// Remaining budget; `None` means unbounded.
	pub(crate) fn remaining(&self) -> Option<Duration> {
		self.end.map(|end| end.saturating_duration_since(Instant::now()))
	}

	pub(crate) fn expired(&self) -> bool {
		matches!(self.remaining(), Some(d) if d.is_zero())
	}

	/// Clamp `want` to the remaining budget.
	pub(crate) fn clamp(&self, want: Duration) -> Duration {
		match self.remaining() {
			Some(rest) => want.min(rest),
			None => want,
		}
	}
}

/// Transaction type. Maps to `BEGIN <type> TRANSACTION` on the embedded
/// back-end; the servers always start a plain read-write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
	/// Take locks lazily, on first use.
	Deferred,
	/// Take the write lock immediately.
	Immediate,
	/// Exclude readers as well.
	Exclusive,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn modes_compose() {
		let mode = OpenMode::READ_WRITE | OpenMode::CREATE | OpenMode::AUX;
		assert!(mode.contains(OpenMode::CREATE));
		assert!(!mode.contains(OpenMode::FORCE_CREATE));
	}

	#[test]
	fn deadline_clamps_to_budget() {
		let deadline = Deadline::new(Timeout::ms(10));
		assert!(deadline.clamp(Duration::from_secs(5)) <= Duration::from_millis(10));
		let forever = Deadline::new(Timeout::Forever);
		assert_eq!(forever.clamp(Duration::from_secs(5)), Duration::from_secs(5));
		assert!(!forever.expired());
	}
}
