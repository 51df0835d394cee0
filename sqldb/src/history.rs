// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Debug-build ring buffer of lock events. Timeout diagnostics read the
//! most recent acquisitions out of it; release builds compile all of
//! this away.

use std::collections::VecDeque;
use std::fmt;
use std::thread::ThreadId;
use std::time::Instant;

use crate::node::LockKind;

const CAPACITY: usize = 64;

/// What happened to a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
	/// The lock was granted.
	Locked,
	/// The lock was released.
	Unlocked,
	/// A wait gave up.
	TimedOut,
}

/// One recorded lock event.
#[derive(Debug, Clone)]
pub struct LockEvent {
	/// Granted, released or timed out.
	pub action: LockAction,
	/// Read or read-write.
	pub kind: LockKind,
	/// Handle the event belongs to.
	pub handle: u64,
	/// Thread that performed it.
	pub thread: ThreadId,
	/// When it happened.
	pub at: Instant,
}

impl fmt::Display for LockEvent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{:?} {:?} handle={} thread={:?}",
			self.action, self.kind, self.handle, self.thread
		)
	}
}

/// Bounded ring of the most recent lock events on one node.
#[derive(Default)]
pub struct History {
	events: VecDeque<LockEvent>,
}

impl History {
	pub(crate) fn record(&mut self, action: LockAction, kind: LockKind, handle: u64) {
		if self.events.len() == CAPACITY {
			self.events.pop_front();
		}
		self.events.push_back(LockEvent {
			action,
			kind,
			handle,
			thread: std::thread::current().id(),
			at: Instant::now(),
		});
	}

	/// The most recent grant still outstanding for diagnostics, i.e.
	/// the last `Locked` event without a later `Unlocked` from the same
	/// handle and kind.
	pub fn current_holder(&self) -> Option<&LockEvent> {
		let mut holder = None;
		for event in &self.events {
			match event.action {
				LockAction::Locked => holder = Some(event),
				LockAction::Unlocked => {
					if let Some(h) = holder {
						if h.handle == event.handle && h.kind == event.kind {
							holder = None;
						}
					}
				},
				LockAction::TimedOut => {},
			}
		}
		holder
	}

	/// Render the ring for a diagnostic message, newest last.
	pub fn dump(&self) -> String {
		let mut out = String::new();
		for event in &self.events {
			out.push_str(&event.to_string());
			out.push('\n');
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ring_is_bounded() {
		let mut history = History::default();
		for i in 0..(CAPACITY as u64 + 10) {
			history.record(LockAction::Locked, LockKind::Read, i);
		}
		assert_eq!(history.events.len(), CAPACITY);
		assert_eq!(history.events.front().unwrap().handle, 10);
	}

	#[test]
	fn current_holder_tracks_outstanding_grant() {
		let mut history = History::default();
		history.record(LockAction::Locked, LockKind::ReadWrite, 1);
		assert_eq!(history.current_holder().unwrap().handle, 1);
		history.record(LockAction::Unlocked, LockKind::ReadWrite, 1);
		assert!(history.current_holder().is_none());
	}
}
