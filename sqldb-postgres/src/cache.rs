// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-connection prepared-statement reuse cache, keyed by SQL text.

use std::collections::HashMap;
use std::time::Instant;

use log::{debug, trace};
use postgres::{Client, Statement};

use sqldb::Result;

use crate::map_error;

/// Entries above which a purge pass runs.
const SIZE_THRESHOLD: usize = 64;

/// Unused entries older than this are dropped during a purge.
const IDLE_LIMIT_SECONDS: u64 = 300;

struct Entry {
	statement: Statement,
	use_count: u32,
	last_use: Instant,
}

/// SQL-text-keyed cache of server-side prepared statements.
///
/// `checkout` prepares on miss and bumps the use count; `checkin` drops
/// it again. A purge evicts entries that nothing has checked out and
/// that have been idle past the limit; dropping the driver statement
/// closes it on the server. Eviction failures cannot occur here, and a
/// server that already dropped the statement surfaces on next use as a
/// normal error.
pub(crate) struct StatementCache {
	entries: HashMap<String, Entry>,
}

impl StatementCache {
	pub(crate) fn new() -> Self {
		Self { entries: HashMap::new() }
	}

	/// Fetch or prepare the statement for `sql`.
	pub(crate) fn checkout(&mut self, client: &mut Client, sql: &str) -> Result<Statement> {
		if self.entries.len() >= SIZE_THRESHOLD {
			self.purge();
		}
		if let Some(entry) = self.entries.get_mut(sql) {
			entry.use_count += 1;
			entry.last_use = Instant::now();
			trace!("statement cache hit: {}", sql);
			return Ok(entry.statement.clone());
		}
		let statement = client.prepare(sql).map_err(map_error)?;
		trace!("statement cache miss: {}", sql);
		self.entries.insert(
			sql.to_owned(),
			Entry { statement: statement.clone(), use_count: 1, last_use: Instant::now() },
		);
		Ok(statement)
	}

	/// Release one checkout of `sql`.
	pub(crate) fn checkin(&mut self, sql: &str) {
		if let Some(entry) = self.entries.get_mut(sql) {
			entry.use_count = entry.use_count.saturating_sub(1);
			entry.last_use = Instant::now();
		}
	}

	fn purge(&mut self) {
		let before = self.entries.len();
		self.entries.retain(|_, entry| {
			entry.use_count > 0 || entry.last_use.elapsed().as_secs() < IDLE_LIMIT_SECONDS
		});
		let evicted = before - self.entries.len();
		if evicted > 0 {
			debug!("statement cache purged {} of {} entries", evicted, before);
		}
	}
}
