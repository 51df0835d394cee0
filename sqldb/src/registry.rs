// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The process-wide registry of database nodes and back-end connectors.
//!
//! Opening the same database twice yields two handles sharing one node,
//! so their locks coordinate. Connectors are installed once per back-end
//! family, normally by calling `register()` of the adapter crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::driver::{Connector, DriverHooks};
use crate::error::{Error, ErrorKind, Result};
use crate::handle::Handle;
use crate::node::Node;
use crate::options::{OpenMode, Timeout};
use crate::specifier::{Backend, Specifier};

struct Registry {
	nodes: Mutex<Vec<Arc<Node>>>,
	connectors: RwLock<HashMap<Backend, Arc<dyn Connector>>>,
	next_handle_id: AtomicU64,
}

static REGISTRY: Lazy<Registry> = Lazy::new(|| Registry {
	nodes: Mutex::new(Vec::new()),
	connectors: RwLock::new(HashMap::new()),
	next_handle_id: AtomicU64::new(1),
});

/// Install the connector for one back-end family. Later registrations
/// replace earlier ones, which tests use to install mocks.
pub fn register_connector(backend: Backend, connector: Arc<dyn Connector>) {
	REGISTRY.connectors.write().insert(backend, connector);
}

/// Open a handle for a URI; see [`Specifier::parse`] for the shape.
pub fn open_uri(
	uri: &str,
	default_database: Option<&str>,
	mode: OpenMode,
	timeout: Timeout,
) -> Result<Handle> {
	open(&Specifier::parse(uri, default_database), mode, timeout)
}

/// Open a handle for a parsed specifier.
///
/// A node with the same identity (password ignored) is reused; otherwise
/// a fresh node is added to the registry. The back-end connection itself
/// is opened outside the registry lock.
pub fn open(spec: &Specifier, mode: OpenMode, timeout: Timeout) -> Result<Handle> {
	let connector = REGISTRY.connectors.read().get(&spec.backend()).cloned().ok_or_else(|| {
		Error::new(
			ErrorKind::FunctionNotSupported,
			format!("no back-end registered for {}", spec),
		)
	})?;

	let node = {
		let mut nodes = REGISTRY.nodes.lock();
		match nodes.iter().find(|node| node.specifier().matches(spec, None)) {
			Some(node) => {
				node.retain();
				node.clone()
			},
			None => {
				let node = Arc::new(Node::new(spec.clone()));
				node.retain();
				nodes.push(node.clone());
				debug!("{}: node created", spec);
				node
			},
		}
	};

	let hooks = {
		let weak = Arc::downgrade(&node);
		DriverHooks {
			progress: Arc::new(move || weak.upgrade().map_or(true, |node| node.progress_ok())),
		}
	};

	match connector.connect(spec, mode, hooks) {
		Ok(conn) => {
			let id = REGISTRY.next_handle_id.fetch_add(1, Ordering::Relaxed);
			Ok(Handle::new(id, node, conn, timeout))
		},
		Err(err) => {
			release_node(&node);
			Err(err)
		},
	}
}

/// Drop one reference to `node`; the last reference removes it from the
/// registry, destroying the coordinator state and handler lists with it.
pub(crate) fn release_node(node: &Arc<Node>) {
	let mut nodes = REGISTRY.nodes.lock();
	if node.release() == 0 {
		nodes.retain(|candidate| !Arc::ptr_eq(candidate, node));
	}
}

/// Number of live nodes; diagnostic.
pub fn node_count() -> usize {
	REGISTRY.nodes.lock().len()
}

/// Whether a node for `spec` is currently open; diagnostic.
pub fn is_open(spec: &Specifier) -> bool {
	REGISTRY.nodes.lock().iter().any(|node| node.specifier().matches(spec, None))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::driver::{
		Connection, Dialect, ExecOutcome, Interrupter, NullInterrupter, QueryOptions, RowCallback,
	};
	use crate::value::{ColumnInfo, Value};

	/// Driver stub: accepts every statement, returns no rows.
	struct StubConnection;

	impl Connection for StubConnection {
		fn dialect(&self) -> Dialect {
			Dialect::Sqlite
		}

		fn execute_batch(&mut self, _sql: &str) -> Result<()> {
			Ok(())
		}

		fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<ExecOutcome> {
			Ok(ExecOutcome::default())
		}

		fn query(
			&mut self,
			_sql: &str,
			_params: &[Value],
			_options: QueryOptions,
			_row_fn: &mut RowCallback<'_>,
		) -> Result<u64> {
			Ok(0)
		}

		fn interrupter(&self) -> Arc<dyn Interrupter> {
			Arc::new(NullInterrupter)
		}

		fn table_names(&mut self) -> Result<Vec<String>> {
			Ok(Vec::new())
		}

		fn view_names(&mut self) -> Result<Vec<String>> {
			Ok(Vec::new())
		}

		fn index_names(&mut self) -> Result<Vec<String>> {
			Ok(Vec::new())
		}

		fn trigger_names(&mut self) -> Result<Vec<String>> {
			Ok(Vec::new())
		}

		fn table_columns(&mut self, _table: &str) -> Result<Vec<ColumnInfo>> {
			Ok(Vec::new())
		}
	}

	struct StubConnector;

	impl Connector for StubConnector {
		fn connect(
			&self,
			_spec: &Specifier,
			_mode: OpenMode,
			_hooks: DriverHooks,
		) -> Result<Box<dyn Connection>> {
			Ok(Box::new(StubConnection))
		}
	}

	fn install_stub() {
		register_connector(Backend::Sqlite, Arc::new(StubConnector));
	}

	#[test]
	fn open_deduplicates_nodes() {
		install_stub();
		let spec = Specifier::parse("sqlite:registry-dedupe-test", None);
		let a = open(&spec, OpenMode::default(), Timeout::Forever).unwrap();
		let b = open(&spec, OpenMode::default(), Timeout::Forever).unwrap();
		assert!(Arc::ptr_eq(a.node(), b.node()));
		drop(a);
		assert!(is_open(&spec));
		drop(b);
		assert!(!is_open(&spec));
	}

	#[test]
	fn distinct_databases_get_distinct_nodes() {
		install_stub();
		let a = open_uri("sqlite:registry-a", None, OpenMode::default(), Timeout::Forever).unwrap();
		let b = open_uri("sqlite:registry-b", None, OpenMode::default(), Timeout::Forever).unwrap();
		assert!(!Arc::ptr_eq(a.node(), b.node()));
	}

	#[test]
	fn unregistered_backend_is_rejected() {
		let spec = Specifier::parse("mariadb:nohost:nouser", Some("db"));
		let err = open(&spec, OpenMode::default(), Timeout::Forever).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::FunctionNotSupported);
	}

	#[test]
	fn locks_coordinate_across_handles_of_one_node() {
		use crate::node::LockKind;
		install_stub();
		let spec = Specifier::parse("sqlite:registry-lock-test", None);
		let a = open(&spec, OpenMode::default(), Timeout::Forever).unwrap();
		let b = open(&spec, OpenMode::default(), Timeout::Forever).unwrap();

		let guard = a.lock(LockKind::ReadWrite, Timeout::Forever).unwrap();
		assert_eq!(a.read_write_lock_count(), 1);
		let err = b.lock(LockKind::ReadWrite, Timeout::ms(50)).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::Timeout);
		drop(guard);
		assert_eq!(a.read_write_lock_count(), 0);
		let guard = b.lock(LockKind::ReadWrite, Timeout::ms(50)).unwrap();
		drop(guard);
	}
}
