// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Unified data-access layer over heterogeneous relational back-ends.
//!
//! One high-level API covers an embedded single-file engine and two
//! server families. Callers open a [`Handle`] against a parsed
//! [`Specifier`]; handles to the same database share a [`Node`] in the
//! process-wide registry, and the node's coordinator schedules shared
//! readers, one exclusive writer and at most one transaction across all
//! of them. SQL is assembled by the [`builder`], executed through the
//! [`Statement`] façade with busy retries, and whole tables stream
//! between connections via [`copy_table`].
//!
//! Back-end adapters live in their own crates (`sqldb-sqlite`,
//! `sqldb-mariadb`, `sqldb-postgres`); calling their `register()`
//! installs a [`Connector`] here. Opening a specifier whose back-end
//! has no connector registered fails with
//! [`ErrorKind::FunctionNotSupported`].

pub mod builder;
pub mod copy;
pub mod driver;
pub mod history;
pub mod ops;
pub mod registry;

mod error;
mod handle;
mod node;
mod options;
mod specifier;
mod statement;
mod transaction;
mod value;

pub use crate::copy::{copy_table, CopyCallbacks, CopyOptions, RowImage, PRIMARY_KEY_ANY};
pub use crate::driver::{
	Connection, Connector, Dialect, DriverHooks, ExecOutcome, Interrupter, NullInterrupter,
	QueryOptions, QueryRow, RowCallback, RowControl,
};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::handle::{Handle, LockGuard};
pub use crate::node::{BusyHandler, LockCounters, LockKind, Node, ProgressHandler};
pub use crate::ops::compare;
pub use crate::options::{
	CompareFlags, Flags, OpenMode, Timeout, TransactionType, UNLIMITED,
};
pub use crate::registry::{open, open_uri, register_connector};
pub use crate::specifier::{Backend, Secret, ServerSpec, Specifier};
pub use crate::statement::{Row, Statement};
pub use crate::transaction::Transaction;
pub use crate::value::{Column, ColumnInfo, Filter, Value, ValueType};
