// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error type shared by the core and every back-end adapter.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Flat classification of everything that can go wrong in the data-access
/// layer. Adapters map their driver's native error codes onto these kinds;
/// the retry loop and the schema comparison dispatch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	/// The back-end reported a retryable busy/locked condition.
	Busy,
	/// A lock or retry budget was exhausted.
	Timeout,
	/// The server connection dropped mid-operation.
	ConnectionLost,
	/// Establishing a connection failed.
	Connect,
	/// The server rejected the credentials or the operation.
	Authorization,
	/// The password was refused.
	InvalidPassword,
	/// The server or protocol version is below the supported minimum.
	Version,
	/// The database file or catalog is not usable.
	Invalid,
	/// Generic database error carrying the driver's native code.
	Database,
	/// The statement was cancelled, either by `interrupt` or by a
	/// progress handler returning `false`.
	Interrupted,
	/// A parameter could not be bound.
	Bind,
	/// A row expected to exist was not found.
	EntryNotFound,
	/// Schema comparison: table present in the reference, absent in the target.
	MissingTable,
	/// Schema comparison: column present in the reference, absent in the target.
	MissingColumn,
	/// Schema comparison: table present in the target only.
	ObsoleteTable,
	/// Schema comparison: column present in the target only.
	ObsoleteColumn,
	/// Schema comparison: column exists on both sides with different types.
	TypeMismatch,
	/// The entity to be created already exists.
	Exists,
	/// The requested entity does not exist.
	NotFound,
	/// The operation is not supported by this back-end or no back-end
	/// is registered for the specifier.
	FunctionNotSupported,
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			ErrorKind::Busy => "database busy",
			ErrorKind::Timeout => "timeout",
			ErrorKind::ConnectionLost => "connection lost",
			ErrorKind::Connect => "connect failed",
			ErrorKind::Authorization => "authorization failed",
			ErrorKind::InvalidPassword => "invalid password",
			ErrorKind::Version => "unsupported version",
			ErrorKind::Invalid => "invalid database",
			ErrorKind::Database => "database error",
			ErrorKind::Interrupted => "interrupted",
			ErrorKind::Bind => "bind failed",
			ErrorKind::EntryNotFound => "entry not found",
			ErrorKind::MissingTable => "missing table",
			ErrorKind::MissingColumn => "missing column",
			ErrorKind::ObsoleteTable => "obsolete table",
			ErrorKind::ObsoleteColumn => "obsolete column",
			ErrorKind::TypeMismatch => "type mismatch",
			ErrorKind::Exists => "already exists",
			ErrorKind::NotFound => "not found",
			ErrorKind::FunctionNotSupported => "function not supported",
		};
		f.write_str(name)
	}
}

/// An error with its kind, a human-readable message and, for
/// database-originated errors, the driver's native code. In debug builds
/// the offending SQL fragment is attached when available.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", self.describe())]
pub struct Error {
	kind: ErrorKind,
	message: String,
	code: Option<i64>,
	sql: Option<String>,
}

impl Error {
	/// Create an error of `kind` with a message.
	pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
		Self { kind, message: message.into(), code: None, sql: None }
	}

	/// Attach the driver's native error code.
	pub fn with_code(mut self, code: i64) -> Self {
		self.code = Some(code);
		self
	}

	/// Attach the offending SQL fragment. Only retained in debug builds.
	pub fn with_sql(mut self, sql: &str) -> Self {
		if cfg!(debug_assertions) {
			self.sql = Some(sql.to_owned());
		}
		self
	}

	/// The error classification.
	pub fn kind(&self) -> ErrorKind {
		self.kind
	}

	/// The driver's native error code, if any.
	pub fn code(&self) -> Option<i64> {
		self.code
	}

	/// The human-readable message.
	pub fn message(&self) -> &str {
		&self.message
	}

	/// Whether the retry loop may recover from this error.
	pub fn is_busy(&self) -> bool {
		self.kind == ErrorKind::Busy
	}

	fn describe(&self) -> String {
		let mut out = format!("{}: {}", self.kind, self.message);
		if let Some(code) = self.code {
			out.push_str(&format!(" (code {})", code));
		}
		if let Some(ref sql) = self.sql {
			out.push_str(&format!(" [{}]", sql));
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn display_includes_code() {
		let err = Error::new(ErrorKind::Database, "boom").with_code(1205);
		assert_eq!(err.to_string(), "database error: boom (code 1205)");
	}

	#[test]
	fn kind_is_preserved() {
		let err = Error::new(ErrorKind::Busy, "locked");
		assert!(err.is_busy());
		assert_eq!(err.kind(), ErrorKind::Busy);
	}
}
