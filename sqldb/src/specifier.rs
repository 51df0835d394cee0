// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Back-end URI parsing and the zeroing password container.

use std::fmt;

use zeroize::Zeroize;

/// The back-end family a specifier selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
	/// Embedded single-file engine.
	Sqlite,
	/// MySQL-lineage server.
	MariaDb,
	/// PostgreSQL-lineage server.
	PostgreSql,
}

/// A password that wipes its memory on drop.
#[derive(Clone, Default)]
pub struct Secret {
	inner: String,
}

impl Secret {
	/// Wrap a password.
	pub fn new(password: impl Into<String>) -> Self {
		Self { inner: password.into() }
	}

	/// Borrow the password for the driver handshake.
	pub fn reveal(&self) -> &str {
		&self.inner
	}

	/// Whether a password was supplied at all.
	pub fn is_empty(&self) -> bool {
		self.inner.is_empty()
	}
}

impl Drop for Secret {
	fn drop(&mut self) {
		self.inner.zeroize()
	}
}

impl fmt::Debug for Secret {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("Secret(..)")
	}
}

impl fmt::Display for Secret {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("****")
	}
}

/// Connection coordinates of a server back-end.
#[derive(Debug, Clone)]
pub struct ServerSpec {
	/// Host name or address.
	pub host: String,
	/// Login user.
	pub user: String,
	/// Login password; excluded from equality.
	pub password: Secret,
	/// Database name; filled from the caller's default when the URI
	/// omits it.
	pub database: String,
}

/// Parsed description of where and how to connect.
///
/// Equality ignores the password so the registry can deduplicate
/// connections to the same database regardless of the credentials a
/// particular caller supplied.
#[derive(Debug, Clone)]
pub enum Specifier {
	/// Embedded engine; empty path selects an in-memory database.
	Sqlite {
		/// Filesystem path of the database file.
		path: String,
	},
	/// MySQL-lineage server.
	MariaDb(ServerSpec),
	/// PostgreSQL-lineage server.
	PostgreSql(ServerSpec),
}

impl Specifier {
	/// Parse a URI of the shape `scheme:field1:field2:field3:field4`.
	///
	/// `sqlite:`/`sqlite3:` take a filesystem path, the server schemes
	/// take `host:user[:password[:database]]`. An unrecognised prefix
	/// selects the embedded engine with the full URI as the path.
	/// `default_database` fills the database field when the URI omits it.
	pub fn parse(uri: &str, default_database: Option<&str>) -> Self {
		if let Some(path) = uri.strip_prefix("sqlite3:") {
			return Specifier::Sqlite { path: path.to_owned() };
		}
		if let Some(path) = uri.strip_prefix("sqlite:") {
			return Specifier::Sqlite { path: path.to_owned() };
		}
		if let Some(rest) = uri.strip_prefix("mariadb:") {
			return Specifier::MariaDb(parse_server(rest, default_database));
		}
		if let Some(rest) = uri.strip_prefix("postgresql:") {
			// The server folds identifiers to lower case.
			let mut spec = parse_server(rest, default_database);
			spec.database = spec.database.to_lowercase();
			return Specifier::PostgreSql(spec);
		}
		Specifier::Sqlite { path: uri.to_owned() }
	}

	/// The back-end family this specifier selects.
	pub fn backend(&self) -> Backend {
		match self {
			Specifier::Sqlite { .. } => Backend::Sqlite,
			Specifier::MariaDb(_) => Backend::MariaDb,
			Specifier::PostgreSql(_) => Backend::PostgreSql,
		}
	}

	/// Equality up to the password, optionally overriding the database
	/// name of `self` with `database` before comparing. This is the
	/// identity the registry deduplicates on.
	pub fn matches(&self, other: &Specifier, database: Option<&str>) -> bool {
		match (self, other) {
			(Specifier::Sqlite { path: a }, Specifier::Sqlite { path: b }) => a == b,
			(Specifier::MariaDb(a), Specifier::MariaDb(b)) => server_matches(a, b, database),
			(Specifier::PostgreSql(a), Specifier::PostgreSql(b)) => server_matches(a, b, database),
			_ => false,
		}
	}

	/// The database name, where the back-end has one.
	pub fn database(&self) -> Option<&str> {
		match self {
			Specifier::Sqlite { .. } => None,
			Specifier::MariaDb(s) | Specifier::PostgreSql(s) => Some(&s.database),
		}
	}
}

impl PartialEq for Specifier {
	fn eq(&self, other: &Self) -> bool {
		self.matches(other, None)
	}
}

impl Eq for Specifier {}

impl fmt::Display for Specifier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Specifier::Sqlite { path } if path.is_empty() => write!(f, "sqlite::memory:"),
			Specifier::Sqlite { path } => write!(f, "sqlite:{}", path),
			Specifier::MariaDb(s) => write!(f, "mariadb:{}:{}:****:{}", s.host, s.user, s.database),
			Specifier::PostgreSql(s) => {
				write!(f, "postgresql:{}:{}:****:{}", s.host, s.user, s.database)
			},
		}
	}
}

fn parse_server(rest: &str, default_database: Option<&str>) -> ServerSpec {
	let mut fields = rest.splitn(4, ':');
	let host = fields.next().unwrap_or("").to_owned();
	let user = fields.next().unwrap_or("").to_owned();
	let password = Secret::new(fields.next().unwrap_or(""));
	let database = fields
		.next()
		.filter(|db| !db.is_empty())
		.map(str::to_owned)
		.or_else(|| default_database.map(str::to_owned))
		.unwrap_or_default();
	ServerSpec { host, user, password, database }
}

fn server_matches(a: &ServerSpec, b: &ServerSpec, database: Option<&str>) -> bool {
	let db_a = database.unwrap_or(&a.database);
	a.host == b.host && a.user == b.user && db_a == b.database
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_sqlite_paths() {
		assert_eq!(
			Specifier::parse("sqlite:/var/lib/data.db", None),
			Specifier::Sqlite { path: "/var/lib/data.db".into() }
		);
		assert_eq!(Specifier::parse("sqlite3:", None), Specifier::Sqlite { path: String::new() });
	}

	#[test]
	fn unknown_prefix_falls_back_to_sqlite() {
		assert_eq!(
			Specifier::parse("/plain/path.db", None),
			Specifier::Sqlite { path: "/plain/path.db".into() }
		);
	}

	#[test]
	fn parses_server_fields_with_default_database() {
		let spec = Specifier::parse("mariadb:db.local:backup", Some("archive"));
		match &spec {
			Specifier::MariaDb(s) => {
				assert_eq!(s.host, "db.local");
				assert_eq!(s.user, "backup");
				assert!(s.password.is_empty());
				assert_eq!(s.database, "archive");
			},
			other => panic!("unexpected specifier {:?}", other),
		}
	}

	#[test]
	fn postgresql_database_is_lowercased() {
		let spec = Specifier::parse("postgresql:host:user:pw:Archive", None);
		assert_eq!(spec.database(), Some("archive"));
	}

	#[test]
	fn equality_ignores_password() {
		let a = Specifier::parse("mariadb:h:u:secret1:db", None);
		let b = Specifier::parse("mariadb:h:u:secret2:db", None);
		assert_eq!(a, b);
		assert!(a.matches(&b, None));
	}

	#[test]
	fn database_override_applies_to_matching() {
		let a = Specifier::parse("postgresql:h:u:pw:one", None);
		let b = Specifier::parse("postgresql:h:u:pw:two", None);
		assert_ne!(a, b);
		assert!(a.matches(&b, Some("two")));
	}

	#[test]
	fn display_redacts_password() {
		let spec = Specifier::parse("mariadb:h:u:topsecret:db", None);
		assert!(!spec.to_string().contains("topsecret"));
	}
}
