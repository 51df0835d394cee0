// Copyright 2025 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Tagged value, column and filter model shared by the builder, the
//! statement façade and the back-end adapters.

use crate::error::{Error, ErrorKind, Result};

/// Declared type of a column or bound parameter. Drives bind conversion
/// in the adapters and result coercion in the façade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
	/// No declared type; values pass through as the driver reports them.
	None,
	/// Engine-assigned row id. The table-copy engine never forwards these.
	PrimaryKey,
	/// Signed 64-bit row id referencing another table.
	Key,
	/// Boolean.
	Bool,
	/// Signed 32-bit integer.
	Int32,
	/// Signed 64-bit integer.
	Int64,
	/// Unsigned 32-bit integer.
	UInt32,
	/// Unsigned 64-bit integer.
	UInt64,
	/// Double-precision float.
	Double,
	/// Unsigned 32-bit enumeration discriminant.
	Enum,
	/// UNIX seconds, UTC.
	DateTime,
	/// Owned text.
	String,
	/// Borrowed static text.
	CString,
	/// Owned bytes.
	Blob,
	/// Array of row ids, spliced into the SQL as a literal list.
	KeyArray,
	/// Opaque full-text-search expression.
	FullTextSearch,
}

/// A single SQL value.
///
/// `Expression` is not a database value: it carries a sub-SQL fragment
/// that the builder splices verbatim in place of the placeholder, so no
/// bind is consumed for it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	/// SQL NULL.
	Null,
	/// Engine row id.
	Key(i64),
	/// Boolean.
	Bool(bool),
	/// Signed 32-bit integer.
	Int32(i32),
	/// Signed 64-bit integer.
	Int64(i64),
	/// Unsigned 32-bit integer.
	UInt32(u32),
	/// Unsigned 64-bit integer.
	UInt64(u64),
	/// Double-precision float.
	Double(f64),
	/// Enumeration discriminant.
	Enum(u32),
	/// UNIX seconds, UTC.
	DateTime(i64),
	/// Owned text.
	String(String),
	/// Borrowed static text.
	CString(&'static str),
	/// Owned bytes.
	Blob(Vec<u8>),
	/// Row-id list, joined to a decimal literal at build time.
	KeyArray(Vec<i64>),
	/// Opaque full-text-search expression.
	FullTextSearch(String),
	/// Sub-SQL expression spliced by the builder; never bound.
	Expression(String),
}

impl Value {
	/// The type tag this value naturally carries.
	pub fn value_type(&self) -> ValueType {
		match self {
			Value::Null => ValueType::None,
			Value::Key(_) => ValueType::Key,
			Value::Bool(_) => ValueType::Bool,
			Value::Int32(_) => ValueType::Int32,
			Value::Int64(_) => ValueType::Int64,
			Value::UInt32(_) => ValueType::UInt32,
			Value::UInt64(_) => ValueType::UInt64,
			Value::Double(_) => ValueType::Double,
			Value::Enum(_) => ValueType::Enum,
			Value::DateTime(_) => ValueType::DateTime,
			Value::String(_) => ValueType::String,
			Value::CString(_) => ValueType::CString,
			Value::Blob(_) => ValueType::Blob,
			Value::KeyArray(_) => ValueType::KeyArray,
			Value::FullTextSearch(_) => ValueType::FullTextSearch,
			Value::Expression(_) => ValueType::None,
		}
	}

	/// True for SQL NULL.
	pub fn is_null(&self) -> bool {
		matches!(self, Value::Null)
	}

	/// Integer view of the value, if it has one.
	pub fn as_i64(&self) -> Option<i64> {
		match *self {
			Value::Key(v) | Value::Int64(v) | Value::DateTime(v) => Some(v),
			Value::Int32(v) => Some(v as i64),
			Value::UInt32(v) => Some(v as i64),
			Value::UInt64(v) => i64::try_from(v).ok(),
			Value::Enum(v) => Some(v as i64),
			Value::Bool(v) => Some(v as i64),
			Value::Double(v) => Some(v as i64),
			Value::String(ref s) => s.trim().parse().ok(),
			Value::CString(s) => s.trim().parse().ok(),
			_ => None,
		}
	}

	/// Unsigned view of the value, if it has one.
	pub fn as_u64(&self) -> Option<u64> {
		match *self {
			Value::UInt64(v) => Some(v),
			Value::UInt32(v) | Value::Enum(v) => Some(v as u64),
			_ => self.as_i64().and_then(|v| u64::try_from(v).ok()),
		}
	}

	/// Float view of the value, if it has one.
	pub fn as_f64(&self) -> Option<f64> {
		match *self {
			Value::Double(v) => Some(v),
			Value::String(ref s) => s.trim().parse().ok(),
			Value::CString(s) => s.trim().parse().ok(),
			_ => self.as_i64().map(|v| v as f64),
		}
	}

	/// Boolean view. Integers map zero/non-zero; text accepts the
	/// spellings the back-ends emit.
	pub fn as_bool(&self) -> Option<bool> {
		match *self {
			Value::Bool(v) => Some(v),
			Value::String(ref s) => parse_bool(s),
			Value::CString(s) => parse_bool(s),
			_ => self.as_i64().map(|v| v != 0),
		}
	}

	/// Text view of the value, if it has one.
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::String(s) => Some(s),
			Value::CString(s) => Some(s),
			Value::FullTextSearch(s) => Some(s),
			_ => None,
		}
	}

	/// Byte view of the value, if it has one.
	pub fn as_blob(&self) -> Option<&[u8]> {
		match self {
			Value::Blob(b) => Some(b),
			Value::String(s) => Some(s.as_bytes()),
			Value::CString(s) => Some(s.as_bytes()),
			_ => None,
		}
	}

	/// Convert a raw driver value into the declared column type.
	///
	/// Drivers report what the wire gave them (integers, doubles, text);
	/// projections declare what the caller wants. The conversions here
	/// are exactly the declared coercions of the data model: Bool↔Int,
	/// DateTime↔Int64, numeric widenings, and text renderings.
	pub fn coerce(self, target: ValueType) -> Result<Value> {
		if self.is_null() {
			return Ok(Value::Null);
		}
		let fail = |value: &Value| {
			Err(Error::new(
				ErrorKind::TypeMismatch,
				format!("cannot represent {:?} as {:?}", value.value_type(), target),
			))
		};
		Ok(match target {
			ValueType::None => self,
			ValueType::PrimaryKey | ValueType::Key => match self.as_i64() {
				Some(v) => Value::Key(v),
				None => return fail(&self),
			},
			ValueType::Bool => match self.as_bool() {
				Some(v) => Value::Bool(v),
				None => return fail(&self),
			},
			ValueType::Int32 => match self.as_i64() {
				Some(v) => Value::Int32(v as i32),
				None => return fail(&self),
			},
			ValueType::Int64 => match self.as_i64() {
				Some(v) => Value::Int64(v),
				None => return fail(&self),
			},
			ValueType::UInt32 => match self.as_u64() {
				Some(v) => Value::UInt32(v as u32),
				None => return fail(&self),
			},
			ValueType::UInt64 => match self.as_u64() {
				Some(v) => Value::UInt64(v),
				None => return fail(&self),
			},
			ValueType::Double => match self.as_f64() {
				Some(v) => Value::Double(v),
				None => return fail(&self),
			},
			ValueType::Enum => match self.as_u64() {
				Some(v) => Value::Enum(v as u32),
				None => return fail(&self),
			},
			ValueType::DateTime => match self {
				// EXTRACT(EPOCH FROM ..) yields a double on PostgreSQL.
				Value::Double(v) => Value::DateTime(v.round() as i64),
				other => match other.as_i64() {
					Some(v) => Value::DateTime(v),
					None => return fail(&other),
				},
			},
			ValueType::String | ValueType::CString | ValueType::FullTextSearch => match self {
				Value::String(s) => Value::String(s),
				Value::CString(s) => Value::String(s.to_owned()),
				Value::FullTextSearch(s) => Value::String(s),
				Value::Blob(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
				other => Value::String(render_scalar(&other)),
			},
			ValueType::Blob => match self {
				Value::Blob(b) => Value::Blob(b),
				Value::String(s) => Value::Blob(s.into_bytes()),
				Value::CString(s) => Value::Blob(s.as_bytes().to_vec()),
				other => return fail(&other),
			},
			ValueType::KeyArray => match self {
				Value::KeyArray(v) => Value::KeyArray(v),
				other => return fail(&other),
			},
		})
	}
}

fn parse_bool(s: &str) -> Option<bool> {
	match s.trim() {
		"1" | "t" | "true" | "TRUE" | "y" | "yes" | "YES" | "on" => Some(true),
		"0" | "f" | "false" | "FALSE" | "n" | "no" | "NO" | "off" => Some(false),
		other => other.parse::<i64>().ok().map(|v| v != 0),
	}
}

fn render_scalar(value: &Value) -> String {
	match *value {
		Value::Bool(v) => (v as i64).to_string(),
		Value::Double(v) => v.to_string(),
		_ => value.as_i64().map(|v| v.to_string()).unwrap_or_default(),
	}
}

/// Projection or insert-shape description of a single column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
	/// Column name as it appears in the table.
	pub name: String,
	/// Optional alias used in the result set.
	pub alias: Option<String>,
	/// Declared type; drives bind conversion and result coercion.
	pub kind: ValueType,
}

impl Column {
	/// A column with no alias.
	pub fn new(name: impl Into<String>, kind: ValueType) -> Self {
		Self { name: name.into(), alias: None, kind }
	}

	/// A column selected under an alias.
	pub fn aliased(name: impl Into<String>, alias: impl Into<String>, kind: ValueType) -> Self {
		Self { name: name.into(), alias: Some(alias.into()), kind }
	}

	/// The name the column is addressed by in a result row.
	pub fn result_name(&self) -> &str {
		self.alias.as_deref().unwrap_or(&self.name)
	}
}

/// A typed value substituted positionally for a `?` placeholder in a
/// filter expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
	/// The value to bind.
	pub value: Value,
	/// The bind conversion to apply; usually the value's own type.
	pub kind: ValueType,
}

impl Filter {
	/// A filter with the value's natural type.
	pub fn new(value: Value) -> Self {
		let kind = value.value_type();
		Self { value, kind }
	}

	/// Row-id filter.
	pub fn key(id: i64) -> Self {
		Self::new(Value::Key(id))
	}

	/// Integer filter.
	pub fn int(v: i64) -> Self {
		Self::new(Value::Int64(v))
	}

	/// Unsigned filter.
	pub fn uint(v: u64) -> Self {
		Self::new(Value::UInt64(v))
	}

	/// Text filter.
	pub fn string(v: impl Into<String>) -> Self {
		Self::new(Value::String(v.into()))
	}

	/// UNIX-seconds filter.
	pub fn datetime(seconds: i64) -> Self {
		Self::new(Value::DateTime(seconds))
	}

	/// Row-id list, spliced as a literal at build time.
	pub fn keys(ids: Vec<i64>) -> Self {
		Self::new(Value::KeyArray(ids))
	}

	/// Sub-SQL expression spliced in place of the placeholder.
	pub fn expression(sql: impl Into<String>) -> Self {
		Self::new(Value::Expression(sql.into()))
	}
}

/// Column description returned by schema introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
	/// Column name.
	pub name: String,
	/// Mapped type.
	pub kind: ValueType,
	/// Whether the column is (part of) the primary key.
	pub primary_key: bool,
	/// Whether the column rejects NULL. Carried through table rebuilds.
	pub not_null: bool,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn integer_views_widen() {
		assert_eq!(Value::Int32(7).as_i64(), Some(7));
		assert_eq!(Value::UInt32(7).as_u64(), Some(7));
		assert_eq!(Value::Bool(true).as_i64(), Some(1));
	}

	#[test]
	fn datetime_coerces_from_integer_and_double() {
		let v = Value::Int64(1_700_000_000).coerce(ValueType::DateTime).unwrap();
		assert_eq!(v, Value::DateTime(1_700_000_000));
		let v = Value::Double(1_700_000_000.4).coerce(ValueType::DateTime).unwrap();
		assert_eq!(v, Value::DateTime(1_700_000_000));
	}

	#[test]
	fn bool_round_trips_through_integers() {
		let v = Value::Int64(1).coerce(ValueType::Bool).unwrap();
		assert_eq!(v, Value::Bool(true));
		assert_eq!(Value::String("NO".into()).as_bool(), Some(false));
	}

	#[test]
	fn blob_to_string_repairs_utf8() {
		let v = Value::Blob(vec![b'a', 0xff, b'b']).coerce(ValueType::String).unwrap();
		assert_eq!(v, Value::String("a\u{fffd}b".into()));
	}

	#[test]
	fn null_coerces_to_null() {
		assert_eq!(Value::Null.coerce(ValueType::Int64).unwrap(), Value::Null);
	}

	#[test]
	fn mismatch_is_reported() {
		let err = Value::Blob(vec![1]).coerce(ValueType::Key).unwrap_err();
		assert_eq!(err.kind(), crate::ErrorKind::TypeMismatch);
	}

	#[test]
	fn result_name_prefers_alias() {
		let col = Column::aliased("created", "createdUnix", ValueType::DateTime);
		assert_eq!(col.result_name(), "createdUnix");
		assert_eq!(Column::new("id", ValueType::Key).result_name(), "id");
	}
}
