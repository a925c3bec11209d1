//! Hashable keys derived from `sea_query::Value`.
//!
//! Used wherever rows are grouped by a column value: prefetch grouping and `in_bulk`.

use sea_query::Value;

use crate::value::try_getable::integer_of;
use crate::value::TryGetable;

/// Canonical, hashable form of a value. All integer widths collapse to `Int`
/// so a `BigInt` primary key matches an `Int` foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKey {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Other(String),
}

impl ValueKey {
    pub fn from_value(value: &Value) -> ValueKey {
        if crate::value::is_null(value) {
            return ValueKey::Null;
        }
        if let Some(Some(i)) = integer_of(value) {
            return ValueKey::Int(i);
        }
        match value {
            Value::Bool(Some(b)) => ValueKey::Bool(*b),
            Value::String(Some(s)) => ValueKey::Text(s.clone()),
            Value::Char(Some(c)) => ValueKey::Text(c.to_string()),
            Value::Bytes(Some(b)) => ValueKey::Bytes(b.clone()),
            Value::Uuid(_) => match uuid::Uuid::try_get(value.clone()) {
                Ok(u) => ValueKey::Text(u.to_string()),
                Err(_) => ValueKey::Other(format!("{:?}", value)),
            },
            other => ValueKey::Other(format!("{:?}", other)),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ValueKey::Null)
    }
}

impl From<&Value> for ValueKey {
    fn from(value: &Value) -> Self {
        ValueKey::from_value(value)
    }
}

impl From<i64> for ValueKey {
    fn from(v: i64) -> Self {
        ValueKey::Int(v)
    }
}

impl From<i32> for ValueKey {
    fn from(v: i32) -> Self {
        ValueKey::Int(i64::from(v))
    }
}

impl From<&str> for ValueKey {
    fn from(v: &str) -> Self {
        ValueKey::Text(v.to_string())
    }
}
