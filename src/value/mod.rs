//! Value helpers layered on `sea_query::Value`.
//!
//! - **`TryGetable`** - typed extraction with error reporting
//! - **`ValueKey`** - hashable grouping key
//! - **`coerce`** - conform a caller value to a field's declared type

pub mod coerce;
pub mod key;
pub mod try_getable;

pub use coerce::{coerce, null_of};
pub use key::ValueKey;
pub use try_getable::{TryGetable, ValueExtractionError};

use sea_query::Value;

/// True when `value` is SQL NULL, whatever its variant.
pub fn is_null(value: &Value) -> bool {
    matches!(
        value,
        Value::Bool(None)
            | Value::TinyInt(None)
            | Value::SmallInt(None)
            | Value::Int(None)
            | Value::BigInt(None)
            | Value::TinyUnsigned(None)
            | Value::SmallUnsigned(None)
            | Value::Unsigned(None)
            | Value::BigUnsigned(None)
            | Value::Float(None)
            | Value::Double(None)
            | Value::String(None)
            | Value::Char(None)
            | Value::Bytes(None)
            | Value::Json(None)
            | Value::ChronoDate(None)
            | Value::ChronoTime(None)
            | Value::ChronoDateTime(None)
            | Value::ChronoDateTimeUtc(None)
            | Value::ChronoDateTimeLocal(None)
            | Value::ChronoDateTimeWithTimeZone(None)
            | Value::Uuid(None)
            | Value::Decimal(None)
    )
}

/// Render a value as JSON for `Record::to_json`.
pub fn to_json(value: &Value) -> serde_json::Value {
    use serde_json::json;

    if is_null(value) {
        return serde_json::Value::Null;
    }
    if let Some(Some(i)) = try_getable::integer_of(value) {
        return json!(i);
    }
    match value {
        Value::Bool(Some(b)) => json!(b),
        Value::Float(Some(f)) => json!(f),
        Value::Double(Some(d)) => json!(d),
        Value::String(Some(s)) => json!(s),
        Value::Char(Some(c)) => json!(c.to_string()),
        Value::Json(Some(j)) => (**j).clone(),
        Value::Uuid(_) => match uuid::Uuid::try_get(value.clone()) {
            Ok(u) => json!(u.to_string()),
            Err(_) => serde_json::Value::Null,
        },
        Value::Decimal(_) => match rust_decimal::Decimal::try_get(value.clone()) {
            Ok(d) => json!(d.to_string()),
            Err(_) => serde_json::Value::Null,
        },
        Value::ChronoDateTimeUtc(_) => match chrono::DateTime::<chrono::Utc>::try_get(value.clone()) {
            Ok(t) => json!(t.to_rfc3339()),
            Err(_) => serde_json::Value::Null,
        },
        Value::ChronoDateTime(_) => match chrono::NaiveDateTime::try_get(value.clone()) {
            Ok(t) => json!(t.to_string()),
            Err(_) => serde_json::Value::Null,
        },
        Value::ChronoDate(_) => match chrono::NaiveDate::try_get(value.clone()) {
            Ok(t) => json!(t.to_string()),
            Err(_) => serde_json::Value::Null,
        },
        other => json!(format!("{:?}", other)),
    }
}
