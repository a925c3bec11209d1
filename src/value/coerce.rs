//! Conform caller-supplied values to a field's declared type.
//!
//! PostgreSQL is strict about parameter types, so `Int` literals bound against
//! a `BIGINT` column are widened here, strings are parsed into UUIDs, and so on.

use sea_query::Value;

use crate::entity::{FieldDescriptor, FieldType};
use crate::error::OrmError;
use crate::value::try_getable::integer_of;
use crate::value::{is_null, TryGetable};

/// A NULL of the variant matching `field_type`.
pub fn null_of(field_type: FieldType) -> Value {
    match field_type {
        FieldType::Bool => Value::Bool(None),
        FieldType::SmallInt => Value::SmallInt(None),
        FieldType::Int => Value::Int(None),
        FieldType::BigInt => Value::BigInt(None),
        FieldType::Float => Value::Float(None),
        FieldType::Double => Value::Double(None),
        FieldType::Text => Value::String(None),
        FieldType::Bytes => Value::Bytes(None),
        FieldType::Json => Value::Json(None),
        FieldType::Date => Value::ChronoDate(None),
        FieldType::Timestamp => Value::ChronoDateTime(None),
        FieldType::TimestampTz => Value::ChronoDateTimeUtc(None),
        FieldType::Uuid => Value::Uuid(None),
        FieldType::Decimal => Value::Decimal(None),
    }
}

fn mismatch(field: &FieldDescriptor, value: &Value) -> OrmError {
    OrmError::invalid(format!(
        "field '{}' expected a {:?} value, got {:?}",
        field.name, field.field_type, value
    ))
}

fn out_of_range(field: &FieldDescriptor, v: i64) -> OrmError {
    OrmError::invalid(format!(
        "value {} out of range for field '{}' ({:?})",
        v, field.name, field.field_type
    ))
}

/// Convert `value` into the variant `field` stores.
///
/// # Errors
///
/// `InvalidQueryError` when the value cannot represent the field's type.
pub fn coerce(field: &FieldDescriptor, value: Value) -> Result<Value, OrmError> {
    if is_null(&value) {
        return Ok(null_of(field.field_type));
    }
    let int = integer_of(&value).flatten();
    let coerced = match (field.field_type, value) {
        (FieldType::SmallInt, v) => match int {
            Some(i) => Value::SmallInt(Some(i16::try_from(i).map_err(|_| out_of_range(field, i))?)),
            None => return Err(mismatch(field, &v)),
        },
        (FieldType::Int, v) => match int {
            Some(i) => Value::Int(Some(i32::try_from(i).map_err(|_| out_of_range(field, i))?)),
            None => return Err(mismatch(field, &v)),
        },
        (FieldType::BigInt, v) => match int {
            Some(i) => Value::BigInt(Some(i)),
            None => return Err(mismatch(field, &v)),
        },
        (FieldType::Double, Value::Float(Some(f))) => Value::Double(Some(f64::from(f))),
        (FieldType::Double, v @ Value::Double(Some(_))) => v,
        (FieldType::Float, Value::Double(Some(d))) => Value::Float(Some(d as f32)),
        (FieldType::Float, v @ Value::Float(Some(_))) => v,
        (FieldType::Double, v) | (FieldType::Float, v) => match int {
            Some(i) if field.field_type == FieldType::Double => Value::Double(Some(i as f64)),
            Some(i) => Value::Float(Some(i as f32)),
            None => return Err(mismatch(field, &v)),
        },
        (FieldType::Bool, v @ Value::Bool(_)) => v,
        (FieldType::Text, v @ Value::String(_)) => v,
        (FieldType::Text, Value::Char(Some(c))) => Value::String(Some(c.to_string())),
        (FieldType::Bytes, v @ Value::Bytes(_)) => v,
        (FieldType::Json, v @ Value::Json(_)) => v,
        (FieldType::Json, v) => Value::Json(Some(Box::new(crate::value::to_json(&v)))),
        (FieldType::Uuid, v @ Value::Uuid(_)) => v,
        (FieldType::Uuid, Value::String(Some(s))) => uuid::Uuid::parse_str(&s)
            .map(Value::from)
            .map_err(|e| OrmError::invalid(format!("field '{}': {}", field.name, e)))?,
        (FieldType::Decimal, v @ Value::Decimal(_)) => v,
        (FieldType::Decimal, Value::String(Some(s))) => s
            .parse::<rust_decimal::Decimal>()
            .map(Value::from)
            .map_err(|e| OrmError::invalid(format!("field '{}': {}", field.name, e)))?,
        (FieldType::Decimal, v) => match int {
            Some(i) => Value::from(rust_decimal::Decimal::from(i)),
            None => return Err(mismatch(field, &v)),
        },
        (FieldType::Date, v @ Value::ChronoDate(_)) => v,
        (FieldType::Timestamp, v @ Value::ChronoDateTime(_)) => v,
        (FieldType::TimestampTz, v @ Value::ChronoDateTimeUtc(_)) => v,
        (FieldType::TimestampTz, v @ Value::ChronoDateTime(_)) => {
            let naive = chrono::NaiveDateTime::try_get(v)?;
            Value::from(naive.and_utc())
        }
        (_, v) => return Err(mismatch(field, &v)),
    };
    Ok(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_widens_to_bigint() {
        let field = FieldDescriptor::new("view_count", FieldType::BigInt);
        assert_eq!(coerce(&field, Value::Int(Some(3))).unwrap(), Value::BigInt(Some(3)));
    }

    #[test]
    fn test_narrowing_out_of_range() {
        let field = FieldDescriptor::new("rank", FieldType::SmallInt);
        assert!(coerce(&field, Value::BigInt(Some(1 << 20))).is_err());
    }

    #[test]
    fn test_null_takes_field_variant() {
        let field = FieldDescriptor::new("author_id", FieldType::BigInt).nullable();
        assert_eq!(coerce(&field, Value::String(None)).unwrap(), Value::BigInt(None));
    }

    #[test]
    fn test_text_rejects_integer() {
        let field = FieldDescriptor::new("title", FieldType::Text);
        assert!(matches!(
            coerce(&field, Value::Int(Some(1))),
            Err(OrmError::InvalidQueryError(_))
        ));
    }

    #[test]
    fn test_uuid_from_string() {
        let field = FieldDescriptor::new("token", FieldType::Uuid);
        let id = uuid::Uuid::new_v4();
        let value = coerce(&field, Value::String(Some(id.to_string()))).unwrap();
        assert_eq!(uuid::Uuid::try_get(value).unwrap(), id);
    }
}
