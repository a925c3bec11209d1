//! Binding `sea_query::Value` parameters to PostgreSQL.
//!
//! The server infers each placeholder's type during prepare; values are
//! encoded against that type, so an `Int` bound to a BIGINT column or a
//! `BigUnsigned` LIMIT is widened or narrowed here rather than rejected.

use std::error::Error;

use bytes::BytesMut;
use postgres_types::{to_sql_checked, IsNull, ToSql, Type};
use sea_query::Value;

use crate::value::try_getable::integer_of;
use crate::value::{is_null, TryGetable};

type BoxError = Box<dyn Error + Sync + Send>;

/// A borrowed value encodable as any compatible PostgreSQL type.
#[derive(Debug)]
pub(crate) struct SqlParam<'a>(pub(crate) &'a Value);

fn encode_integer(i: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => i16::try_from(i)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(i)?.to_sql(ty, out),
        Type::INT8 => i.to_sql(ty, out),
        Type::FLOAT4 => (i as f32).to_sql(ty, out),
        Type::FLOAT8 => (i as f64).to_sql(ty, out),
        Type::NUMERIC => rust_decimal::Decimal::from(i).to_sql(ty, out),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR => i.to_string().to_sql(ty, out),
        _ => Err(format!("cannot bind integer {} as {}", i, ty).into()),
    }
}

fn encode_text(s: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::JSON | Type::JSONB => serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out),
        Type::UUID => uuid::Uuid::parse_str(s)?.to_sql(ty, out),
        _ => s.to_sql(ty, out),
    }
}

impl ToSql for SqlParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        let value = self.0;
        if is_null(value) {
            return Ok(IsNull::Yes);
        }
        match integer_of(value) {
            Some(Some(i)) => return encode_integer(i, ty, out),
            Some(None) => return Err(format!("integer {:?} exceeds the INT8 range", value).into()),
            None => {}
        }
        match value {
            Value::Bool(Some(b)) => b.to_sql(ty, out),
            Value::Float(Some(f)) if *ty == Type::FLOAT8 => f64::from(*f).to_sql(ty, out),
            Value::Float(Some(f)) => f.to_sql(ty, out),
            Value::Double(Some(d)) if *ty == Type::FLOAT4 => (*d as f32).to_sql(ty, out),
            Value::Double(Some(d)) => d.to_sql(ty, out),
            Value::String(Some(s)) => encode_text(s, ty, out),
            Value::Char(Some(c)) => encode_text(&c.to_string(), ty, out),
            Value::Bytes(Some(b)) => b.to_sql(ty, out),
            Value::Json(_) => serde_json::Value::try_get(value.clone())?.to_sql(ty, out),
            Value::Uuid(_) => uuid::Uuid::try_get(value.clone())?.to_sql(ty, out),
            Value::Decimal(_) => rust_decimal::Decimal::try_get(value.clone())?.to_sql(ty, out),
            Value::ChronoDate(_) => chrono::NaiveDate::try_get(value.clone())?.to_sql(ty, out),
            Value::ChronoDateTime(_) => chrono::NaiveDateTime::try_get(value.clone())?.to_sql(ty, out),
            Value::ChronoDateTimeUtc(_) => {
                chrono::DateTime::<chrono::Utc>::try_get(value.clone())?.to_sql(ty, out)
            }
            other => Err(format!("unsupported parameter {:?}", other).into()),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: Value, ty: Type) -> Result<(IsNull, Vec<u8>), BoxError> {
        let mut out = BytesMut::new();
        let is_null = SqlParam(&value).to_sql(&ty, &mut out)?;
        Ok((is_null, out.to_vec()))
    }

    #[test]
    fn test_int_widens_to_int8() {
        let (_, bytes) = encode(Value::Int(Some(7)), Type::INT8).unwrap();
        assert_eq!(bytes, 7i64.to_be_bytes().to_vec());
    }

    #[test]
    fn test_big_unsigned_limit_binds_as_int8() {
        let (_, bytes) = encode(Value::BigUnsigned(Some(3)), Type::INT8).unwrap();
        assert_eq!(bytes, 3i64.to_be_bytes().to_vec());
    }

    #[test]
    fn test_narrowing_out_of_range_fails() {
        assert!(encode(Value::BigInt(Some(1 << 40)), Type::INT4).is_err());
    }

    #[test]
    fn test_typed_null() {
        let (is_null, bytes) = encode(Value::String(None), Type::TEXT).unwrap();
        assert!(matches!(is_null, IsNull::Yes));
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_text_as_uuid() {
        let id = uuid::Uuid::new_v4();
        let (_, bytes) = encode(Value::from(id.to_string()), Type::UUID).unwrap();
        assert_eq!(bytes, id.as_bytes().to_vec());
    }
}
