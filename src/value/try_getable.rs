//! TryGetable trait for safe value extraction from record fields.
//!
//! Integers widen across variants (a `SMALLINT` column reads fine as `i64`),
//! everything else must match the stored variant exactly.

use sea_query::Value;

/// Why a record field could not be read as the requested Rust type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueExtractionError {
    /// SQL NULL where a value was required.
    NullValue,
    TypeMismatch { expected: String, actual: String },
    /// Right variant, but out of range or unparsable.
    ConversionError(String),
}

impl std::fmt::Display for ValueExtractionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueExtractionError::NullValue => write!(f, "Value is null"),
            ValueExtractionError::TypeMismatch { expected, actual } => {
                write!(f, "Type mismatch: expected {}, got {}", expected, actual)
            }
            ValueExtractionError::ConversionError(msg) => {
                write!(f, "Conversion error: {}", msg)
            }
        }
    }
}

impl std::error::Error for ValueExtractionError {}

/// Extract a Rust value out of a `sea_query::Value`.
///
/// ```rust
/// use undertow::{TryGetable, Value, ValueExtractionError};
///
/// let value = Value::Int(Some(42));
/// let result: Result<i64, ValueExtractionError> = TryGetable::try_get(value);
/// assert_eq!(result, Ok(42));
///
/// let result: Result<Option<i32>, ValueExtractionError> = TryGetable::try_get(Value::Int(None));
/// assert_eq!(result, Ok(None));
/// ```
pub trait TryGetable: Sized {
    /// Returns `NullValue` for SQL NULL and `TypeMismatch` when the variant is incompatible.
    fn try_get(value: Value) -> Result<Self, ValueExtractionError>;
}

/// Read any integer variant as `i64`.
pub(crate) fn integer_of(value: &Value) -> Option<Option<i64>> {
    match value {
        Value::TinyInt(v) => Some(v.map(i64::from)),
        Value::SmallInt(v) => Some(v.map(i64::from)),
        Value::Int(v) => Some(v.map(i64::from)),
        Value::BigInt(v) => Some(*v),
        Value::TinyUnsigned(v) => Some(v.map(i64::from)),
        Value::SmallUnsigned(v) => Some(v.map(i64::from)),
        Value::Unsigned(v) => Some(v.map(i64::from)),
        Value::BigUnsigned(v) => match v {
            Some(u) => Some(i64::try_from(*u).ok()),
            None => Some(None),
        },
        _ => None,
    }
}

fn mismatch(expected: &str, value: &Value) -> ValueExtractionError {
    ValueExtractionError::TypeMismatch {
        expected: expected.to_string(),
        actual: format!("{:?}", value),
    }
}

macro_rules! impl_try_getable_int {
    ($type:ty, $expected:expr) => {
        impl TryGetable for $type {
            fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
                match integer_of(&value) {
                    Some(Some(v)) => <$type>::try_from(v).map_err(|_| {
                        ValueExtractionError::ConversionError(format!(
                            "{} does not fit in {}",
                            v, $expected
                        ))
                    }),
                    Some(None) => Err(ValueExtractionError::NullValue),
                    None => Err(mismatch($expected, &value)),
                }
            }
        }
    };
}

impl_try_getable_int!(i16, "i16");
impl_try_getable_int!(i32, "i32");
impl_try_getable_int!(i64, "i64");
impl_try_getable_int!(u32, "u32");
impl_try_getable_int!(u64, "u64");

macro_rules! impl_try_getable {
    ($type:ty, $variant:ident, $expected:expr) => {
        impl TryGetable for $type {
            fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
                match value {
                    Value::$variant(Some(v)) => Ok(v),
                    Value::$variant(None) => Err(ValueExtractionError::NullValue),
                    _ => Err(mismatch($expected, &value)),
                }
            }
        }
    };
}

impl_try_getable!(bool, Bool, "Bool");
impl_try_getable!(String, String, "String");
impl_try_getable!(Vec<u8>, Bytes, "Bytes");

impl TryGetable for f64 {
    fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::Double(Some(v)) => Ok(v),
            Value::Float(Some(v)) => Ok(f64::from(v)),
            Value::Double(None) | Value::Float(None) => Err(ValueExtractionError::NullValue),
            _ => Err(mismatch("Double", &value)),
        }
    }
}

impl TryGetable for serde_json::Value {
    fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
        match value {
            Value::Json(Some(v)) => Ok(*v),
            Value::Json(None) => Err(ValueExtractionError::NullValue),
            _ => Err(mismatch("Json", &value)),
        }
    }
}

// Variants whose payload boxing differs between sea-query releases go through
// sea-query's own `ValueType` extraction.
macro_rules! impl_try_getable_via_sea {
    ($type:ty, $variant:ident, $expected:expr) => {
        impl TryGetable for $type {
            fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
                if !matches!(value, Value::$variant(_)) {
                    return Err(mismatch($expected, &value));
                }
                match <Option<$type> as sea_query::ValueType>::try_from(value) {
                    Ok(Some(v)) => Ok(v),
                    Ok(None) => Err(ValueExtractionError::NullValue),
                    Err(_) => Err(ValueExtractionError::ConversionError(format!(
                        "could not read {}",
                        $expected
                    ))),
                }
            }
        }
    };
}

impl_try_getable_via_sea!(uuid::Uuid, Uuid, "Uuid");
impl_try_getable_via_sea!(rust_decimal::Decimal, Decimal, "Decimal");
impl_try_getable_via_sea!(chrono::NaiveDate, ChronoDate, "ChronoDate");
impl_try_getable_via_sea!(chrono::NaiveDateTime, ChronoDateTime, "ChronoDateTime");
impl_try_getable_via_sea!(
    chrono::DateTime<chrono::Utc>,
    ChronoDateTimeUtc,
    "ChronoDateTimeUtc"
);

impl<T: TryGetable> TryGetable for Option<T> {
    fn try_get(value: Value) -> Result<Self, ValueExtractionError> {
        match T::try_get(value) {
            Ok(v) => Ok(Some(v)),
            Err(ValueExtractionError::NullValue) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
