//! `tokio_postgres::Row` → [`RawRow`], typed by each column's PostgreSQL type.

use postgres_types::{FromSqlOwned, Type};
use sea_query::{Nullable, Value};
use tokio_postgres::Row;

use crate::connection::RawRow;
use crate::error::OrmError;

fn column<T>(row: &Row, index: usize) -> Result<Value, OrmError>
where
    T: FromSqlOwned + Into<Value> + Nullable,
{
    row.try_get::<_, Option<T>>(index)
        .map(Value::from)
        .map_err(|e| {
            OrmError::HydrationError(format!(
                "column '{}': {}",
                row.columns()[index].name(),
                e
            ))
        })
}

fn decode(row: &Row, index: usize, ty: &Type) -> Result<Value, OrmError> {
    match *ty {
        Type::BOOL => column::<bool>(row, index),
        Type::INT2 => column::<i16>(row, index),
        Type::INT4 => column::<i32>(row, index),
        Type::INT8 => column::<i64>(row, index),
        Type::FLOAT4 => column::<f32>(row, index),
        Type::FLOAT8 => column::<f64>(row, index),
        Type::NUMERIC => column::<rust_decimal::Decimal>(row, index),
        Type::BYTEA => column::<Vec<u8>>(row, index),
        Type::JSON | Type::JSONB => column::<serde_json::Value>(row, index),
        Type::UUID => column::<uuid::Uuid>(row, index),
        Type::DATE => column::<chrono::NaiveDate>(row, index),
        Type::TIMESTAMP => column::<chrono::NaiveDateTime>(row, index),
        Type::TIMESTAMPTZ => column::<chrono::DateTime<chrono::Utc>>(row, index),
        _ => column::<String>(row, index),
    }
}

/// Decode every column of `row`.
pub(crate) fn raw_row(row: &Row) -> Result<RawRow, OrmError> {
    let columns = row.columns();
    let mut labels = Vec::with_capacity(columns.len());
    let mut values = Vec::with_capacity(columns.len());
    for (index, col) in columns.iter().enumerate() {
        labels.push(col.name().to_string());
        values.push(decode(row, index, col.type_())?);
    }
    Ok(RawRow::new(labels, values))
}
