//! Raw rows → records and value rows, driven by a [`ColumnPlan`].

use std::sync::Arc;

use sea_query::Value;

use crate::connection::RawRow;
use crate::entity::EntityDescriptor;
use crate::error::OrmError;
use crate::model::{Record, RecordState, Related};
use crate::query::compiler::ColumnPlan;
use crate::value::{coerce, is_null};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

fn column<'r>(row: &'r RawRow, position: usize) -> Result<&'r Value, OrmError> {
    row.get(position).ok_or_else(|| {
        OrmError::HydrationError(format!(
            "row has {} columns, expected one at position {}",
            row.len(),
            position
        ))
    })
}

fn field_value(
    entity: &EntityDescriptor,
    field_index: usize,
    raw: &Value,
) -> Result<Value, OrmError> {
    let field = &entity.fields()[field_index];
    coerce(field, raw.clone()).map_err(|e| {
        OrmError::HydrationError(format!("{}.{}: {}", entity.name(), field.name, e))
    })
}

fn branch_is_null(plan: &ColumnPlan, row: &RawRow) -> Result<bool, OrmError> {
    for col in &plan.fields {
        if !is_null(column(row, col.position)?) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn record_from_row(plan: &ColumnPlan, row: &RawRow, alias: &str) -> Result<Record, OrmError> {
    let entity: &Arc<EntityDescriptor> = &plan.entity;
    let mut values = vec![None; entity.fields().len()];
    for col in &plan.fields {
        values[col.field_index] = Some(field_value(entity, col.field_index, column(row, col.position)?)?);
    }
    let mut record = Record::from_parts(
        entity.clone(),
        values,
        RecordState::Persisted {
            alias: alias.to_string(),
        },
    );
    for related in &plan.related {
        let value = if branch_is_null(&related.plan, row)? {
            Related::Absent
        } else {
            Related::One(Box::new(record_from_row(&related.plan, row, alias)?))
        };
        record.set_related(related.relation.clone(), value);
    }
    for (name, position) in &plan.annotations {
        record.set_annotation(name.clone(), column(row, *position)?.clone());
    }
    Ok(record)
}

/// Build one record per row. A select_related branch whose columns are all
/// NULL becomes [`Related::Absent`].
pub fn records_from_rows(
    plan: &ColumnPlan,
    rows: &[RawRow],
    alias: &str,
) -> Result<Vec<Record>, OrmError> {
    let records = rows
        .iter()
        .map(|row| record_from_row(plan, row, alias))
        .collect::<Result<Vec<_>, _>>()?;
    #[cfg(feature = "metrics")]
    METRICS.record_rows_hydrated(records.len());
    Ok(records)
}

/// One row of a `values()` / `values_list()` fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum ValuesRow {
    /// `values()`: name → value, in SELECT order.
    Map(Vec<(String, Value)>),
    /// `values_list()`.
    Tuple(Vec<Value>),
    /// `values_list(flat=true)` over one field.
    Flat(Value),
    /// `values_list(named=true)`.
    Named(Vec<(String, Value)>),
}

impl ValuesRow {
    /// Value by name for `Map` / `Named` rows.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            ValuesRow::Map(pairs) | ValuesRow::Named(pairs) => {
                pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ValuesRow::Map(pairs) | ValuesRow::Named(pairs) => serde_json::Value::Object(
                pairs
                    .iter()
                    .map(|(n, v)| (n.clone(), crate::value::to_json(v)))
                    .collect(),
            ),
            ValuesRow::Tuple(values) => {
                serde_json::Value::Array(values.iter().map(crate::value::to_json).collect())
            }
            ValuesRow::Flat(value) => crate::value::to_json(value),
        }
    }
}

/// Shape of a values row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValuesShape {
    Map,
    Tuple,
    Flat,
    Named,
}

/// Convert rows of a values projection; labels come from the compiled query.
pub fn values_from_rows(
    rows: &[RawRow],
    labels: &[String],
    shape: ValuesShape,
) -> Result<Vec<ValuesRow>, OrmError> {
    rows.iter()
        .map(|row| {
            if row.len() != labels.len() {
                return Err(OrmError::HydrationError(format!(
                    "row has {} columns, expected {}",
                    row.len(),
                    labels.len()
                )));
            }
            let named = || {
                labels
                    .iter()
                    .cloned()
                    .zip(row.values.iter().cloned())
                    .collect::<Vec<_>>()
            };
            Ok(match shape {
                ValuesShape::Map => ValuesRow::Map(named()),
                ValuesShape::Named => ValuesRow::Named(named()),
                ValuesShape::Tuple => ValuesRow::Tuple(row.values.clone()),
                ValuesShape::Flat => ValuesRow::Flat(column(row, 0)?.clone()),
            })
        })
        .collect()
}
