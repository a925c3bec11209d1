//! INSERT / UPDATE / DELETE statement builders.

use std::sync::Arc;

use sea_query::{Alias, Expr, PostgresQueryBuilder, Query, Value};

use crate::entity::{EntityDescriptor, Registry};
use crate::error::OrmError;
use crate::query::compiler::{ColumnPlan, CompiledQuery, PlannedColumn, SqlCompiler};
use crate::query::dialect::quote_ident;
use crate::query::spec::QuerySpec;

/// A statement that reports an affected-row count.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Conflict handling for bulk inserts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OnConflict {
    /// Conflicts fail the batch.
    #[default]
    Error,
    /// `ON CONFLICT DO NOTHING`.
    Ignore,
    /// `ON CONFLICT (unique_fields) DO UPDATE SET f = EXCLUDED.f`.
    Update {
        unique_fields: Vec<String>,
        update_fields: Vec<String>,
    },
}

fn returning_clause(entity: &EntityDescriptor, indices: &[usize]) -> String {
    let cols: Vec<String> = indices
        .iter()
        .map(|&i| quote_ident(&entity.fields()[i].column))
        .collect();
    format!(" RETURNING {}", cols.join(", "))
}

fn full_plan(entity: &Arc<EntityDescriptor>, indices: &[usize]) -> (ColumnPlan, Vec<String>) {
    let plan = ColumnPlan {
        entity: entity.clone(),
        fields: indices
            .iter()
            .enumerate()
            .map(|(position, &field_index)| PlannedColumn {
                field_index,
                position,
            })
            .collect(),
        related: Vec::new(),
        annotations: Vec::new(),
    };
    let labels = indices
        .iter()
        .map(|&i| entity.fields()[i].name.clone())
        .collect();
    (plan, labels)
}

/// `INSERT ... RETURNING <every column>`; no columns → `DEFAULT VALUES`.
pub fn compile_insert(
    entity: &Arc<EntityDescriptor>,
    values: &[(usize, Value)],
) -> Result<CompiledQuery, OrmError> {
    let all: Vec<usize> = (0..entity.fields().len()).collect();
    let returning = returning_clause(entity, &all);
    let (sql, params) = if values.is_empty() {
        (
            format!(
                "INSERT INTO {} DEFAULT VALUES{}",
                quote_ident(entity.table_name()),
                returning
            ),
            Vec::new(),
        )
    } else {
        let mut insert = Query::insert();
        insert
            .into_table(Alias::new(entity.table_name()))
            .columns(
                values
                    .iter()
                    .map(|(i, _)| Alias::new(entity.fields()[*i].column.as_str())),
            )
            .values(values.iter().map(|(_, v)| Expr::val(v.clone())))?;
        let (sql, params) = insert.build(PostgresQueryBuilder);
        (
            format!("{}{}", sql, returning),
            params.iter().cloned().collect(),
        )
    };
    let (plan, labels) = full_plan(entity, &all);
    Ok(CompiledQuery {
        sql,
        params,
        plan,
        labels,
    })
}

/// Multi-row INSERT for one batch, returning primary keys.
pub fn compile_bulk_insert(
    entity: &Arc<EntityDescriptor>,
    columns: &[usize],
    rows: &[Vec<Value>],
    on_conflict: &OnConflict,
) -> Result<CompiledQuery, OrmError> {
    if rows.is_empty() {
        return Err(OrmError::invalid("bulk insert of an empty batch"));
    }
    let pk = entity.pk_index();
    let sql_body = if columns.is_empty() {
        // Every column defaulted: one VALUES (DEFAULT) row per record.
        let rows_sql = vec!["(DEFAULT)"; rows.len()].join(", ");
        (
            format!(
                "INSERT INTO {} ({}) VALUES {}",
                quote_ident(entity.table_name()),
                quote_ident(&entity.primary_key().column),
                rows_sql
            ),
            Vec::new(),
        )
    } else {
        let mut insert = Query::insert();
        insert.into_table(Alias::new(entity.table_name())).columns(
            columns
                .iter()
                .map(|&i| Alias::new(entity.fields()[i].column.as_str())),
        );
        for row in rows {
            if row.len() != columns.len() {
                return Err(OrmError::invalid(format!(
                    "bulk insert row has {} values for {} columns",
                    row.len(),
                    columns.len()
                )));
            }
            insert.values(row.iter().map(|v| Expr::val(v.clone())))?;
        }
        let (sql, params) = insert.build(PostgresQueryBuilder);
        (sql, params.iter().cloned().collect())
    };
    let (mut sql, params) = sql_body;
    match on_conflict {
        OnConflict::Error => {}
        OnConflict::Ignore => sql.push_str(" ON CONFLICT DO NOTHING"),
        OnConflict::Update {
            unique_fields,
            update_fields,
        } => {
            if unique_fields.is_empty() || update_fields.is_empty() {
                return Err(OrmError::invalid(
                    "update_conflicts requires unique_fields and update_fields",
                ));
            }
            let target = unique_fields
                .iter()
                .map(|f| entity.require_field(f).map(|i| quote_ident(&entity.fields()[i].column)))
                .collect::<Result<Vec<_>, _>>()?;
            let sets = update_fields
                .iter()
                .map(|f| {
                    entity.require_field(f).map(|i| {
                        let col = quote_ident(&entity.fields()[i].column);
                        format!("{} = EXCLUDED.{}", col, col)
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                target.join(", "),
                sets.join(", ")
            ));
        }
    }
    sql.push_str(&returning_clause(entity, &[pk]));
    let (plan, labels) = full_plan(entity, &[pk]);
    Ok(CompiledQuery {
        sql,
        params,
        plan,
        labels,
    })
}

/// `UPDATE <table> SET ... WHERE <spec filter>`.
pub fn compile_update(
    registry: &Registry,
    spec: &QuerySpec,
    assignments: &[(usize, Value)],
) -> Result<CompiledStatement, OrmError> {
    if assignments.is_empty() {
        return Err(OrmError::invalid("update() needs at least one field"));
    }
    if spec.is_sliced() {
        return Err(OrmError::invalid("cannot update a query once a slice has been taken"));
    }
    let entity = spec.entity();
    let condition = SqlCompiler::new(registry, spec).mutation_condition()?;
    let mut update = Query::update();
    update.table(Alias::new(entity.table_name())).values(
        assignments
            .iter()
            .map(|(i, v)| (Alias::new(entity.fields()[*i].column.as_str()), Expr::val(v.clone()))),
    );
    if let Some(cond) = condition {
        update.cond_where(cond);
    }
    let (sql, params) = update.build(PostgresQueryBuilder);
    Ok(CompiledStatement {
        sql,
        params: params.iter().cloned().collect(),
    })
}

/// `DELETE FROM <table> WHERE <spec filter>`.
pub fn compile_delete(registry: &Registry, spec: &QuerySpec) -> Result<CompiledStatement, OrmError> {
    if spec.is_sliced() {
        return Err(OrmError::invalid("cannot delete a query once a slice has been taken"));
    }
    let entity = spec.entity();
    let condition = SqlCompiler::new(registry, spec).mutation_condition()?;
    let mut delete = Query::delete();
    delete.from_table(Alias::new(entity.table_name()));
    if let Some(cond) = condition {
        delete.cond_where(cond);
    }
    let (sql, params) = delete.build(PostgresQueryBuilder);
    Ok(CompiledStatement {
        sql,
        params: params.iter().cloned().collect(),
    })
}
