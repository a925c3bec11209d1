//! prefetch_related: one extra query per relation path, batched by parent keys.
//!
//! Forward relations collect the parents' foreign keys and fetch the targets by
//! primary key. Reverse relations fetch children by their foreign key.
//! Many-to-many relations read the through table first, then the targets.

use std::collections::{BTreeMap, HashMap};

use futures::future::BoxFuture;
use sea_query::{Alias, Expr, ExprTrait, PostgresQueryBuilder, Query, Value};

#[cfg(feature = "tracing")]
use tracing::Instrument;

use crate::database::Database;
use crate::entity::{EntityDescriptor, RelationDescriptor, RelationKind};
use crate::error::OrmError;
use crate::executor::Executor;
use crate::hydrate::records_from_rows;
use crate::model::{Record, Related};
use crate::query::compiler::compile_select;
use crate::query::filter::Q;
use crate::query::resolve::relation_segments;
use crate::query::spec::{OrderTerm, QuerySpec};
use crate::value::{is_null, ValueKey};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Group `lookups` by their first relation; the rest of each path is prefetched
/// on the loaded children.
fn group_lookups(lookups: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for lookup in lookups {
        let segments = relation_segments(lookup);
        let Some((head, tail)) = segments.split_first() else {
            continue;
        };
        let entry = groups.entry(head.clone()).or_default();
        if !tail.is_empty() {
            let rest = tail.join("__");
            if !entry.contains(&rest) {
                entry.push(rest);
            }
        }
    }
    groups
}

fn field_for_column(entity: &EntityDescriptor, column: &str) -> Result<usize, OrmError> {
    entity.field_by_column(column).ok_or_else(|| {
        OrmError::invalid(format!(
            "'{}' has no field for column '{}'",
            entity.name(),
            column
        ))
    })
}

/// Distinct non-null keys in first-seen order.
fn distinct_keys<'r>(values: impl Iterator<Item = Option<&'r Value>>) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut keys = Vec::new();
    for value in values.flatten() {
        if is_null(value) {
            continue;
        }
        if seen.insert(ValueKey::from_value(value)) {
            keys.push(value.clone());
        }
    }
    keys
}

async fn fetch_in(
    db: &Database,
    executor: &Executor,
    entity: &std::sync::Arc<EntityDescriptor>,
    field_index: usize,
    keys: Vec<Value>,
) -> Result<Vec<Record>, OrmError> {
    let field = &entity.fields()[field_index];
    let pk = entity.primary_key().name.clone();
    let spec = QuerySpec::new(entity.clone())
        .with_filter(Q::is_in(&format!("{}__in", field.name), keys))
        .with_ordering(vec![OrderTerm {
            field: pk,
            descending: false,
        }]);
    let compiled = compile_select(db.registry(), &spec)?;
    let rows = executor.fetch_all(&compiled.sql, &compiled.params).await?;
    records_from_rows(&compiled.plan, &rows, executor.alias())
}

async fn load_forward(
    db: &Database,
    executor: &Executor,
    owner: &EntityDescriptor,
    relation: &RelationDescriptor,
    records: &mut [&mut Record],
) -> Result<(), OrmError> {
    let related = db.registry().get(&relation.related_entity)?.clone();
    let local = field_for_column(owner, &relation.local_column)?;
    let remote = field_for_column(&related, &relation.remote_column)?;
    let keys = distinct_keys(records.iter().map(|r| r.value_at(local)));
    let mut by_key: HashMap<ValueKey, Record> = HashMap::new();
    if !keys.is_empty() {
        for record in fetch_in(db, executor, &related, remote, keys).await? {
            if let Some(key) = record.value_at(remote).map(ValueKey::from_value) {
                by_key.insert(key, record);
            }
        }
    }
    for record in records.iter_mut() {
        let target = record
            .value_at(local)
            .filter(|v| !is_null(v))
            .and_then(|v| by_key.get(&ValueKey::from_value(v)));
        let value = match target {
            Some(target) => Related::One(Box::new(target.clone())),
            None => Related::Absent,
        };
        record.set_related(relation.name.clone(), value);
    }
    Ok(())
}

async fn load_reverse(
    db: &Database,
    executor: &Executor,
    owner: &EntityDescriptor,
    relation: &RelationDescriptor,
    records: &mut [&mut Record],
) -> Result<(), OrmError> {
    let related = db.registry().get(&relation.related_entity)?.clone();
    let local = field_for_column(owner, &relation.local_column)?;
    let remote = field_for_column(&related, &relation.remote_column)?;
    let keys = distinct_keys(records.iter().map(|r| r.value_at(local)));
    let mut groups: HashMap<ValueKey, Vec<Record>> = HashMap::new();
    if !keys.is_empty() {
        for child in fetch_in(db, executor, &related, remote, keys).await? {
            if let Some(key) = child.value_at(remote).map(ValueKey::from_value) {
                groups.entry(key).or_default().push(child);
            }
        }
    }
    for record in records.iter_mut() {
        let children = record
            .value_at(local)
            .and_then(|v| groups.get(&ValueKey::from_value(v)))
            .cloned()
            .unwrap_or_default();
        record.set_related(relation.name.clone(), Related::Many(children));
    }
    Ok(())
}

async fn load_many_to_many(
    db: &Database,
    executor: &Executor,
    owner: &EntityDescriptor,
    relation: &RelationDescriptor,
    records: &mut [&mut Record],
) -> Result<(), OrmError> {
    let through = relation.through.as_ref().ok_or_else(|| {
        OrmError::invalid(format!("relation '{}' has no through table", relation.name))
    })?;
    let related = db.registry().get(&relation.related_entity)?.clone();
    let local = field_for_column(owner, &relation.local_column)?;
    let remote = field_for_column(&related, &relation.remote_column)?;
    let keys = distinct_keys(records.iter().map(|r| r.value_at(local)));

    let mut links: HashMap<ValueKey, Vec<ValueKey>> = HashMap::new();
    let mut targets: HashMap<ValueKey, Record> = HashMap::new();
    if !keys.is_empty() {
        let mut select = Query::select();
        select
            .column(Alias::new(through.source_column.as_str()))
            .column(Alias::new(through.target_column.as_str()))
            .from(Alias::new(through.table.as_str()))
            .and_where(Expr::col(Alias::new(through.source_column.as_str())).is_in(keys));
        let (sql, values) = select.build(PostgresQueryBuilder);
        let params: Vec<Value> = values.iter().cloned().collect();
        let rows = executor.fetch_all(&sql, &params).await?;

        let mut target_keys = Vec::new();
        for row in &rows {
            let (Some(source), Some(target)) = (row.get(0), row.get(1)) else {
                return Err(OrmError::HydrationError(format!(
                    "through table '{}' returned a short row",
                    through.table
                )));
            };
            if is_null(target) {
                continue;
            }
            links
                .entry(ValueKey::from_value(source))
                .or_default()
                .push(ValueKey::from_value(target));
            target_keys.push(Some(target));
        }
        let target_keys = distinct_keys(target_keys.into_iter());
        if !target_keys.is_empty() {
            for record in fetch_in(db, executor, &related, remote, target_keys).await? {
                if let Some(key) = record.value_at(remote).map(ValueKey::from_value) {
                    targets.insert(key, record);
                }
            }
        }
    }
    for record in records.iter_mut() {
        let children = record
            .value_at(local)
            .and_then(|v| links.get(&ValueKey::from_value(v)))
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| targets.get(k).cloned())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        record.set_related(relation.name.clone(), Related::Many(children));
    }
    Ok(())
}

/// Attach every relation named in `lookups` to `records`. Records of mixed
/// entity types are not supported; all must share `entity`.
pub fn prefetch_related<'a>(
    db: &'a Database,
    executor: &'a Executor,
    entity: std::sync::Arc<EntityDescriptor>,
    mut records: Vec<&'a mut Record>,
    lookups: &'a [String],
) -> BoxFuture<'a, Result<(), OrmError>> {
    Box::pin(async move {
        if records.is_empty() || lookups.is_empty() {
            return Ok(());
        }
        for (head, tails) in group_lookups(lookups) {
            let relation = entity
                .relation(&head)
                .ok_or_else(|| {
                    OrmError::invalid(format!(
                        "cannot prefetch '{}': not a relation of '{}'",
                        head,
                        entity.name()
                    ))
                })?
                .clone();
            let load = async {
                match relation.kind {
                    RelationKind::ForwardOne => {
                        load_forward(db, executor, &entity, &relation, &mut records).await
                    }
                    RelationKind::ReverseMany => {
                        load_reverse(db, executor, &entity, &relation, &mut records).await
                    }
                    RelationKind::ManyToMany => {
                        load_many_to_many(db, executor, &entity, &relation, &mut records).await
                    }
                }
            };
            #[cfg(feature = "tracing")]
            let load = load.instrument(tracing_helpers::prefetch_span(&head));
            load.await?;

            if !tails.is_empty() {
                let related = db.registry().get(&relation.related_entity)?.clone();
                let children: Vec<&mut Record> = records
                    .iter_mut()
                    .flat_map(|r| r.related_records_mut(&head))
                    .collect();
                prefetch_related(db, executor, related, children, &tails).await?;
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_lookups_merges_heads() {
        let groups = group_lookups(&[
            "comments".to_string(),
            "comments__article".to_string(),
            "tags".to_string(),
        ]);
        assert_eq!(groups["comments"], vec!["article".to_string()]);
        assert!(groups["tags"].is_empty());
    }

    #[test]
    fn test_distinct_keys_skips_nulls_and_duplicates() {
        let a = Value::BigInt(Some(1));
        let b = Value::BigInt(None);
        let c = Value::Int(Some(1));
        let d = Value::BigInt(Some(2));
        let keys = distinct_keys(vec![Some(&a), Some(&b), None, Some(&c), Some(&d)].into_iter());
        assert_eq!(keys, vec![Value::BigInt(Some(1)), Value::BigInt(Some(2))]);
    }
}
