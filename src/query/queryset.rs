//! The `QuerySet` facade: chainable, immutable query building plus async terminals.
//!
//! Chain methods never touch the receiver; each returns a new `QuerySet` with an
//! empty result cache. The first row-returning terminal fills the cache
//! (Unevaluated → Evaluated) and later terminals read from it where they can.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use sea_query::Value;
use tokio::sync::OnceCell;

use crate::config::DEFAULT_DB_ALIAS;
use crate::connection::{Connection, IsolationLevel, Transaction};
use crate::database::Database;
use crate::entity::{EntityDescriptor, RelationKind, Registry};
use crate::error::OrmError;
use crate::executor::{query_on, Executor};
use crate::hydrate::{records_from_rows, values_from_rows, ValuesRow, ValuesShape};
use crate::model::{insert_on, update_on, Record};
use crate::query::aggregate::{Aggregate, AggregateFunc};
use crate::query::compiler::{compile_select, CompiledQuery, SqlCompiler};
use crate::query::dialect::quote_ident;
use crate::query::filter::{Q, LOOKUP_SEP};
use crate::query::mutation::{compile_bulk_insert, compile_delete, compile_update, OnConflict};
use crate::query::resolve::{validate_filter, validate_path, validate_relation_path};
use crate::query::spec::{Loading, OrderTerm, Projection, QuerySpec};
use crate::relation::prefetch_related;
use crate::value::{coerce, null_of, try_getable::integer_of, ValueKey};

/// `get` fetches at most this many rows to tell "one" from "several".
const MAX_GET_RESULTS: u64 = 2;

/// Options for [`QuerySet::abulk_create`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkCreateOptions {
    /// Records per INSERT; `None` uses the configured `bulk_batch_size`.
    pub batch_size: Option<usize>,
    pub on_conflict: OnConflict,
}

/// A lazy, immutable description of a query against one entity.
pub struct QuerySet {
    db: Database,
    spec: QuerySpec,
    alias: String,
    cache: OnceCell<Vec<Record>>,
}

impl Clone for QuerySet {
    /// Copies the description; the clone starts unevaluated.
    fn clone(&self) -> Self {
        self.derive(self.spec.clone())
    }
}

impl fmt::Debug for QuerySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySet")
            .field("entity", &self.spec.entity().name())
            .field("alias", &self.alias)
            .field("evaluated", &self.is_evaluated())
            .finish()
    }
}

async fn rollback_quietly(tx: Transaction) {
    if let Err(err) = tx.rollback().await {
        log::warn!("rollback failed: {}", err);
    }
}

/// Field written by an assignment name: a concrete field, `pk`, or a forward
/// relation name standing for its foreign key.
fn assignment_index(entity: &EntityDescriptor, name: &str) -> Result<usize, OrmError> {
    if let Some(index) = entity.field_index(name) {
        return Ok(index);
    }
    match entity.relation(name) {
        Some(relation) if relation.kind == RelationKind::ForwardOne => entity
            .field_by_column(&relation.local_column)
            .ok_or_else(|| {
                OrmError::invalid(format!(
                    "relation '{}' has no local field for column '{}'",
                    name, relation.local_column
                ))
            }),
        _ => entity.require_field(name),
    }
}

fn batch_len(requested: Option<usize>, configured: usize, total: usize) -> usize {
    requested
        .filter(|n| *n > 0)
        .or(Some(configured).filter(|n| *n > 0))
        .unwrap_or(total)
        .max(1)
}

impl QuerySet {
    pub(crate) fn new(db: Database, entity: Arc<EntityDescriptor>) -> Self {
        Self {
            db,
            spec: QuerySpec::new(entity),
            alias: DEFAULT_DB_ALIAS.to_string(),
            cache: OnceCell::new(),
        }
    }

    fn derive(&self, spec: QuerySpec) -> Self {
        Self {
            db: self.db.clone(),
            spec,
            alias: self.alias.clone(),
            cache: OnceCell::new(),
        }
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn entity(&self) -> &Arc<EntityDescriptor> {
        self.spec.entity()
    }

    pub fn db_alias(&self) -> &str {
        &self.alias
    }

    pub fn is_evaluated(&self) -> bool {
        self.cache.initialized()
    }

    /// Cached records, once evaluated.
    pub fn cached(&self) -> Option<&[Record]> {
        self.cache.get().map(Vec::as_slice)
    }

    fn registry(&self) -> &Registry {
        self.db.registry()
    }

    fn executor(&self) -> Executor {
        self.db.executor(&self.alias)
    }

    fn ensure_unsliced(&self, action: &str) -> Result<(), OrmError> {
        if self.spec.is_sliced() {
            return Err(OrmError::invalid(format!(
                "Cannot {} a query once a slice has been taken.",
                action
            )));
        }
        Ok(())
    }

    fn is_annotation(&self, name: &str) -> bool {
        self.spec.annotations.iter().any(|(alias, _)| alias == name)
    }

    // ----- chain operations ---------------------------------------------------

    pub fn all(&self) -> QuerySet {
        self.clone()
    }

    /// Keep rows matching `predicate`; repeated calls are ANDed.
    pub fn filter(&self, predicate: Q) -> Result<QuerySet, OrmError> {
        self.ensure_unsliced("filter")?;
        let node = validate_filter(self.registry(), self.entity(), predicate)?;
        Ok(self.derive(self.spec.with_filter(node)))
    }

    /// `filter` with one `exact`-style lookup per pair.
    pub fn filter_by(&self, pairs: &[(&str, Value)]) -> Result<QuerySet, OrmError> {
        self.filter(Q::all(pairs.iter().map(|(k, v)| Q::new(k, v.clone()))))
    }

    /// Drop rows matching `predicate`.
    pub fn exclude(&self, predicate: Q) -> Result<QuerySet, OrmError> {
        self.ensure_unsliced("filter")?;
        let node = validate_filter(self.registry(), self.entity(), predicate)?;
        Ok(self.derive(self.spec.with_exclude(node)))
    }

    /// Replace the ordering; `-field` sorts descending, an empty list clears it.
    pub fn order_by(&self, fields: &[&str]) -> Result<QuerySet, OrmError> {
        self.ensure_unsliced("reorder")?;
        let mut terms = Vec::with_capacity(fields.len());
        for field in fields {
            let term = OrderTerm::parse(field)?;
            if !self.is_annotation(&term.field) {
                validate_path(self.registry(), self.entity(), &term.field)?;
            }
            terms.push(term);
        }
        Ok(self.derive(self.spec.with_ordering(terms)))
    }

    /// Flip every ordering term.
    pub fn reverse(&self) -> Result<QuerySet, OrmError> {
        self.ensure_unsliced("reverse")?;
        Ok(self.derive(self.spec.reversed()))
    }

    pub fn distinct(&self) -> QuerySet {
        self.derive(self.spec.with_distinct(Vec::new()))
    }

    /// `DISTINCT ON (fields)`.
    pub fn distinct_on(&self, fields: &[&str]) -> Result<QuerySet, OrmError> {
        if fields.is_empty() {
            return Ok(self.distinct());
        }
        for field in fields {
            validate_path(self.registry(), self.entity(), field)?;
        }
        Ok(self.derive(
            self.spec
                .with_distinct(fields.iter().map(|f| f.to_string()).collect()),
        ))
    }

    /// `[start:stop]`. Negative bounds are rejected.
    pub fn slice(&self, start: i64, stop: Option<i64>) -> Result<QuerySet, OrmError> {
        Ok(self.derive(self.spec.sliced(start, stop)?))
    }

    /// The single row at position `i`, as a one-row slice.
    pub fn index(&self, i: i64) -> Result<QuerySet, OrmError> {
        self.slice(i, Some(i.saturating_add(1)))
    }

    /// At most `n` rows, inside any existing slice.
    pub fn limit(&self, n: u64) -> QuerySet {
        self.derive(self.spec.capped(n))
    }

    fn checked_fields(&self, fields: &[&str]) -> Result<Vec<String>, OrmError> {
        fields
            .iter()
            .map(|f| {
                if !self.is_annotation(f) {
                    validate_path(self.registry(), self.entity(), f)?;
                }
                Ok(f.to_string())
            })
            .collect()
    }

    /// Rows as name → value maps. No fields means every concrete field.
    pub fn values(&self, fields: &[&str]) -> Result<QuerySet, OrmError> {
        let fields = self.checked_fields(fields)?;
        Ok(self.derive(self.spec.with_projection(Projection::Values(fields))))
    }

    /// Rows as tuples; `flat` yields bare values of a single field, `named` pairs names with values.
    pub fn values_list(&self, fields: &[&str], flat: bool, named: bool) -> Result<QuerySet, OrmError> {
        if flat && named {
            return Err(OrmError::invalid("'flat' and 'named' can't be used together."));
        }
        if flat && fields.len() > 1 {
            return Err(OrmError::invalid(
                "'flat' is not valid when values_list is called with more than one field.",
            ));
        }
        let fields = self.checked_fields(fields)?;
        Ok(self.derive(self.spec.with_projection(Projection::ValuesList {
            fields,
            flat,
            named,
        })))
    }

    /// Join forward relations into the primary query.
    pub fn select_related(&self, paths: &[&str]) -> Result<QuerySet, OrmError> {
        for path in paths {
            let relations = validate_relation_path(self.registry(), self.entity(), path)?;
            if relations.iter().any(|r| r.kind != RelationKind::ForwardOne) {
                return Err(OrmError::invalid(format!(
                    "Invalid field name(s) given in select_related: '{}'. Choices are forward single-valued relations only.",
                    path
                )));
            }
        }
        Ok(self.derive(
            self.spec
                .with_select_related(paths.iter().map(|p| p.to_string()).collect()),
        ))
    }

    /// Load relations with one extra query per path after the primary fetch.
    pub fn prefetch_related(&self, paths: &[&str]) -> Result<QuerySet, OrmError> {
        for path in paths {
            validate_relation_path(self.registry(), self.entity(), path)?;
        }
        Ok(self.derive(
            self.spec
                .with_prefetch(paths.iter().map(|p| p.to_string()).collect()),
        ))
    }

    /// Add aggregate columns; rows are grouped by the selected fields.
    pub fn annotate(&self, annotations: &[(&str, Aggregate)]) -> Result<QuerySet, OrmError> {
        let mut out = Vec::with_capacity(annotations.len());
        for (alias, aggregate) in annotations {
            if self.entity().field_index(alias).is_some() || self.entity().relation(alias).is_some() {
                return Err(OrmError::invalid(format!(
                    "The annotation '{}' conflicts with a field on the model.",
                    alias
                )));
            }
            if self.is_annotation(alias) || out.iter().any(|(a, _): &(String, Aggregate)| a == alias) {
                return Err(OrmError::invalid(format!(
                    "The annotation '{}' is already defined.",
                    alias
                )));
            }
            self.check_aggregate(aggregate)?;
            out.push((alias.to_string(), aggregate.clone()));
        }
        Ok(self.derive(self.spec.with_annotations(out)))
    }

    fn check_aggregate(&self, aggregate: &Aggregate) -> Result<(), OrmError> {
        if aggregate.is_star() {
            if aggregate.func != AggregateFunc::Count {
                return Err(OrmError::invalid(format!(
                    "{}(*) is not a valid aggregate",
                    aggregate.func.sql_name()
                )));
            }
            return Ok(());
        }
        validate_path(self.registry(), self.entity(), &aggregate.path).map(|_| ())
    }

    fn concrete_fields(&self, fields: &[&str]) -> Result<Vec<String>, OrmError> {
        fields
            .iter()
            .map(|f| self.entity().require_field(f).map(|_| f.to_string()))
            .collect()
    }

    /// Load only these fields (plus the primary key).
    pub fn only(&self, fields: &[&str]) -> Result<QuerySet, OrmError> {
        let fields = self.concrete_fields(fields)?;
        Ok(self.derive(self.spec.with_loading(Loading::Only(fields))))
    }

    /// Load every field except these.
    pub fn defer(&self, fields: &[&str]) -> Result<QuerySet, OrmError> {
        let fields = self.concrete_fields(fields)?;
        Ok(self.derive(self.spec.with_loading(Loading::Defer(fields))))
    }

    /// Run against another database alias.
    pub fn using(&self, alias: &str) -> QuerySet {
        let mut next = self.clone();
        next.alias = alias.to_string();
        next
    }

    /// A QuerySet that matches nothing and never touches the database.
    pub fn none(&self) -> QuerySet {
        self.derive(self.spec.emptied())
    }

    /// The SELECT this QuerySet would run.
    pub fn compiled(&self) -> Result<CompiledQuery, OrmError> {
        compile_select(self.registry(), &self.spec)
    }

    // ----- evaluation ---------------------------------------------------------

    fn entity_query(&self, spec: &QuerySpec) -> Result<CompiledQuery, OrmError> {
        if *spec.projection() != Projection::Entity {
            return Err(OrmError::invalid(
                "this QuerySet returns values; use avalues() instead",
            ));
        }
        compile_select(self.registry(), spec)
    }

    async fn attach_prefetches(
        &self,
        executor: &Executor,
        records: &mut [Record],
        spec: &QuerySpec,
    ) -> Result<(), OrmError> {
        if spec.prefetch_lookups().is_empty() {
            return Ok(());
        }
        prefetch_related(
            &self.db,
            executor,
            spec.entity().clone(),
            records.iter_mut().collect(),
            spec.prefetch_lookups(),
        )
        .await
    }

    /// Fetch every record of `spec`. The connection is released before
    /// prefetch queries run.
    async fn run_spec(&self, spec: &QuerySpec) -> Result<Vec<Record>, OrmError> {
        if spec.is_empty_set() {
            return Ok(Vec::new());
        }
        let compiled = self.entity_query(spec)?;
        let executor = self.executor();
        let rows = executor.fetch_all(&compiled.sql, &compiled.params).await?;
        let mut records = records_from_rows(&compiled.plan, &rows, &self.alias)?;
        self.attach_prefetches(&executor, &mut records, spec).await?;
        Ok(records)
    }

    /// `run_spec` on a connection the caller holds; `suffix` is appended to the SQL.
    async fn run_spec_on(
        &self,
        conn: &mut dyn Connection,
        spec: &QuerySpec,
        suffix: &str,
    ) -> Result<Vec<Record>, OrmError> {
        if spec.is_empty_set() {
            return Ok(Vec::new());
        }
        let compiled = self.entity_query(spec)?;
        let sql = format!("{}{}", compiled.sql, suffix);
        let rows = query_on(conn, &sql, &compiled.params).await?;
        let mut records = records_from_rows(&compiled.plan, &rows, &self.alias)?;
        self.attach_prefetches(&self.executor(), &mut records, spec).await?;
        Ok(records)
    }

    /// Evaluate once and return the cached records.
    pub async fn fetch(&self) -> Result<&[Record], OrmError> {
        self.cache
            .get_or_try_init(|| self.run_spec(&self.spec))
            .await
            .map(Vec::as_slice)
    }

    /// Every record (evaluates and fills the cache).
    pub async fn alist(&self) -> Result<Vec<Record>, OrmError> {
        Ok(self.fetch().await?.to_vec())
    }

    /// Stream over the cached result, evaluating first if needed.
    pub fn aiter(&self) -> BoxStream<'_, Result<Record, OrmError>> {
        stream::once(self.fetch())
            .map(|fetched| match fetched {
                Ok(records) => stream::iter(records.iter().cloned().map(Ok)).left_stream(),
                Err(err) => stream::once(future::ready(Err(err))).right_stream(),
            })
            .flatten()
            .boxed()
    }

    /// Lazy batches of at most `chunk_size` records; nothing is cached and the
    /// connection is held until the stream ends or is dropped.
    pub fn achunks(&self, chunk_size: usize) -> BoxStream<'static, Result<Vec<Record>, OrmError>> {
        if self.spec.is_empty_set() {
            return stream::empty().boxed();
        }
        let compiled = match self.entity_query(&self.spec) {
            Ok(compiled) => compiled,
            Err(err) => return stream::once(future::ready(Err(err))).boxed(),
        };
        let db = self.db.clone();
        let alias = self.alias.clone();
        let entity = self.spec.entity().clone();
        let lookups = self.spec.prefetch_lookups().to_vec();
        let plan = compiled.plan;
        self.executor()
            .fetch_chunked(compiled.sql, compiled.params, chunk_size)
            .and_then(move |rows| {
                let db = db.clone();
                let alias = alias.clone();
                let entity = entity.clone();
                let lookups = lookups.clone();
                let records = records_from_rows(&plan, &rows, &alias);
                async move {
                    let mut records = records?;
                    if !lookups.is_empty() {
                        let executor = db.executor(&alias);
                        prefetch_related(&db, &executor, entity, records.iter_mut().collect(), &lookups)
                            .await?;
                    }
                    Ok(records)
                }
            })
            .boxed()
    }

    /// Record stream fetched in chunks (default: `iterator_chunk_size`), without caching.
    pub fn aiterator(&self, chunk_size: Option<usize>) -> BoxStream<'static, Result<Record, OrmError>> {
        let chunk_size = chunk_size.unwrap_or(self.db.settings().iterator_chunk_size);
        self.achunks(chunk_size)
            .map_ok(|batch| stream::iter(batch.into_iter().map(Ok::<Record, OrmError>)))
            .try_flatten()
            .boxed()
    }

    // ----- single-object terminals -------------------------------------------

    fn single(&self, mut records: Vec<Record>) -> Result<Record, OrmError> {
        match records.len() {
            0 => Err(OrmError::DoesNotExist {
                entity: self.entity().name().to_string(),
            }),
            1 => Ok(records.remove(0)),
            found => Err(OrmError::MultipleObjectsReturned {
                entity: self.entity().name().to_string(),
                found,
            }),
        }
    }

    /// Exactly one record; `DoesNotExist` or `MultipleObjectsReturned` otherwise.
    pub async fn aget(&self) -> Result<Record, OrmError> {
        let records = self.run_spec(&self.spec.capped(MAX_GET_RESULTS)).await?;
        self.single(records)
    }

    /// `filter(predicate)` then `aget()`.
    pub async fn aget_by(&self, predicate: Q) -> Result<Record, OrmError> {
        self.filter(predicate)?.aget().await
    }

    fn pk_ordering(&self, descending: bool) -> Vec<OrderTerm> {
        vec![OrderTerm {
            field: self.entity().primary_key().name.clone(),
            descending,
        }]
    }

    /// First record by the current ordering (primary key when unordered). A
    /// slice keeps its window; the primary key then orders the rows inside it.
    pub async fn afirst(&self) -> Result<Option<Record>, OrmError> {
        let spec = if self.spec.ordering().is_empty() {
            self.spec.with_ordering(self.pk_ordering(false))
        } else {
            self.spec.clone()
        };
        Ok(self.run_spec(&spec.capped(1)).await?.into_iter().next())
    }

    /// Last record by the current ordering (primary key when unordered).
    pub async fn alast(&self) -> Result<Option<Record>, OrmError> {
        if self.spec.is_sliced() {
            // a slice is fetched whole and its tail taken
            let spec = if self.spec.ordering().is_empty() {
                self.spec.with_ordering(self.pk_ordering(false))
            } else {
                self.spec.clone()
            };
            return Ok(self.run_spec(&spec).await?.pop());
        }
        let spec = if self.spec.ordering().is_empty() {
            self.spec.with_ordering(self.pk_ordering(true))
        } else {
            self.spec.reversed()
        };
        Ok(self.run_spec(&spec.capped(1)).await?.into_iter().next())
    }

    // ----- scalar terminals ---------------------------------------------------

    async fn scalar_i64(&self, compiled: CompiledQuery) -> Result<i64, OrmError> {
        let row = self
            .executor()
            .fetch_one(&compiled.sql, &compiled.params)
            .await?
            .ok_or_else(|| OrmError::HydrationError(format!("no row from: {}", compiled.sql)))?;
        let value = row
            .get(0)
            .ok_or_else(|| OrmError::HydrationError("empty row".into()))?;
        integer_of(value)
            .flatten()
            .ok_or_else(|| OrmError::HydrationError(format!("expected an integer, got {:?}", value)))
    }

    /// Number of matching rows; answered from the cache once evaluated.
    pub async fn acount(&self) -> Result<u64, OrmError> {
        if let Some(records) = self.cache.get() {
            return Ok(records.len() as u64);
        }
        if self.spec.is_empty_set() {
            return Ok(0);
        }
        let compiled = SqlCompiler::new(self.registry(), &self.spec).compile_count()?;
        let count = self.scalar_i64(compiled).await?;
        u64::try_from(count).map_err(|_| OrmError::HydrationError(format!("negative count {}", count)))
    }

    /// Whether any row matches; answered from the cache once evaluated.
    pub async fn aexists(&self) -> Result<bool, OrmError> {
        if let Some(records) = self.cache.get() {
            return Ok(!records.is_empty());
        }
        if self.spec.is_empty_set() {
            return Ok(false);
        }
        let compiled = SqlCompiler::new(self.registry(), &self.spec).compile_exists()?;
        let row = self
            .executor()
            .fetch_one(&compiled.sql, &compiled.params)
            .await?;
        Ok(row.is_some())
    }

    /// Aggregates over the matching rows, keyed by alias. SUM/AVG/MAX/MIN over
    /// no rows yield NULL, COUNT yields 0.
    pub async fn aaggregate(
        &self,
        aggregates: &[(&str, Aggregate)],
    ) -> Result<HashMap<String, Value>, OrmError> {
        let mut pairs: Vec<(String, Aggregate)> = Vec::with_capacity(aggregates.len());
        for (alias, aggregate) in aggregates {
            if pairs.iter().any(|(a, _)| a == alias) {
                return Err(OrmError::invalid(format!("duplicate aggregate alias '{}'", alias)));
            }
            // a grouped query's annotations are columns the aggregate can read
            if !self.is_annotation(&aggregate.path) {
                self.check_aggregate(aggregate)?;
            }
            pairs.push((alias.to_string(), aggregate.clone()));
        }
        if pairs.is_empty() {
            return Err(OrmError::invalid("aggregate() needs at least one aggregate"));
        }
        if self.spec.is_empty_set() {
            return Ok(pairs
                .into_iter()
                .map(|(alias, aggregate)| {
                    let value = match aggregate.func {
                        AggregateFunc::Count => Value::BigInt(Some(0)),
                        _ => Value::BigInt(None),
                    };
                    (alias, value)
                })
                .collect());
        }
        let spec = if self.spec.is_sliced() {
            self.spec.clone()
        } else {
            self.spec.without_ordering()
        };
        let compiled = SqlCompiler::new(self.registry(), &spec).compile_aggregate(&pairs)?;
        let row = self
            .executor()
            .fetch_one(&compiled.sql, &compiled.params)
            .await?
            .ok_or_else(|| OrmError::HydrationError(format!("no row from: {}", compiled.sql)))?;
        if row.len() != compiled.labels.len() {
            return Err(OrmError::HydrationError(format!(
                "aggregate row has {} columns, expected {}",
                row.len(),
                compiled.labels.len()
            )));
        }
        Ok(compiled.labels.into_iter().zip(row.values).collect())
    }

    /// `aaggregate` keyed by default aliases (`field__sum`, ...).
    pub async fn aaggregate_default(
        &self,
        aggregates: &[Aggregate],
    ) -> Result<HashMap<String, Value>, OrmError> {
        let aliases: Vec<String> = aggregates.iter().map(Aggregate::default_alias).collect();
        let pairs: Vec<(&str, Aggregate)> = aliases
            .iter()
            .map(String::as_str)
            .zip(aggregates.iter().cloned())
            .collect();
        self.aaggregate(&pairs).await
    }

    /// Rows of a `values()` / `values_list()` QuerySet. An entity QuerySet
    /// yields maps of every concrete field.
    pub async fn avalues(&self) -> Result<Vec<ValuesRow>, OrmError> {
        if self.spec.is_empty_set() {
            return Ok(Vec::new());
        }
        let (spec, shape) = match self.spec.projection() {
            Projection::Entity => (
                self.spec.with_projection(Projection::Values(Vec::new())),
                ValuesShape::Map,
            ),
            Projection::Values(_) => (self.spec.clone(), ValuesShape::Map),
            Projection::ValuesList { flat, named, .. } => (
                self.spec.clone(),
                match (flat, named) {
                    (true, _) => ValuesShape::Flat,
                    (_, true) => ValuesShape::Named,
                    _ => ValuesShape::Tuple,
                },
            ),
        };
        let compiled = compile_select(self.registry(), &spec)?;
        let rows = self
            .executor()
            .fetch_all(&compiled.sql, &compiled.params)
            .await?;
        values_from_rows(&rows, &compiled.labels, shape)
    }

    /// Records keyed by `field`, which must be the primary key or unique.
    /// `Some(vec![])` returns an empty map without a query.
    pub async fn ain_bulk(
        &self,
        ids: Option<Vec<Value>>,
        field: &str,
    ) -> Result<HashMap<ValueKey, Record>, OrmError> {
        if self.spec.is_sliced() {
            return Err(OrmError::invalid("Cannot use 'limit' or 'offset' with in_bulk()."));
        }
        let index = self.entity().require_field(field)?;
        let descriptor = &self.entity().fields()[index];
        if !(descriptor.is_primary_key || descriptor.unique) {
            return Err(OrmError::invalid(format!(
                "in_bulk()'s field_name must be a unique field but '{}' isn't.",
                field
            )));
        }
        let qs = match ids {
            Some(ids) if ids.is_empty() => return Ok(HashMap::new()),
            Some(ids) => self.filter(Q::is_in(&format!("{}__in", descriptor.name), ids))?,
            None => self.clone(),
        };
        let records = qs.run_spec(&qs.spec).await?;
        let mut out = HashMap::with_capacity(records.len());
        for record in records {
            let key = record.value_at(index).map(ValueKey::from_value).ok_or_else(|| {
                OrmError::invalid(format!("in_bulk() field '{}' was deferred", field))
            })?;
            out.insert(key, record);
        }
        Ok(out)
    }

    // ----- writes -------------------------------------------------------------

    fn assign(&self, record: &mut Record, pairs: &[(&str, Value)]) -> Result<Vec<usize>, OrmError> {
        let mut touched = Vec::with_capacity(pairs.len());
        for (name, value) in pairs {
            let index = assignment_index(self.entity(), name)?;
            let field = &self.entity().fields()[index];
            record.set_at(index, coerce(field, value.clone())?);
            if !touched.contains(&index) {
                touched.push(index);
            }
        }
        Ok(touched)
    }

    /// A new record from lookup pairs (entries carrying a `__` lookup are
    /// skipped) overlaid with `defaults`.
    fn build_from(&self, lookup: &[(&str, Value)], defaults: &[(&str, Value)]) -> Result<Record, OrmError> {
        let mut record = Record::new(self.entity().clone());
        let plain: Vec<(&str, Value)> = lookup
            .iter()
            .filter(|(name, _)| !name.contains(LOOKUP_SEP))
            .map(|(name, value)| (*name, value.clone()))
            .collect();
        self.assign(&mut record, &plain)?;
        self.assign(&mut record, defaults)?;
        Ok(record)
    }

    /// INSERT one record built from `values`; returns it with generated columns.
    pub async fn acreate(&self, values: &[(&str, Value)]) -> Result<Record, OrmError> {
        let mut record = Record::new(self.entity().clone());
        self.assign(&mut record, values)?;
        let mut conn = self.executor().acquire().await?;
        insert_on(conn.as_mut(), &mut record).await?;
        Ok(record)
    }

    /// UPDATE every matching row; returns the affected count.
    pub async fn aupdate(&self, values: &[(&str, Value)]) -> Result<u64, OrmError> {
        self.ensure_unsliced("update")?;
        if self.spec.is_empty_set() {
            return Ok(0);
        }
        let mut assignments = Vec::with_capacity(values.len());
        for (name, value) in values {
            let index = assignment_index(self.entity(), name)?;
            assignments.push((index, coerce(&self.entity().fields()[index], value.clone())?));
        }
        let stmt = compile_update(self.registry(), &self.spec, &assignments)?;
        self.executor().execute(&stmt.sql, &stmt.params).await
    }

    /// DELETE every matching row; returns the total and a per-entity breakdown.
    pub async fn adelete(&self) -> Result<(u64, BTreeMap<String, u64>), OrmError> {
        self.ensure_unsliced("delete")?;
        if self.spec.is_empty_set() {
            return Ok((0, BTreeMap::new()));
        }
        if !self.spec.select_related.is_empty() || *self.spec.projection() != Projection::Entity {
            return Err(OrmError::invalid(
                "delete() is only valid on plain entity QuerySets",
            ));
        }
        let stmt = compile_delete(self.registry(), &self.spec)?;
        let deleted = self.executor().execute(&stmt.sql, &stmt.params).await?;
        let mut breakdown = BTreeMap::new();
        breakdown.insert(self.entity().name().to_string(), deleted);
        Ok((deleted, breakdown))
    }

    /// INSERT many records in batches, one statement per batch on one connection.
    /// Primary keys are written back unless conflicts are ignored.
    pub async fn abulk_create(
        &self,
        mut records: Vec<Record>,
        options: BulkCreateOptions,
    ) -> Result<Vec<Record>, OrmError> {
        if records.is_empty() {
            return Ok(records);
        }
        let entity = self.entity().clone();
        if let Some(other) = records.iter().find(|r| r.entity_name() != entity.name()) {
            return Err(OrmError::invalid(format!(
                "bulk_create() on '{}' got a '{}' record",
                entity.name(),
                other.entity_name()
            )));
        }
        let pk = entity.pk_index();
        let all: Vec<usize> = (0..entity.fields().len()).collect();
        let without_pk: Vec<usize> = all.iter().copied().filter(|&i| i != pk).collect();
        let (with_key, without_key): (Vec<usize>, Vec<usize>) =
            (0..records.len()).partition(|&i| records[i].pk().is_some());
        let batch = batch_len(options.batch_size, self.db.settings().bulk_batch_size, records.len());

        let mut conn = self.executor().acquire().await?;
        for (indices, columns) in [(with_key, &all), (without_key, &without_pk)] {
            for chunk in indices.chunks(batch) {
                let rows: Vec<Vec<Value>> = chunk
                    .iter()
                    .map(|&i| {
                        columns
                            .iter()
                            .map(|&c| {
                                records[i]
                                    .value_at(c)
                                    .cloned()
                                    .unwrap_or_else(|| null_of(entity.fields()[c].field_type))
                            })
                            .collect()
                    })
                    .collect();
                let compiled = compile_bulk_insert(&entity, columns, &rows, &options.on_conflict)?;
                let returned = query_on(conn.as_mut(), &compiled.sql, &compiled.params).await?;
                if options.on_conflict == OnConflict::Ignore {
                    continue;
                }
                if returned.len() != chunk.len() {
                    return Err(OrmError::execution(
                        &compiled.sql,
                        format!("expected {} returned keys, got {}", chunk.len(), returned.len()),
                    ));
                }
                for (row, &i) in returned.iter().zip(chunk) {
                    let key = row
                        .get(0)
                        .ok_or_else(|| OrmError::HydrationError("empty RETURNING row".into()))?;
                    let key = coerce(&entity.fields()[pk], key.clone())?;
                    records[i].set_at(pk, key);
                    records[i].mark_persisted(&self.alias);
                }
            }
        }
        Ok(records)
    }

    /// UPDATE `fields` of each record by primary key. Each batch runs in its own
    /// transaction; a failing batch is rolled back and stops the remaining ones.
    pub async fn abulk_update(
        &self,
        records: &[Record],
        fields: &[&str],
        batch_size: Option<usize>,
    ) -> Result<u64, OrmError> {
        if records.is_empty() || fields.is_empty() {
            return Ok(0);
        }
        let entity = self.entity();
        let mut indices = Vec::with_capacity(fields.len());
        for field in fields {
            let index = entity.require_field(field)?;
            if index == entity.pk_index() {
                return Err(OrmError::invalid(
                    "bulk_update() cannot be used with primary key fields.",
                ));
            }
            indices.push(index);
        }
        if records.iter().any(|r| r.pk().is_none()) {
            return Err(OrmError::invalid(
                "All bulk_update() objects must have a primary key set.",
            ));
        }
        let batch = batch_len(batch_size, self.db.settings().bulk_batch_size, records.len());
        let mut total = 0;
        for chunk in records.chunks(batch) {
            let mut tx = self
                .db
                .transaction(&self.alias, IsolationLevel::ReadCommitted)
                .await?;
            let mut updated = 0;
            let mut failure = None;
            for record in chunk {
                match update_on(tx.connection()?, &self.db, record, &indices).await {
                    Ok(n) => updated += n,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            if let Some(err) = failure {
                rollback_quietly(tx).await;
                return Err(err);
            }
            tx.commit().await?;
            total += updated;
        }
        Ok(total)
    }

    /// Fetch the record matching `lookup`, creating it from `lookup` and
    /// `defaults` when absent. Returns `(record, created)`.
    pub async fn aget_or_create(
        &self,
        lookup: &[(&str, Value)],
        defaults: &[(&str, Value)],
    ) -> Result<(Record, bool), OrmError> {
        let filtered = self.filter_by(lookup)?;
        let get_spec = filtered.spec.capped(MAX_GET_RESULTS);
        let mut tx = self
            .db
            .transaction(&self.alias, IsolationLevel::ReadCommitted)
            .await?;
        let existing = filtered.run_spec_on(tx.connection()?, &get_spec, "").await;
        match existing {
            Ok(records) if !records.is_empty() => {
                tx.commit().await?;
                return filtered.single(records).map(|r| (r, false));
            }
            Ok(_) => {}
            Err(err) => {
                rollback_quietly(tx).await;
                return Err(err);
            }
        }
        let mut record = self.build_from(lookup, defaults)?;
        let inserted = insert_on(tx.connection()?, &mut record).await;
        match inserted {
            Ok(()) => {
                tx.commit().await?;
                Ok((record, true))
            }
            Err(err) if err.is_unique_violation() => {
                rollback_quietly(tx).await;
                log::debug!("get_or_create on '{}' raced a concurrent insert", self.entity().name());
                match filtered.aget().await {
                    Ok(found) => Ok((found, false)),
                    Err(OrmError::DoesNotExist { .. }) => Err(err),
                    Err(other) => Err(other),
                }
            }
            Err(err) => {
                rollback_quietly(tx).await;
                Err(err)
            }
        }
    }

    /// Update the record matching `lookup` with `defaults`, or create it from
    /// `lookup` and `create_defaults` (falling back to `defaults`).
    /// The match is locked with `SELECT ... FOR UPDATE` until commit.
    pub async fn aupdate_or_create(
        &self,
        lookup: &[(&str, Value)],
        defaults: &[(&str, Value)],
        create_defaults: Option<&[(&str, Value)]>,
    ) -> Result<(Record, bool), OrmError> {
        let filtered = self.filter_by(lookup)?;
        let lock_spec = filtered.spec.capped(MAX_GET_RESULTS);
        let lock = format!(" FOR UPDATE OF {}", quote_ident(self.entity().table_name()));
        let mut last_error = None;
        for _attempt in 0..2 {
            let mut tx = self
                .db
                .transaction(&self.alias, IsolationLevel::ReadCommitted)
                .await?;
            let locked = filtered.run_spec_on(tx.connection()?, &lock_spec, &lock).await;
            let found = match locked {
                Ok(found) => found,
                Err(err) => {
                    rollback_quietly(tx).await;
                    return Err(err);
                }
            };
            if !found.is_empty() {
                let outcome = match filtered.single(found) {
                    Ok(mut record) => match self.assign(&mut record, defaults) {
                        Ok(touched) => update_on(tx.connection()?, &self.db, &record, &touched)
                            .await
                            .map(|_| record),
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(err),
                };
                return match outcome {
                    Ok(record) => {
                        tx.commit().await?;
                        Ok((record, false))
                    }
                    Err(err) => {
                        rollback_quietly(tx).await;
                        Err(err)
                    }
                };
            }
            let mut record = self.build_from(lookup, create_defaults.unwrap_or(defaults))?;
            let inserted = insert_on(tx.connection()?, &mut record).await;
            match inserted {
                Ok(()) => {
                    tx.commit().await?;
                    return Ok((record, true));
                }
                Err(err) if err.is_unique_violation() => {
                    rollback_quietly(tx).await;
                    log::debug!(
                        "update_or_create on '{}' raced a concurrent insert; retrying",
                        self.entity().name()
                    );
                    last_error = Some(err);
                }
                Err(err) => {
                    rollback_quietly(tx).await;
                    return Err(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| OrmError::invalid("update_or_create did not settle")))
    }
}
