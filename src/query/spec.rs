//! Immutable description of a query's shape.
//!
//! Every builder method takes `&self` and returns a fresh `QuerySpec`; the
//! receiver is never touched. Validation against the registry happens in the
//! facade before these methods are called.

use std::sync::Arc;

use crate::entity::EntityDescriptor;
use crate::error::OrmError;
use crate::query::aggregate::Aggregate;
use crate::query::filter::FilterNode;

/// One ORDER BY term: `field` is a lookup path or an annotation alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub field: String,
    pub descending: bool,
}

impl OrderTerm {
    /// Parse `"-view_count"` / `"title"`.
    pub fn parse(term: &str) -> Result<Self, OrmError> {
        let (field, descending) = match term.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (term.strip_prefix('+').unwrap_or(term), false),
        };
        if field.is_empty() {
            return Err(OrmError::invalid(format!("invalid order_by term '{}'", term)));
        }
        Ok(Self {
            field: field.to_string(),
            descending,
        })
    }

    pub fn reversed(&self) -> Self {
        Self {
            field: self.field.clone(),
            descending: !self.descending,
        }
    }
}

/// What a fetch returns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Projection {
    #[default]
    Entity,
    /// Mappings of name → value. Empty means every concrete field.
    Values(Vec<String>),
    /// Tuples; `flat` yields bare values for a single field, `named` pairs names with values.
    ValuesList {
        fields: Vec<String>,
        flat: bool,
        named: bool,
    },
}

impl Projection {
    pub fn fields(&self) -> &[String] {
        match self {
            Projection::Entity => &[],
            Projection::Values(fields) => fields,
            Projection::ValuesList { fields, .. } => fields,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Distinct {
    #[default]
    Off,
    All,
    On(Vec<String>),
}

/// `OFFSET offset LIMIT count`; `count == None` means no upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub offset: u64,
    pub count: Option<u64>,
}

/// Which primary-entity columns are fetched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Loading {
    #[default]
    All,
    Only(Vec<String>),
    Defer(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub(crate) entity: Arc<EntityDescriptor>,
    pub(crate) filter: Option<FilterNode>,
    pub(crate) ordering: Vec<OrderTerm>,
    pub(crate) projection: Projection,
    pub(crate) distinct: Distinct,
    pub(crate) limit: Option<Limit>,
    pub(crate) select_related: Vec<String>,
    pub(crate) prefetch: Vec<String>,
    pub(crate) annotations: Vec<(String, Aggregate)>,
    pub(crate) group_by: bool,
    pub(crate) loading: Loading,
    pub(crate) empty: bool,
}

impl QuerySpec {
    pub fn new(entity: Arc<EntityDescriptor>) -> Self {
        Self {
            entity,
            filter: None,
            ordering: Vec::new(),
            projection: Projection::Entity,
            distinct: Distinct::Off,
            limit: None,
            select_related: Vec::new(),
            prefetch: Vec::new(),
            annotations: Vec::new(),
            group_by: false,
            loading: Loading::All,
            empty: false,
        }
    }

    pub fn entity(&self) -> &Arc<EntityDescriptor> {
        &self.entity
    }

    pub fn filter_node(&self) -> Option<&FilterNode> {
        self.filter.as_ref()
    }

    pub fn ordering(&self) -> &[OrderTerm] {
        &self.ordering
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn limit(&self) -> Option<Limit> {
        self.limit
    }

    pub fn is_sliced(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_empty_set(&self) -> bool {
        self.empty
    }

    pub fn prefetch_lookups(&self) -> &[String] {
        &self.prefetch
    }

    /// `And(old, predicate)`.
    pub fn with_filter(&self, predicate: FilterNode) -> Self {
        let mut next = self.clone();
        next.filter = Some(match next.filter.take() {
            Some(old) => old.and(predicate),
            None => predicate,
        });
        next
    }

    /// `And(old, Not(predicate))`.
    pub fn with_exclude(&self, predicate: FilterNode) -> Self {
        self.with_filter(predicate.negate())
    }

    /// Replaces any previous ordering.
    pub fn with_ordering(&self, terms: Vec<OrderTerm>) -> Self {
        let mut next = self.clone();
        next.ordering = terms;
        next
    }

    pub fn reversed(&self) -> Self {
        let terms = self.ordering.iter().map(OrderTerm::reversed).collect();
        self.with_ordering(terms)
    }

    pub fn with_distinct(&self, fields: Vec<String>) -> Self {
        let mut next = self.clone();
        next.distinct = if fields.is_empty() {
            Distinct::All
        } else {
            Distinct::On(fields)
        };
        next
    }

    /// `[start:stop]`; replaces any earlier slice.
    ///
    /// # Errors
    ///
    /// `InvalidQueryError` for negative bounds.
    pub fn sliced(&self, start: i64, stop: Option<i64>) -> Result<Self, OrmError> {
        if start < 0 || stop.map_or(false, |s| s < 0) {
            return Err(OrmError::invalid("Negative indexing is not supported."));
        }
        let offset = start as u64;
        let count = stop.map(|s| (s as u64).saturating_sub(offset));
        let mut next = self.clone();
        next.limit = Some(Limit { offset, count });
        Ok(next)
    }

    /// Cap the row count inside any existing slice, keeping its offset.
    pub fn capped(&self, n: u64) -> Self {
        let mut next = self.clone();
        next.limit = Some(match self.limit {
            Some(limit) => Limit {
                offset: limit.offset,
                count: Some(limit.count.map_or(n, |c| c.min(n))),
            },
            None => Limit {
                offset: 0,
                count: Some(n),
            },
        });
        next
    }

    pub fn with_select_related(&self, paths: Vec<String>) -> Self {
        let mut next = self.clone();
        for path in paths {
            if !next.select_related.contains(&path) {
                next.select_related.push(path);
            }
        }
        next
    }

    pub fn with_prefetch(&self, lookups: Vec<String>) -> Self {
        let mut next = self.clone();
        for lookup in lookups {
            if !next.prefetch.contains(&lookup) {
                next.prefetch.push(lookup);
            }
        }
        next
    }

    pub fn with_loading(&self, loading: Loading) -> Self {
        let mut next = self.clone();
        next.loading = loading;
        next
    }

    pub fn with_projection(&self, projection: Projection) -> Self {
        let mut next = self.clone();
        next.projection = projection;
        next
    }

    pub fn with_annotations(&self, annotations: Vec<(String, Aggregate)>) -> Self {
        let mut next = self.clone();
        next.annotations.extend(annotations);
        next.group_by = !next.annotations.is_empty();
        next
    }

    /// Spec for aggregate terminals: ordering is irrelevant to the result.
    pub fn without_ordering(&self) -> Self {
        self.with_ordering(Vec::new())
    }

    pub fn emptied(&self) -> Self {
        let mut next = self.clone();
        next.empty = true;
        next
    }
}
