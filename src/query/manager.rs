//! Managers: the per-entity entry point for building QuerySets.
//!
//! A [`Manager`] wraps the entity's base [`QuerySet`] and dereferences to it, so
//! every chain operation and terminal is available directly:
//!
//! ```no_run
//! use undertow::{Database, OrmError, Q};
//!
//! async fn published_titles(db: &Database) -> Result<usize, OrmError> {
//!     let articles = db.objects("article")?;
//!     let published = articles
//!         .filter(Q::new("is_published", true))?
//!         .order_by(&["-published_at"])?;
//!     Ok(published.alist().await?.len())
//! }
//! ```

use std::ops::Deref;
use std::sync::Arc;

use sea_query::Value;

use crate::database::Database;
use crate::entity::EntityDescriptor;
use crate::error::OrmError;
use crate::model::Record;
use crate::query::queryset::QuerySet;

/// Default manager of one entity.
#[derive(Debug, Clone)]
pub struct Manager {
    base: QuerySet,
}

impl Manager {
    pub(crate) fn new(db: Database, entity: Arc<EntityDescriptor>) -> Self {
        Self {
            base: QuerySet::new(db, entity),
        }
    }

    /// A fresh, unevaluated QuerySet over every row.
    pub fn get_queryset(&self) -> QuerySet {
        self.base.all()
    }

    /// An unsaved record with defaults applied and `values` assigned.
    pub fn build(&self, values: &[(&str, Value)]) -> Result<Record, OrmError> {
        let mut record = Record::new(self.base.entity().clone());
        for (name, value) in values {
            record.set(name, value.clone())?;
        }
        Ok(record)
    }
}

impl Deref for Manager {
    type Target = QuerySet;

    fn deref(&self) -> &QuerySet {
        &self.base
    }
}
