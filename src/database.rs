//! The `Database` handle: entity registry, connection source and query settings.

use std::sync::Arc;

#[cfg(feature = "tracing")]
use tracing::Instrument;

use crate::config::{QueryConfig, UndertowConfig, DEFAULT_DB_ALIAS};
use crate::connection::{ConnectionSource, IsolationLevel, Transaction};
use crate::entity::{Entity, Registry};
use crate::error::OrmError;
use crate::executor::Executor;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
use crate::pool::PgPools;
use crate::query::manager::Manager;

struct DatabaseInner {
    registry: Registry,
    source: Arc<dyn ConnectionSource>,
    settings: QueryConfig,
}

/// Cheap to clone; every clone shares the same registry and connection source.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("entities", &self.inner.registry.names().collect::<Vec<_>>())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl Database {
    pub fn new(registry: Registry, source: Arc<dyn ConnectionSource>) -> Self {
        Self::with_settings(registry, source, QueryConfig::default())
    }

    pub fn with_settings(
        registry: Registry,
        source: Arc<dyn ConnectionSource>,
        settings: QueryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                registry,
                source,
                settings,
            }),
        }
    }

    /// PostgreSQL pools for every configured alias. Connections open lazily.
    pub fn from_config(registry: Registry, config: &UndertowConfig) -> Self {
        Self::with_settings(registry, Arc::new(PgPools::from_config(config)), config.query)
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &QueryConfig {
        &self.inner.settings
    }

    pub fn source(&self) -> &Arc<dyn ConnectionSource> {
        &self.inner.source
    }

    /// Executor bound to `alias`.
    pub fn executor(&self, alias: &str) -> Executor {
        Executor::new(self.inner.source.clone(), alias)
    }

    /// The default manager of an entity, by registry name.
    pub fn objects(&self, entity: &str) -> Result<Manager, OrmError> {
        let descriptor = self.inner.registry.get(entity)?.clone();
        Ok(Manager::new(self.clone(), descriptor))
    }

    /// The default manager of `E`.
    pub fn manager<E: Entity>(&self) -> Result<Manager, OrmError> {
        self.objects(E::NAME)
    }

    /// Begin a transaction on a fresh connection of `alias`.
    pub async fn transaction(
        &self,
        alias: &str,
        isolation: IsolationLevel,
    ) -> Result<Transaction, OrmError> {
        let conn = self.executor(alias).acquire().await?;
        let fut = Transaction::begin(conn, isolation);
        #[cfg(feature = "tracing")]
        let fut = fut.instrument(tracing_helpers::transaction_span(alias));
        fut.await
    }

    /// Begin a READ COMMITTED transaction on the default alias.
    pub async fn begin(&self) -> Result<Transaction, OrmError> {
        self.transaction(DEFAULT_DB_ALIAS, IsolationLevel::ReadCommitted)
            .await
    }
}
