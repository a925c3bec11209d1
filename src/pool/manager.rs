//! PostgreSQL connection pools, one per database alias.
//!
//! Connections are opened lazily up to `max_connections`. A semaphore bounds
//! checkouts and idle clients wait in a crossbeam queue until reused.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_channel::{bounded, Receiver, Sender};
use tokio::sync::Semaphore;
use tokio_postgres::{Client, NoTls};

use crate::config::{DatabaseConfig, UndertowConfig};
use crate::connection::{Connection, ConnectionSource};
use crate::error::OrmError;
use crate::pool::connection::PgConnection;

pub(crate) struct PoolShared {
    pub(crate) alias: String,
    config: DatabaseConfig,
    permits: Arc<Semaphore>,
    idle_tx: Sender<Client>,
    idle_rx: Receiver<Client>,
    open: AtomicUsize,
}

impl PoolShared {
    pub(crate) fn recycle(&self, client: Client) {
        if self.idle_tx.try_send(client).is_err() {
            self.discard();
        }
    }

    pub(crate) fn discard(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }

    async fn connect(&self) -> Result<Client, OrmError> {
        let (client, connection) = tokio_postgres::connect(&self.config.url, NoTls)
            .await
            .map_err(|e| {
                log::error!("failed to connect '{}': {}", self.alias, e);
                OrmError::ConnectionError(e.to_string())
            })?;
        let alias = self.alias.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::error!("connection of '{}' closed with error: {}", alias, e);
            }
        });
        self.open.fetch_add(1, Ordering::SeqCst);
        log::debug!(
            "opened connection for '{}' ({} open)",
            self.alias,
            self.open.load(Ordering::SeqCst)
        );
        Ok(client)
    }

    fn take_idle(&self) -> Option<Client> {
        while let Ok(client) = self.idle_rx.try_recv() {
            if !client.is_closed() {
                return Some(client);
            }
            self.discard();
        }
        None
    }
}

/// Pool for one database alias.
#[derive(Clone)]
pub struct PgPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for PgPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPool")
            .field("alias", &self.shared.alias)
            .field("max_connections", &self.shared.config.max_connections)
            .field("open", &self.open_connections())
            .finish()
    }
}

impl PgPool {
    /// Build a pool; no connection is opened until the first checkout.
    pub fn new(alias: impl Into<String>, config: DatabaseConfig) -> Self {
        let size = config.max_connections.max(1);
        let (idle_tx, idle_rx) = bounded(size);
        Self {
            shared: Arc::new(PoolShared {
                alias: alias.into(),
                config,
                permits: Arc::new(Semaphore::new(size)),
                idle_tx,
                idle_rx,
                open: AtomicUsize::new(0),
            }),
        }
    }

    pub fn alias(&self) -> &str {
        &self.shared.alias
    }

    /// Connections currently open, checked out or idle.
    pub fn open_connections(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn idle_connections(&self) -> usize {
        self.shared.idle_rx.len()
    }

    /// Check out a connection, waiting up to `pool_timeout_seconds` for a free slot.
    pub async fn checkout(&self) -> Result<PgConnection, OrmError> {
        let timeout = Duration::from_secs(self.shared.config.pool_timeout_seconds);
        let permit = tokio::time::timeout(timeout, self.shared.permits.clone().acquire_owned())
            .await
            .map_err(|_| {
                OrmError::ConnectionError(format!(
                    "timed out after {:?} waiting for a connection to '{}'",
                    timeout, self.shared.alias
                ))
            })?
            .map_err(|_| OrmError::ConnectionError("pool is closed".into()))?;
        let client = match self.shared.take_idle() {
            Some(client) => client,
            None => self.shared.connect().await?,
        };
        Ok(PgConnection::new(client, self.shared.clone(), permit))
    }
}

#[async_trait]
impl ConnectionSource for PgPool {
    async fn acquire(&self, alias: &str) -> Result<Box<dyn Connection>, OrmError> {
        if alias != self.shared.alias {
            return Err(OrmError::ConnectionError(format!(
                "pool '{}' cannot serve alias '{}'",
                self.shared.alias, alias
            )));
        }
        Ok(Box::new(self.checkout().await?))
    }
}

/// Pools for every configured alias.
#[derive(Debug, Clone, Default)]
pub struct PgPools {
    pools: BTreeMap<String, PgPool>,
}

impl PgPools {
    pub fn from_config(config: &UndertowConfig) -> Self {
        let pools = config
            .aliases()
            .into_iter()
            .map(|(alias, db)| (alias.clone(), PgPool::new(alias, db)))
            .collect();
        Self { pools }
    }

    pub fn insert(&mut self, pool: PgPool) {
        self.pools.insert(pool.alias().to_string(), pool);
    }

    pub fn get(&self, alias: &str) -> Option<&PgPool> {
        self.pools.get(alias)
    }
}

#[async_trait]
impl ConnectionSource for PgPools {
    async fn acquire(&self, alias: &str) -> Result<Box<dyn Connection>, OrmError> {
        let pool = self
            .pools
            .get(alias)
            .ok_or_else(|| OrmError::ConnectionError(format!("unknown database alias '{}'", alias)))?;
        Ok(Box::new(pool.checkout().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pools_follow_config_aliases() {
        let cfg = UndertowConfig::from_toml_str(
            r#"
            [databases.replica]
            url = "postgres://localhost/replica"
            max_connections = 2
            "#,
        )
        .unwrap();
        let pools = PgPools::from_config(&cfg);
        assert!(pools.get("default").is_some());
        assert_eq!(pools.get("replica").unwrap().alias(), "replica");
        assert_eq!(pools.get("replica").unwrap().open_connections(), 0);
    }

    #[tokio::test]
    async fn test_unknown_alias_is_connection_error() {
        let pools = PgPools::from_config(&UndertowConfig::default());
        let err = pools.acquire("analytics").await.err().unwrap();
        assert!(matches!(err, OrmError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn test_checkout_times_out_when_exhausted() {
        let pool = PgPool::new(
            "default",
            DatabaseConfig {
                url: "postgres://127.0.0.1:1/none".into(),
                max_connections: 1,
                pool_timeout_seconds: 0,
            },
        );
        let _held = pool.shared.permits.clone().acquire_owned().await.unwrap();
        let err = pool.checkout().await.err().unwrap();
        assert!(matches!(err, OrmError::ConnectionError(msg) if msg.contains("timed out")));
    }
}
