//! A pooled `tokio_postgres::Client` implementing [`Connection`].

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use postgres_types::ToSql;
use sea_query::Value;
use tokio::sync::OwnedSemaphorePermit;
use tokio_postgres::{Client, RowStream};

use crate::connection::{Connection, IsolationLevel, RawRow};
use crate::error::{describe_pg_error, OrmError};
use crate::pool::decode::raw_row;
use crate::pool::manager::PoolShared;
use crate::pool::params::SqlParam;

/// Checked-out connection. Dropping it hands the client back to the idle
/// queue unless it is closed or still inside a transaction.
pub struct PgConnection {
    client: Option<Client>,
    shared: Arc<PoolShared>,
    cursor: Option<Pin<Box<RowStream>>>,
    in_transaction: bool,
    row_count: u64,
    _permit: OwnedSemaphorePermit,
}

impl PgConnection {
    pub(crate) fn new(client: Client, shared: Arc<PoolShared>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            client: Some(client),
            shared,
            cursor: None,
            in_transaction: false,
            row_count: 0,
            _permit: permit,
        }
    }

    fn client(&self) -> Result<&Client, OrmError> {
        self.client
            .as_ref()
            .ok_or_else(|| OrmError::ConnectionError("connection already released".into()))
    }

    async fn batch(&mut self, sql: &str) -> Result<(), OrmError> {
        self.client()?
            .batch_execute(sql)
            .await
            .map_err(|e| OrmError::execution(sql, describe_pg_error(&e)))
    }
}

fn bind(params: &[Value]) -> Vec<SqlParam<'_>> {
    params.iter().map(SqlParam).collect()
}

#[async_trait]
impl Connection for PgConnection {
    fn alias(&self) -> &str {
        &self.shared.alias
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, OrmError> {
        let bound = bind(params);
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let affected = self
            .client()?
            .execute(sql, &refs)
            .await
            .map_err(|e| OrmError::execution(sql, describe_pg_error(&e)))?;
        self.row_count = affected;
        Ok(affected)
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<RawRow>, OrmError> {
        let bound = bind(params);
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = self
            .client()?
            .query(sql, &refs)
            .await
            .map_err(|e| OrmError::execution(sql, describe_pg_error(&e)))?;
        self.row_count = rows.len() as u64;
        rows.iter().map(raw_row).collect()
    }

    async fn open_cursor(&mut self, sql: &str, params: &[Value]) -> Result<(), OrmError> {
        let stream = self
            .client()?
            .query_raw(sql, params.iter().map(SqlParam))
            .await
            .map_err(|e| OrmError::execution(sql, describe_pg_error(&e)))?;
        self.cursor = Some(Box::pin(stream));
        Ok(())
    }

    async fn fetch_many(&mut self, n: usize) -> Result<Vec<RawRow>, OrmError> {
        let mut out = Vec::with_capacity(n);
        let mut exhausted = false;
        if let Some(stream) = self.cursor.as_mut() {
            while out.len() < n {
                match stream.next().await {
                    Some(Ok(row)) => out.push(raw_row(&row)?),
                    Some(Err(e)) => {
                        return Err(OrmError::execution("<cursor>", describe_pg_error(&e)));
                    }
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }
        }
        if exhausted {
            self.cursor = None;
        }
        Ok(out)
    }

    fn row_count(&self) -> u64 {
        self.row_count
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), OrmError> {
        self.batch(&isolation.begin_sql()).await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), OrmError> {
        self.batch("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), OrmError> {
        self.batch("ROLLBACK").await?;
        self.in_transaction = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.cursor = None;
        if let Some(client) = self.client.take() {
            if self.in_transaction || client.is_closed() {
                log::debug!("discarding connection of '{}'", self.shared.alias);
                self.shared.discard();
            } else {
                self.shared.recycle(client);
            }
        }
    }
}
