//! Statement execution with scoped connection use.
//!
//! `fetch_all` and `execute` hold a connection only for the statement;
//! `fetch_chunked` holds it until the stream is exhausted or dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, BoxStream, StreamExt};
use sea_query::Value;

#[cfg(feature = "tracing")]
use tracing::Instrument;

use crate::connection::{Connection, ConnectionSource, RawRow};
use crate::error::OrmError;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Wraps one statement with logging, tracing and metrics.
async fn observe<T>(
    sql: &str,
    fut: impl Future<Output = Result<T, OrmError>>,
) -> Result<T, OrmError> {
    let start = Instant::now();
    #[cfg(feature = "tracing")]
    let result = fut.instrument(tracing_helpers::execute_query_span(sql)).await;
    #[cfg(not(feature = "tracing"))]
    let result = fut.await;
    let elapsed = start.elapsed();
    match &result {
        Ok(_) => {
            log::debug!("{} [{:?}]", sql, elapsed);
            #[cfg(feature = "metrics")]
            METRICS.record_query(elapsed);
        }
        Err(err) => {
            log::debug!("{} failed after {:?}: {}", sql, elapsed, err);
            #[cfg(feature = "metrics")]
            METRICS.record_query_error();
        }
    }
    result
}

/// Run a query on a connection the caller already holds.
pub(crate) async fn query_on(
    conn: &mut dyn Connection,
    sql: &str,
    params: &[Value],
) -> Result<Vec<RawRow>, OrmError> {
    observe(sql, conn.query(sql, params)).await
}

/// Run a statement on a connection the caller already holds.
pub(crate) async fn execute_on(
    conn: &mut dyn Connection,
    sql: &str,
    params: &[Value],
) -> Result<u64, OrmError> {
    observe(sql, conn.execute(sql, params)).await
}

enum ChunkState {
    Pending(Executor, String, Vec<Value>),
    Open(Box<dyn Connection>),
    Done,
}

/// Runs compiled statements against one database alias.
#[derive(Clone)]
pub struct Executor {
    source: Arc<dyn ConnectionSource>,
    alias: String,
}

impl Executor {
    pub fn new(source: Arc<dyn ConnectionSource>, alias: impl Into<String>) -> Self {
        Self {
            source,
            alias: alias.into(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Acquire a connection; dropping it releases it.
    pub async fn acquire(&self) -> Result<Box<dyn Connection>, OrmError> {
        let start = Instant::now();
        let fut = self.source.acquire(&self.alias);
        #[cfg(feature = "tracing")]
        let fut = fut.instrument(tracing_helpers::acquire_connection_span(&self.alias));
        let conn = fut.await;
        #[cfg(feature = "metrics")]
        METRICS.record_connection_wait(start.elapsed());
        if let Err(err) = &conn {
            log::warn!(
                "acquiring a connection for '{}' failed after {:?}: {}",
                self.alias,
                start.elapsed(),
                err
            );
        }
        conn
    }

    /// Every row of a query. The connection is released before returning.
    pub async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<RawRow>, OrmError> {
        let mut conn = self.acquire().await?;
        let rows = query_on(conn.as_mut(), sql, params).await;
        drop(conn);
        rows
    }

    /// At most one row of a query.
    pub async fn fetch_one(&self, sql: &str, params: &[Value]) -> Result<Option<RawRow>, OrmError> {
        let mut conn = self.acquire().await?;
        let row = observe(sql, conn.query_one(sql, params)).await;
        drop(conn);
        row
    }

    /// Affected-row count of a statement.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, OrmError> {
        let mut conn = self.acquire().await?;
        let count = execute_on(conn.as_mut(), sql, params).await;
        drop(conn);
        count
    }

    /// Lazy sequence of row batches of at most `chunk_size` rows.
    ///
    /// Nothing is acquired until the first poll. The connection is released
    /// after the last batch, on the first error, or when the stream is dropped.
    pub fn fetch_chunked(
        &self,
        sql: String,
        params: Vec<Value>,
        chunk_size: usize,
    ) -> BoxStream<'static, Result<Vec<RawRow>, OrmError>> {
        let chunk_size = chunk_size.max(1);
        let state = ChunkState::Pending(self.clone(), sql, params);
        stream::try_unfold(state, move |state| async move {
            let mut conn = match state {
                ChunkState::Done => return Ok(None),
                ChunkState::Open(conn) => conn,
                ChunkState::Pending(exec, sql, params) => {
                    let mut conn = exec.acquire().await?;
                    observe(&sql, conn.open_cursor(&sql, &params)).await?;
                    conn
                }
            };
            let rows = conn.fetch_many(chunk_size).await?;
            if rows.is_empty() {
                return Ok(None);
            }
            let next = if rows.len() < chunk_size {
                drop(conn);
                ChunkState::Done
            } else {
                ChunkState::Open(conn)
            };
            Ok(Some((rows, next)))
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDatabase;

    fn ids(n: i64) -> Vec<Vec<Value>> {
        (1..=n).map(|i| vec![Value::BigInt(Some(i))]).collect()
    }

    #[tokio::test]
    async fn test_fetch_all_releases_connection() {
        let mock = MockDatabase::new();
        mock.push_rows(&["id"], ids(2));
        let executor = Executor::new(Arc::new(mock.clone()), "default");
        let rows = executor.fetch_all("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(mock.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_execute_error_releases_connection() {
        let mock = MockDatabase::new();
        mock.push_error(OrmError::execution("DELETE FROM t", "boom"));
        let executor = Executor::new(Arc::new(mock.clone()), "default");
        assert!(executor.execute("DELETE FROM t", &[]).await.is_err());
        assert_eq!(mock.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_fetch_chunked_batches_and_releases() {
        let mock = MockDatabase::new();
        mock.push_rows(&["id"], ids(5));
        let executor = Executor::new(Arc::new(mock.clone()), "default");
        let stream = executor.fetch_chunked("SELECT id FROM t".into(), Vec::new(), 2);
        assert_eq!(mock.open_connections(), 0);
        let batches: Vec<Vec<RawRow>> = stream
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            batches.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert_eq!(mock.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_dropping_chunked_stream_releases_connection() {
        let mock = MockDatabase::new();
        mock.push_rows(&["id"], ids(10));
        let executor = Executor::new(Arc::new(mock.clone()), "default");
        let mut stream = executor.fetch_chunked("SELECT id FROM t".into(), Vec::new(), 3);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(mock.open_connections(), 1);
        drop(stream);
        assert_eq!(mock.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_acquire_failure_surfaces_connection_error() {
        let mock = MockDatabase::new();
        mock.fail_acquire("no route to host");
        let executor = Executor::new(Arc::new(mock.clone()), "default");
        let err = executor.fetch_all("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, OrmError::ConnectionError(_)));
    }
}
