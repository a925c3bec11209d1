//! In-memory [`ConnectionSource`] with scripted results and a statement log.
//!
//! Each `query`, `execute` or cursor open consumes the next scripted result;
//! an empty script answers with no rows / zero affected. Transaction control
//! statements are logged but never consume results.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sea_query::Value;

use crate::connection::{Connection, ConnectionSource, IsolationLevel, RawRow};
use crate::database::Database;
use crate::entity::Registry;
use crate::error::OrmError;

/// A scripted response.
#[derive(Debug, Clone)]
pub enum MockResult {
    Rows(Vec<RawRow>),
    Affected(u64),
    Error(OrmError),
}

/// A statement the mock received.
#[derive(Debug, Clone, PartialEq)]
pub struct MockStatement {
    pub alias: String,
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<MockResult>,
    log: Vec<MockStatement>,
    open: usize,
    peak_open: usize,
    acquire_error: Option<String>,
    latency: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct MockDatabase {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockDatabase")
            .field("scripted", &state.script.len())
            .field("statements", &state.log.len())
            .field("open", &state.open)
            .finish()
    }
}

/// Rows sharing one set of column labels.
pub fn rows(labels: &[&str], rows: Vec<Vec<Value>>) -> Vec<RawRow> {
    let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
    rows.into_iter()
        .map(|values| RawRow::new(labels.clone(), values))
        .collect()
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A [`Database`] backed by this mock.
    pub fn database(&self, registry: Registry) -> Database {
        Database::new(registry, Arc::new(self.clone()))
    }

    pub fn push(&self, result: MockResult) -> &Self {
        self.lock().script.push_back(result);
        self
    }

    pub fn push_rows(&self, labels: &[&str], values: Vec<Vec<Value>>) -> &Self {
        self.push(MockResult::Rows(rows(labels, values)))
    }

    pub fn push_affected(&self, n: u64) -> &Self {
        self.push(MockResult::Affected(n))
    }

    pub fn push_error(&self, err: OrmError) -> &Self {
        self.push(MockResult::Error(err))
    }

    /// Make every later `acquire` fail with `ConnectionError(msg)`.
    pub fn fail_acquire(&self, msg: impl Into<String>) {
        self.lock().acquire_error = Some(msg.into());
    }

    /// Hold every later `query` / `execute` answer for `latency`. The script
    /// is still consumed in call order.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    pub fn statements(&self) -> Vec<MockStatement> {
        self.lock().log.clone()
    }

    pub fn statement_count(&self) -> usize {
        self.lock().log.len()
    }

    /// SQL text of every logged statement.
    pub fn sql_log(&self) -> Vec<String> {
        self.lock().log.iter().map(|s| s.sql.clone()).collect()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open
    }

    /// Highest number of connections open at the same time.
    pub fn peak_connections(&self) -> usize {
        self.lock().peak_open
    }

    /// Scripted results not yet consumed.
    pub fn remaining(&self) -> usize {
        self.lock().script.len()
    }

    fn record(&self, alias: &str, sql: &str, params: &[Value]) -> Option<MockResult> {
        let mut state = self.lock();
        state.log.push(MockStatement {
            alias: alias.to_string(),
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        state.script.pop_front()
    }

    async fn wait(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ConnectionSource for MockDatabase {
    async fn acquire(&self, alias: &str) -> Result<Box<dyn Connection>, OrmError> {
        let mut state = self.lock();
        if let Some(msg) = &state.acquire_error {
            return Err(OrmError::ConnectionError(msg.clone()));
        }
        state.open += 1;
        state.peak_open = state.peak_open.max(state.open);
        drop(state);
        Ok(Box::new(MockConnection {
            db: self.clone(),
            alias: alias.to_string(),
            cursor: None,
            in_transaction: false,
            row_count: 0,
        }))
    }
}

struct MockConnection {
    db: MockDatabase,
    alias: String,
    cursor: Option<VecDeque<RawRow>>,
    in_transaction: bool,
    row_count: u64,
}

#[async_trait]
impl Connection for MockConnection {
    fn alias(&self) -> &str {
        &self.alias
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, OrmError> {
        let scripted = self.db.record(&self.alias, sql, params);
        self.db.wait().await;
        let affected = match scripted {
            Some(MockResult::Affected(n)) => n,
            Some(MockResult::Rows(rows)) => rows.len() as u64,
            Some(MockResult::Error(err)) => return Err(err),
            None => 0,
        };
        self.row_count = affected;
        Ok(affected)
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<RawRow>, OrmError> {
        let scripted = self.db.record(&self.alias, sql, params);
        self.db.wait().await;
        let rows = match scripted {
            Some(MockResult::Rows(rows)) => rows,
            Some(MockResult::Affected(_)) | None => Vec::new(),
            Some(MockResult::Error(err)) => return Err(err),
        };
        self.row_count = rows.len() as u64;
        Ok(rows)
    }

    async fn open_cursor(&mut self, sql: &str, params: &[Value]) -> Result<(), OrmError> {
        let rows = self.query(sql, params).await?;
        self.cursor = Some(rows.into());
        Ok(())
    }

    async fn fetch_many(&mut self, n: usize) -> Result<Vec<RawRow>, OrmError> {
        let cursor = match self.cursor.as_mut() {
            Some(cursor) => cursor,
            None => return Ok(Vec::new()),
        };
        let take = n.min(cursor.len());
        Ok(cursor.drain(..take).collect())
    }

    fn row_count(&self) -> u64 {
        self.row_count
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), OrmError> {
        self.db.lock().log.push(MockStatement {
            alias: self.alias.clone(),
            sql: isolation.begin_sql(),
            params: Vec::new(),
        });
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), OrmError> {
        self.control("COMMIT");
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), OrmError> {
        self.control("ROLLBACK");
        self.in_transaction = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

impl MockConnection {
    fn control(&self, sql: &str) {
        self.db.lock().log.push(MockStatement {
            alias: self.alias.clone(),
            sql: sql.to_string(),
            params: Vec::new(),
        });
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        let mut state = self.db.lock();
        state.open = state.open.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_is_consumed_in_order() {
        let mock = MockDatabase::new();
        mock.push_affected(3)
            .push_rows(&["id"], vec![vec![Value::BigInt(Some(1))]]);
        let mut conn = mock.acquire("default").await.unwrap();
        assert_eq!(conn.execute("UPDATE x", &[]).await.unwrap(), 3);
        assert_eq!(conn.query("SELECT 1", &[]).await.unwrap().len(), 1);
        assert!(conn.query("SELECT 2", &[]).await.unwrap().is_empty());
        assert_eq!(mock.sql_log(), vec!["UPDATE x", "SELECT 1", "SELECT 2"]);
    }

    #[tokio::test]
    async fn test_open_connection_tracking() {
        let mock = MockDatabase::new();
        let a = mock.acquire("default").await.unwrap();
        let b = mock.acquire("default").await.unwrap();
        assert_eq!(mock.open_connections(), 2);
        drop(a);
        drop(b);
        assert_eq!(mock.open_connections(), 0);
        assert_eq!(mock.peak_connections(), 2);
    }

    #[tokio::test]
    async fn test_cursor_batches() {
        let mock = MockDatabase::new();
        mock.push_rows(
            &["id"],
            (1..=5).map(|i| vec![Value::BigInt(Some(i))]).collect(),
        );
        let mut conn = mock.acquire("default").await.unwrap();
        conn.open_cursor("SELECT id", &[]).await.unwrap();
        assert_eq!(conn.fetch_many(2).await.unwrap().len(), 2);
        assert_eq!(conn.fetch_many(2).await.unwrap().len(), 2);
        assert_eq!(conn.fetch_many(2).await.unwrap().len(), 1);
        assert!(conn.fetch_many(2).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_holds_the_answer() {
        let mock = MockDatabase::new();
        mock.set_latency(Duration::from_secs(5));
        mock.push_affected(1);
        let mut conn = mock.acquire("default").await.unwrap();
        let early = tokio::time::timeout(Duration::from_secs(1), conn.execute("UPDATE x", &[])).await;
        assert!(early.is_err());
        // the first call consumed the script entry before it was cancelled
        assert_eq!(mock.remaining(), 0);
        assert_eq!(mock.statement_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_acquire() {
        let mock = MockDatabase::new();
        mock.fail_acquire("refused");
        let err = mock.acquire("default").await.err().unwrap();
        assert_eq!(err, OrmError::ConnectionError("refused".into()));
    }
}
