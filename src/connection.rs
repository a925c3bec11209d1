//! Connection capability: where statements run.
//!
//! A [`ConnectionSource`] hands out boxed [`Connection`]s per database alias.
//! Dropping the box releases the connection; a connection dropped while a
//! transaction is open is discarded instead of recycled.

use async_trait::async_trait;
use sea_query::Value;

use crate::error::OrmError;

/// One result row: values in SELECT order plus their column labels.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub labels: Vec<String>,
    pub values: Vec<Value>,
}

impl RawRow {
    pub fn new(labels: Vec<String>, values: Vec<Value>) -> Self {
        Self { labels, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&Value> {
        self.values.get(position)
    }

    pub fn get_by_label(&self, label: &str) -> Option<&Value> {
        self.labels
            .iter()
            .position(|l| l == label)
            .and_then(|i| self.values.get(i))
    }
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read uncommitted (PostgreSQL treats it as ReadCommitted)
    ReadUncommitted,
    /// Read committed (default)
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn to_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// `BEGIN ISOLATION LEVEL ...`
    pub fn begin_sql(self) -> String {
        format!("BEGIN ISOLATION LEVEL {}", self.to_sql())
    }
}

/// A live database session.
#[async_trait]
pub trait Connection: Send {
    /// Database alias this connection belongs to.
    fn alias(&self) -> &str;

    /// Run a statement, returning the affected-row count.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, OrmError>;

    /// Run a query and fetch every row.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<RawRow>, OrmError>;

    /// Run a query and fetch at most one row.
    async fn query_one(&mut self, sql: &str, params: &[Value]) -> Result<Option<RawRow>, OrmError> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Start a query whose rows are pulled with [`Connection::fetch_many`].
    async fn open_cursor(&mut self, sql: &str, params: &[Value]) -> Result<(), OrmError>;

    /// Next batch of at most `n` rows from the open cursor; empty once exhausted.
    async fn fetch_many(&mut self, n: usize) -> Result<Vec<RawRow>, OrmError>;

    /// Rows affected by the last `execute`.
    fn row_count(&self) -> u64;

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), OrmError>;

    async fn commit(&mut self) -> Result<(), OrmError>;

    async fn rollback(&mut self) -> Result<(), OrmError>;

    fn in_transaction(&self) -> bool;
}

/// Hands out connections by database alias.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Acquire a connection for `alias`. Unknown aliases fail with `ConnectionError`.
    async fn acquire(&self, alias: &str) -> Result<Box<dyn Connection>, OrmError>;
}

/// Transaction scope over an owned connection.
///
/// Dropping it without [`Transaction::commit`] leaves the connection inside the
/// open transaction, so the pool discards it and the server rolls back.
pub struct Transaction {
    conn: Option<Box<dyn Connection>>,
}

impl Transaction {
    pub async fn begin(
        mut conn: Box<dyn Connection>,
        isolation: IsolationLevel,
    ) -> Result<Self, OrmError> {
        conn.begin(isolation).await?;
        Ok(Self { conn: Some(conn) })
    }

    pub fn connection(&mut self) -> Result<&mut (dyn Connection + 'static), OrmError> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| OrmError::ConnectionError("transaction already finished".into()))
    }

    /// Commit and hand the connection back.
    pub async fn commit(mut self) -> Result<Box<dyn Connection>, OrmError> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| OrmError::ConnectionError("transaction already finished".into()))?;
        conn.commit().await?;
        Ok(conn)
    }

    /// Roll back and hand the connection back.
    pub async fn rollback(mut self) -> Result<Box<dyn Connection>, OrmError> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| OrmError::ConnectionError("transaction already finished".into()))?;
        conn.rollback().await?;
        Ok(conn)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(conn) = &self.conn {
            if conn.in_transaction() {
                log::warn!(
                    "transaction on '{}' dropped without commit; connection discarded",
                    conn.alias()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_sql() {
        assert_eq!(
            IsolationLevel::default().begin_sql(),
            "BEGIN ISOLATION LEVEL READ COMMITTED"
        );
        assert_eq!(IsolationLevel::Serializable.to_sql(), "SERIALIZABLE");
    }

    #[test]
    fn test_raw_row_label_lookup() {
        let row = RawRow::new(
            vec!["id".into(), "name".into()],
            vec![Value::BigInt(Some(1)), Value::from("Ada")],
        );
        assert_eq!(row.get_by_label("name"), Some(&Value::from("Ada")));
        assert_eq!(row.get_by_label("missing"), None);
        assert_eq!(row.len(), 2);
    }
}
