//! Error taxonomy for query building and execution.
//!
//! Every failure surfaces to the caller as an [`OrmError`]. Build-time problems
//! (bad lookups, negative slices, conflicting projections) are reported as
//! [`OrmError::InvalidQueryError`] before any I/O happens.

use std::fmt;

use crate::value::ValueExtractionError;

/// SQLSTATE reported by PostgreSQL for unique constraint violations.
pub const UNIQUE_VIOLATION: &str = "23505";

/// Errors produced by the query pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum OrmError {
    /// `get` matched no rows.
    DoesNotExist { entity: String },
    /// `get` matched more than one row. `found` is the over-fetch count, so 2 means "2 or more".
    MultipleObjectsReturned { entity: String, found: usize },
    /// A connection could not be acquired.
    ConnectionError(String),
    /// The backend rejected a statement.
    QueryExecutionError { sql: String, detail: String },
    /// Malformed chain usage detected before execution.
    InvalidQueryError(String),
    /// A row could not be turned into a record.
    HydrationError(String),
}

impl OrmError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        OrmError::InvalidQueryError(msg.into())
    }

    pub(crate) fn execution(sql: impl Into<String>, detail: impl Into<String>) -> Self {
        OrmError::QueryExecutionError {
            sql: sql.into(),
            detail: detail.into(),
        }
    }

    /// True when the backend reported a unique constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            OrmError::QueryExecutionError { detail, .. } => detail.contains(UNIQUE_VIOLATION),
            _ => false,
        }
    }
}

impl fmt::Display for OrmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrmError::DoesNotExist { entity } => {
                write!(f, "{} matching query does not exist", entity)
            }
            OrmError::MultipleObjectsReturned { entity, found } => write!(
                f,
                "get() returned more than one {} (it returned {}{})",
                entity,
                if *found >= 2 { "at least " } else { "" },
                found
            ),
            OrmError::ConnectionError(msg) => write!(f, "Connection error: {}", msg),
            OrmError::QueryExecutionError { sql, detail } => {
                write!(f, "Query execution error: {} (SQL: {})", detail, sql)
            }
            OrmError::InvalidQueryError(msg) => write!(f, "Invalid query: {}", msg),
            OrmError::HydrationError(msg) => write!(f, "Hydration error: {}", msg),
        }
    }
}

impl std::error::Error for OrmError {}

impl From<ValueExtractionError> for OrmError {
    fn from(err: ValueExtractionError) -> Self {
        OrmError::HydrationError(err.to_string())
    }
}

impl From<sea_query::error::Error> for OrmError {
    fn from(err: sea_query::error::Error) -> Self {
        OrmError::InvalidQueryError(err.to_string())
    }
}

/// Render a backend error with its SQLSTATE so callers can classify it.
pub(crate) fn describe_pg_error(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => format!("{} [SQLSTATE {}]", db.message(), db.code().code()),
        None => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_does_not_exist() {
        let err = OrmError::DoesNotExist {
            entity: "article".to_string(),
        };
        assert_eq!(err.to_string(), "article matching query does not exist");
    }

    #[test]
    fn test_display_multiple_objects() {
        let err = OrmError::MultipleObjectsReturned {
            entity: "article".to_string(),
            found: 2,
        };
        assert_eq!(
            err.to_string(),
            "get() returned more than one article (it returned at least 2)"
        );
    }

    #[test]
    fn test_unique_violation_detection() {
        let err = OrmError::execution(
            "INSERT INTO \"author\"",
            "duplicate key value violates unique constraint [SQLSTATE 23505]",
        );
        assert!(err.is_unique_violation());
        assert!(!OrmError::ConnectionError("23505".into()).is_unique_violation());
    }

    #[test]
    fn test_value_extraction_converts_to_hydration_error() {
        let err: OrmError = ValueExtractionError::NullValue.into();
        assert!(matches!(err, OrmError::HydrationError(_)));
    }
}
