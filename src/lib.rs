//! # Undertow
//!
//! Async query execution for PostgreSQL on tokio: chainable, immutable
//! QuerySets compiled to parameterized SQL, executed with scoped connection
//! use, and hydrated into records with eager relation loading.
//!
//! ```no_run
//! use undertow::{Database, Q, UndertowConfig};
//! # fn registry() -> undertow::Registry { unimplemented!() }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = UndertowConfig::load()?;
//! let db = Database::from_config(registry(), &config);
//! let recent = db
//!     .objects("article")?
//!     .filter(Q::new("author__name", "Ada"))?
//!     .order_by(&["-published_at"])?
//!     .slice(0, Some(10))?;
//! for article in recent.alist().await? {
//!     println!("{}", article.to_json());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod database;
pub mod entity;
pub mod error;
pub mod executor;
pub mod hydrate;
pub mod metrics;
pub mod mock;
pub mod model;
pub mod pool;
pub mod query;
pub mod relation;
pub mod value;

#[doc(hidden)]
pub mod tests_cfg;

pub use config::{DatabaseConfig, QueryConfig, UndertowConfig, DEFAULT_DB_ALIAS};
pub use connection::{Connection, ConnectionSource, IsolationLevel, RawRow, Transaction};
pub use database::Database;
pub use entity::{Entity, EntityBuilder, EntityDescriptor, FieldDescriptor, FieldType, Registry};
pub use error::OrmError;
pub use executor::Executor;
pub use hydrate::ValuesRow;
pub use model::{FromRecord, Record, RecordState, Related};
pub use pool::{PgPool, PgPools};
pub use query::{Aggregate, BulkCreateOptions, Manager, OnConflict, QuerySet, Q};
pub use value::{TryGetable, ValueExtractionError, ValueKey};

pub use sea_query::Value;
