//! Connection pooling on `tokio-postgres`.

pub mod config;
mod connection;
mod decode;
mod manager;
mod params;

pub use connection::PgConnection;
pub use manager::{PgPool, PgPools};
