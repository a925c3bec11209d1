//! Configuration utilities re-exported at the crate root.
//!
//! This exposes [`UndertowConfig`] so applications can load settings
//! from `config/config.toml` or `UNDERTOW__*` environment variables using
//! `UndertowConfig::load()`.

pub use crate::pool::config::*;
