//! Relation loading beyond the primary query.
//!
//! select_related is handled by the compiler (joined columns) and the hydrator;
//! this module covers prefetch_related, which issues one batched query per
//! relation path after the primary rows are hydrated.

pub mod prefetch;

pub use prefetch::prefetch_related;
