//! Query building, compilation and the QuerySet facade.
//!
//! - **`filter`** - lookup predicates (`Q`)
//! - **`spec`** - the immutable query description
//! - **`resolve`** - lookup path validation and join planning
//! - **`compiler`** / **`mutation`** - SQL generation
//! - **`queryset`** / **`manager`** - the public chain-and-terminal API

pub mod aggregate;
pub mod compiler;
pub mod dialect;
pub mod filter;
pub mod manager;
pub mod mutation;
pub mod queryset;
pub(crate) mod resolve;
pub mod spec;

#[doc(inline)]
pub use aggregate::{Aggregate, AggregateFunc};
#[doc(inline)]
pub use compiler::{compile_select, ColumnPlan, CompiledQuery};
#[doc(inline)]
pub use filter::{FilterNode, Lookup, Q};
#[doc(inline)]
pub use manager::Manager;
#[doc(inline)]
pub use mutation::OnConflict;
#[doc(inline)]
pub use queryset::{BulkCreateOptions, QuerySet};
#[doc(inline)]
pub use spec::{Loading, OrderTerm, Projection, QuerySpec};
