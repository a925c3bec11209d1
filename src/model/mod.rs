//! Entity instances (`Record`) and their persistence.

mod persist;
mod record;

pub use record::{FromRecord, Record, RecordState, Related};

pub(crate) use persist::{insert_on, update_on};
