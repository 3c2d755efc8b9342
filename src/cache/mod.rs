//! Local persistence for activity streams.
//!
//! This module provides:
//! - A payload codec that flattens timestamps before storage
//! - An SQLite store holding activities, note threads and subject links
//! - The in-memory working set served to readers

mod codec;
mod storage;
mod working_set;

pub use codec::{normalize, CodecError, Payload};
pub use storage::{ActivityStorage, NoopStorage, SqliteStorage};
#[cfg(test)]
pub use storage::StoredStream;
pub use working_set::WorkingSet;
