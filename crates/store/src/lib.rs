//! Keyed persistence primitives: single-flight fetch deduplication and a
//! write-coalescing buffer in front of an async [`Table`].

pub mod dedup;
mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod table;
pub mod write_buffer;

#[cfg(test)]
mod fixtures;

pub use dedup::RequestDeduplicator;
pub use error::StoreError;
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryTable, MemoryTableError};
pub use table::{Key, Record, Table, eq_ignore_case};
pub use write_buffer::{WriteBuffer, WriteBufferOptions};
