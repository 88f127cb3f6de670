//! Error types for the store primitives.

use thiserror::Error;

/// Errors surfaced by [`crate::WriteBuffer`].
#[derive(Debug, Error)]
pub enum StoreError<E>
where
	E: std::error::Error + 'static,
{
	/// The underlying table rejected the operation.
	#[error("table operation failed: {0}")]
	Table(#[source] E),

	/// The buffer was shut down and accepts no further writes.
	#[error("write buffer is shut down")]
	Closed,
}
