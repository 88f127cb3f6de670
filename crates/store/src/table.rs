//! Persistent table collaborator.
//!
//! Storage backends implement [`Table`]; the write buffer and the request
//! layer only ever talk to this trait.

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;

/// A persisted row with a stable identity.
pub trait Record: Clone + Send + Sync + 'static {
	/// Identity field used to address and coalesce rows.
	type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;

	/// Returns this row's identity.
	fn key(&self) -> Self::Key;

	/// Returns the value of the secondary index `field`, if this row has one.
	fn index(&self, field: &str) -> Option<&str>;
}

/// Key type of a table's records.
pub type Key<T> = <<T as Table>::Record as Record>::Key;

/// Keyed persistent table. Every call may fail independently.
#[async_trait]
pub trait Table: Send + Sync + 'static {
	/// Row type stored in the table.
	type Record: Record;
	/// Backend failure.
	type Error: std::error::Error + Send + Sync + 'static;

	/// Reads one row by key.
	async fn get(&self, key: &Key<Self>) -> Result<Option<Self::Record>, Self::Error>;

	/// Reads many rows. The result is positionally aligned with `keys`.
	async fn bulk_get(&self, keys: &[Key<Self>]) -> Result<Vec<Option<Self::Record>>, Self::Error>;

	/// Reads the first row whose index `field` equals `value`.
	async fn get_by(&self, field: &str, value: &str) -> Result<Option<Self::Record>, Self::Error>;

	/// Reads every row whose index `field` equals `value`, ignoring case.
	async fn find_ignore_case(&self, field: &str, value: &str) -> Result<Vec<Self::Record>, Self::Error>;

	/// Writes rows in one operation, replacing rows with the same key.
	async fn bulk_put(&self, records: Vec<Self::Record>) -> Result<(), Self::Error>;
}

/// Case-insensitive comparison used for [`Table::find_ignore_case`] matches.
pub fn eq_ignore_case(lhs: &str, rhs: &str) -> bool {
	lhs.eq_ignore_ascii_case(rhs) || lhs.to_lowercase() == rhs.to_lowercase()
}
