//! In-memory [`Table`] with failure injection and call recording.
//!
//! Only built for tests and with the `test-util` feature.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use thiserror::Error;

use crate::table::{Record, Table, eq_ignore_case};

/// Failure reported by [`MemoryTable`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryTableError {
	#[error("injected write failure")]
	InjectedWrite,
}

struct MemoryInner<R: Record> {
	rows: Mutex<IndexMap<R::Key, R>>,
	failing_puts: AtomicUsize,
	put_attempts: AtomicUsize,
	put_latency: Mutex<Duration>,
	put_batches: Mutex<Vec<Vec<R::Key>>>,
	bulk_get_requests: Mutex<Vec<Vec<R::Key>>>,
}

/// Table backed by an insertion-ordered map.
///
/// Clones share the same rows. Writes can be delayed with [`Self::set_put_latency`]
/// or failed with [`Self::fail_next_puts`]; successful write batches and
/// `bulk_get` key sets are recorded for inspection.
pub struct MemoryTable<R: Record> {
	inner: Arc<MemoryInner<R>>,
}

impl<R: Record> Clone for MemoryTable<R> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<R: Record> Default for MemoryTable<R> {
	fn default() -> Self {
		Self::new()
	}
}

impl<R: Record> std::fmt::Debug for MemoryTable<R> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MemoryTable").field("rows", &self.len()).finish_non_exhaustive()
	}
}

impl<R: Record> MemoryTable<R> {
	/// Creates an empty table.
	pub fn new() -> Self {
		Self {
			inner: Arc::new(MemoryInner {
				rows: Mutex::new(IndexMap::new()),
				failing_puts: AtomicUsize::new(0),
				put_attempts: AtomicUsize::new(0),
				put_latency: Mutex::new(Duration::ZERO),
				put_batches: Mutex::new(Vec::new()),
				bulk_get_requests: Mutex::new(Vec::new()),
			}),
		}
	}

	/// Creates a table pre-populated with `rows`.
	pub fn with_rows(rows: impl IntoIterator<Item = R>) -> Self {
		let table = Self::new();
		table.inner.rows.lock().extend(rows.into_iter().map(|row| (row.key(), row)));
		table
	}

	/// Makes the next `count` calls to `bulk_put` fail without writing.
	pub fn fail_next_puts(&self, count: usize) {
		self.inner.failing_puts.store(count, Ordering::SeqCst);
	}

	/// Delays every `bulk_put` by `latency` before it writes.
	pub fn set_put_latency(&self, latency: Duration) {
		*self.inner.put_latency.lock() = latency;
	}

	/// Reads a stored row without recording a call.
	pub fn row(&self, key: &R::Key) -> Option<R> {
		self.inner.rows.lock().get(key).cloned()
	}

	/// Number of stored rows.
	pub fn len(&self) -> usize {
		self.inner.rows.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Number of `bulk_put` calls, failed ones included.
	pub fn put_attempts(&self) -> usize {
		self.inner.put_attempts.load(Ordering::SeqCst)
	}

	/// Keys of every successful `bulk_put`, in call order.
	pub fn put_batches(&self) -> Vec<Vec<R::Key>> {
		self.inner.put_batches.lock().clone()
	}

	/// Keys requested by every `bulk_get`, in call order.
	pub fn bulk_get_requests(&self) -> Vec<Vec<R::Key>> {
		self.inner.bulk_get_requests.lock().clone()
	}
}

#[async_trait]
impl<R: Record> Table for MemoryTable<R> {
	type Record = R;
	type Error = MemoryTableError;

	async fn get(&self, key: &R::Key) -> Result<Option<R>, MemoryTableError> {
		Ok(self.row(key))
	}

	async fn bulk_get(&self, keys: &[R::Key]) -> Result<Vec<Option<R>>, MemoryTableError> {
		self.inner.bulk_get_requests.lock().push(keys.to_vec());
		let rows = self.inner.rows.lock();
		Ok(keys.iter().map(|key| rows.get(key).cloned()).collect())
	}

	async fn get_by(&self, field: &str, value: &str) -> Result<Option<R>, MemoryTableError> {
		let rows = self.inner.rows.lock();
		Ok(rows.values().find(|row| row.index(field) == Some(value)).cloned())
	}

	async fn find_ignore_case(&self, field: &str, value: &str) -> Result<Vec<R>, MemoryTableError> {
		let rows = self.inner.rows.lock();
		Ok(rows
			.values()
			.filter(|row| row.index(field).is_some_and(|indexed| eq_ignore_case(indexed, value)))
			.cloned()
			.collect())
	}

	async fn bulk_put(&self, records: Vec<R>) -> Result<(), MemoryTableError> {
		self.inner.put_attempts.fetch_add(1, Ordering::SeqCst);
		let latency = *self.inner.put_latency.lock();
		if !latency.is_zero() {
			tokio::time::sleep(latency).await;
		}

		let injected = self
			.inner
			.failing_puts
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
			.is_ok();
		if injected {
			return Err(MemoryTableError::InjectedWrite);
		}

		let keys: Vec<R::Key> = records.iter().map(Record::key).collect();
		self.inner.rows.lock().extend(records.into_iter().map(|row| (row.key(), row)));
		self.inner.put_batches.lock().push(keys);
		Ok(())
	}
}
