//! Write-coalescing front for a [`Table`].
//!
//! Writes land in an insertion-ordered buffer keyed by record identity and are
//! persisted in chunks by a delayed flush. Reads consult the buffer before the
//! table, so a buffered write is visible immediately.
//!
//! # Flush cycle
//!
//! ```text
//!         put                 timer fires              chunk persisted
//!   Idle ─────▶ Armed(initial) ───────────▶ Flushing ──────────────────▶ Idle
//!                  ▲                           │ entries remain / failure
//!                  └──── Armed(subsequent) ◀───┘
//! ```
//!
//! An entry leaves the buffer only if it was not overwritten while its chunk
//! was being persisted; every write bumps a per-entry sequence number.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use waymark_worker::{Scheduler, TaskClass, TimerSlot, TokioScheduler, spawn};

use crate::error::StoreError;
use crate::table::{Key, Record, Table, eq_ignore_case};

/// Flush timing and chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBufferOptions {
	initial_delay: Duration,
	subsequent_delay: Duration,
	chunk_size: usize,
}

impl Default for WriteBufferOptions {
	fn default() -> Self {
		Self {
			initial_delay: Duration::from_millis(1_000),
			subsequent_delay: Duration::from_millis(100),
			chunk_size: 100,
		}
	}
}

impl WriteBufferOptions {
	/// Delay between the first buffered write and the flush that persists it.
	#[must_use]
	pub fn initial_delay(mut self, delay: Duration) -> Self {
		self.initial_delay = delay;
		self
	}

	/// Delay before the next flush when entries remain after a flush.
	#[must_use]
	pub fn subsequent_delay(mut self, delay: Duration) -> Self {
		self.subsequent_delay = delay;
		self
	}

	/// Maximum number of entries persisted per flush.
	///
	/// # Panics
	///
	/// Panics if `size` is zero.
	#[must_use]
	pub fn chunk_size(mut self, size: usize) -> Self {
		assert!(size > 0, "chunk_size must be > 0");
		self.chunk_size = size;
		self
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushPhase {
	Idle,
	Armed,
	Flushing,
}

struct Entry<R> {
	record: R,
	seq: u64,
}

struct BufferState<R: Record> {
	entries: IndexMap<R::Key, Entry<R>>,
	next_seq: u64,
	phase: FlushPhase,
	timer: TimerSlot,
	closed: bool,
}

struct Inner<T: Table> {
	table: T,
	scheduler: Arc<dyn Scheduler>,
	options: WriteBufferOptions,
	state: Mutex<BufferState<T::Record>>,
	/// Serializes flushes; held across the table write.
	flush_lock: tokio::sync::Mutex<()>,
}

impl<T: Table> Drop for Inner<T> {
	fn drop(&mut self) {
		let pending = self.state.get_mut().entries.len();
		if pending > 0 {
			tracing::warn!(pending, "store.dropped_unflushed");
		}
	}
}

/// Buffers writes to a [`Table`] and persists them in delayed chunks.
///
/// Cloning yields another handle to the same buffer. Dropping the last handle
/// cancels the flush timer; call [`Self::shutdown`] first to persist what is
/// still buffered.
pub struct WriteBuffer<T: Table> {
	inner: Arc<Inner<T>>,
}

impl<T: Table> Clone for WriteBuffer<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T: Table> std::fmt::Debug for WriteBuffer<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.inner.state.lock();
		f.debug_struct("WriteBuffer")
			.field("pending", &state.entries.len())
			.field("phase", &state.phase)
			.field("closed", &state.closed)
			.finish_non_exhaustive()
	}
}

impl<T: Table> WriteBuffer<T> {
	/// Creates a buffer in front of `table`, flushing on the tokio timer.
	pub fn new(table: T, options: WriteBufferOptions) -> Self {
		Self::with_scheduler(table, options, Arc::new(TokioScheduler))
	}

	/// Creates a buffer whose flush timer runs on `scheduler`.
	pub fn with_scheduler(table: T, options: WriteBufferOptions, scheduler: Arc<dyn Scheduler>) -> Self {
		Self {
			inner: Arc::new(Inner {
				table,
				scheduler,
				options,
				state: Mutex::new(BufferState {
					entries: IndexMap::new(),
					next_seq: 0,
					phase: FlushPhase::Idle,
					timer: TimerSlot::new(),
					closed: false,
				}),
				flush_lock: tokio::sync::Mutex::new(()),
			}),
		}
	}

	/// Buffers one record, replacing any buffered record with the same key.
	pub fn put(&self, record: T::Record) -> Result<(), StoreError<T::Error>> {
		self.bulk_put([record])
	}

	/// Buffers records in order; later records win over earlier ones with the same key.
	pub fn bulk_put(&self, records: impl IntoIterator<Item = T::Record>) -> Result<(), StoreError<T::Error>> {
		let mut state = self.inner.state.lock();
		if state.closed {
			return Err(StoreError::Closed);
		}
		for record in records {
			state.next_seq += 1;
			let seq = state.next_seq;
			state.entries.insert(record.key(), Entry { record, seq });
		}
		if state.phase == FlushPhase::Idle && !state.entries.is_empty() {
			arm(&self.inner, &mut state, self.inner.options.initial_delay);
		}
		Ok(())
	}

	/// Reads one record, preferring the buffered version.
	pub async fn get(&self, key: &Key<T>) -> Result<Option<T::Record>, StoreError<T::Error>> {
		if let Some(entry) = self.inner.state.lock().entries.get(key) {
			return Ok(Some(entry.record.clone()));
		}
		self.inner.table.get(key).await.map_err(StoreError::Table)
	}

	/// Reads many records, positionally aligned with `keys`.
	///
	/// Only keys missing from the buffer are read from the table, in one call.
	pub async fn bulk_get(&self, keys: &[Key<T>]) -> Result<Vec<Option<T::Record>>, StoreError<T::Error>> {
		let mut found = Vec::with_capacity(keys.len());
		let mut missing = Vec::new();
		{
			let state = self.inner.state.lock();
			for (slot, key) in keys.iter().enumerate() {
				match state.entries.get(key) {
					Some(entry) => found.push(Some(entry.record.clone())),
					None => {
						found.push(None);
						missing.push((slot, key.clone()));
					}
				}
			}
		}
		if missing.is_empty() {
			return Ok(found);
		}

		let missing_keys: Vec<Key<T>> = missing.iter().map(|(_, key)| key.clone()).collect();
		let rows = self.inner.table.bulk_get(&missing_keys).await.map_err(StoreError::Table)?;
		for ((slot, _), row) in missing.into_iter().zip(rows) {
			found[slot] = row;
		}
		Ok(found)
	}

	/// Reads the first record whose index `field` equals `value`.
	///
	/// A table row whose key is buffered is shadowed by the buffered record,
	/// even when the buffered record no longer matches.
	pub async fn get_by(&self, field: &str, value: &str) -> Result<Option<T::Record>, StoreError<T::Error>> {
		{
			let state = self.inner.state.lock();
			let buffered = state.entries.values().find(|entry| entry.record.index(field) == Some(value));
			if let Some(entry) = buffered {
				return Ok(Some(entry.record.clone()));
			}
		}
		let row = self.inner.table.get_by(field, value).await.map_err(StoreError::Table)?;
		Ok(row.filter(|row| !self.is_buffered(&row.key())))
	}

	/// Case-insensitive index search. Buffered matches come first.
	pub async fn find_ignore_case(&self, field: &str, value: &str) -> Result<Vec<T::Record>, StoreError<T::Error>> {
		let (mut matches, shadowed) = {
			let state = self.inner.state.lock();
			let matches: Vec<T::Record> = state
				.entries
				.values()
				.filter(|entry| entry.record.index(field).is_some_and(|indexed| eq_ignore_case(indexed, value)))
				.map(|entry| entry.record.clone())
				.collect();
			let shadowed: HashSet<Key<T>> = state.entries.keys().cloned().collect();
			(matches, shadowed)
		};
		let rows = self.inner.table.find_ignore_case(field, value).await.map_err(StoreError::Table)?;
		matches.extend(rows.into_iter().filter(|row| !shadowed.contains(&row.key())));
		Ok(matches)
	}

	/// Persists one chunk right away instead of waiting for the timer.
	///
	/// Waits for a flush already in progress. Returns the number of entries
	/// written.
	pub async fn flush_now(&self) -> Result<usize, StoreError<T::Error>> {
		flush_chunk(&self.inner).await
	}

	/// Stops accepting writes and flushes until the buffer is empty.
	///
	/// Returns the first persistence error; the failed entries stay buffered
	/// and a later `shutdown` retries them.
	pub async fn shutdown(&self) -> Result<(), StoreError<T::Error>> {
		{
			let mut state = self.inner.state.lock();
			state.closed = true;
			state.timer.cancel();
			tracing::debug!(pending = state.entries.len(), "store.shutdown");
		}
		while self.pending_len() > 0 {
			flush_chunk(&self.inner).await?;
		}
		Ok(())
	}

	/// Number of buffered entries not yet persisted.
	pub fn pending_len(&self) -> usize {
		self.inner.state.lock().entries.len()
	}

	fn is_buffered(&self, key: &Key<T>) -> bool {
		self.inner.state.lock().entries.contains_key(key)
	}
}

fn arm<T: Table>(inner: &Arc<Inner<T>>, state: &mut BufferState<T::Record>, delay: Duration) {
	let weak: Weak<Inner<T>> = Arc::downgrade(inner);
	let generation = state.timer.arm(inner.scheduler.as_ref(), delay, move |generation| {
		if let Some(inner) = weak.upgrade() {
			spawn(TaskClass::Background, flush_on_timer(inner, generation));
		}
	});
	state.phase = FlushPhase::Armed;
	tracing::trace!(generation, delay_ms = delay.as_millis() as u64, "store.arm_flush");
}

async fn flush_on_timer<T: Table>(inner: Arc<Inner<T>>, generation: u64) {
	if !inner.state.lock().timer.retire(generation) {
		tracing::trace!(generation, "store.stale_flush");
		return;
	}
	// Failures are logged and retried by the re-armed timer.
	let _ = flush_chunk(&inner).await;
}

/// Persists up to `chunk_size` of the oldest entries as one table write.
async fn flush_chunk<T: Table>(inner: &Arc<Inner<T>>) -> Result<usize, StoreError<T::Error>> {
	let _serial = inner.flush_lock.lock().await;

	let (stamps, records) = {
		let mut state = inner.state.lock();
		state.timer.cancel();
		state.phase = FlushPhase::Flushing;
		let chunk = state.entries.iter().take(inner.options.chunk_size);
		let stamps: Vec<(Key<T>, u64)> = chunk.clone().map(|(key, entry)| (key.clone(), entry.seq)).collect();
		let records: Vec<T::Record> = chunk.map(|(_, entry)| entry.record.clone()).collect();
		(stamps, records)
	};

	let result = if records.is_empty() {
		Ok(())
	} else {
		inner.table.bulk_put(records).await
	};

	let mut state = inner.state.lock();
	match &result {
		Ok(()) => {
			for (key, seq) in &stamps {
				if state.entries.get(key).is_some_and(|entry| entry.seq == *seq) {
					state.entries.shift_remove(key);
				}
			}
			tracing::debug!(flushed = stamps.len(), remaining = state.entries.len(), "store.flush");
		}
		Err(error) => {
			tracing::warn!(%error, keys = stamps.len(), "store.flush_failed");
		}
	}

	state.phase = FlushPhase::Idle;
	if !state.entries.is_empty() && !state.closed {
		arm(inner, &mut state, inner.options.subsequent_delay);
	}
	result.map(|()| stamps.len()).map_err(StoreError::Table)
}
