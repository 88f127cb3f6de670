//! Single-flight request deduplication.
//!
//! At most one in-flight fetch exists per key. A key is covered either by a
//! single record (one key, one factory call) or by a batch record (one factory
//! call for many keys), never both. Records remove themselves when their future
//! settles, so a failed fetch is retried by the next caller.
//!
//! Every registered fetch is driven by its own background task, so it runs to
//! completion and settles even when no caller is left polling it.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, Shared, try_join, try_join_all};
use futures::{FutureExt, TryFutureExt};
use parking_lot::Mutex;
use waymark_worker::{TaskClass, spawn};

type SharedSingle<V, E> = Shared<BoxFuture<'static, Result<Option<V>, E>>>;
type SharedBatch<K, V, E> = Shared<BoxFuture<'static, Result<Arc<HashMap<K, V>>, E>>>;

struct Pending<F> {
	id: u64,
	fut: F,
}

struct Registry<K, V, E> {
	singles: HashMap<K, Pending<SharedSingle<V, E>>>,
	batches: HashMap<K, Pending<SharedBatch<K, V, E>>>,
	next_id: u64,
}

impl<K, V, E> Registry<K, V, E>
where
	K: Clone + Eq + Hash + Send + Sync + 'static,
	V: Clone + Send + Sync + 'static,
	E: Clone + Send + Sync + 'static,
{
	fn next_id(&mut self) -> u64 {
		self.next_id += 1;
		self.next_id
	}

	/// Returns a future for `key` if any record covers it.
	fn lookup(&self, key: &K) -> Option<BoxFuture<'static, Result<Option<V>, E>>> {
		if let Some(single) = self.singles.get(key) {
			return Some(single.fut.clone().boxed());
		}
		let batch = self.batches.get(key)?;
		let key = key.clone();
		Some(batch.fut.clone().map_ok(move |found| found.get(&key).cloned()).boxed())
	}

	fn settle_single(&mut self, key: &K, id: u64) {
		if self.singles.get(key).is_some_and(|pending| pending.id == id) {
			self.singles.remove(key);
		}
	}

	fn settle_batch(&mut self, keys: &[K], id: u64) {
		for key in keys {
			if self.batches.get(key).is_some_and(|pending| pending.id == id) {
				self.batches.remove(key);
			}
		}
	}
}

/// Collapses concurrent fetches of the same key into one factory call.
///
/// Cloning yields another handle to the same registry. Dropping a returned
/// future never cancels the shared fetch; it keeps running in the background
/// and settles its record when done.
pub struct RequestDeduplicator<K, V, E> {
	registry: Arc<Mutex<Registry<K, V, E>>>,
}

impl<K, V, E> Clone for RequestDeduplicator<K, V, E> {
	fn clone(&self) -> Self {
		Self {
			registry: Arc::clone(&self.registry),
		}
	}
}

impl<K, V, E> Default for RequestDeduplicator<K, V, E> {
	fn default() -> Self {
		Self {
			registry: Arc::new(Mutex::new(Registry {
				singles: HashMap::new(),
				batches: HashMap::new(),
				next_id: 0,
			})),
		}
	}
}

impl<K, V, E> std::fmt::Debug for RequestDeduplicator<K, V, E> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let registry = self.registry.lock();
		f.debug_struct("RequestDeduplicator")
			.field("singles", &registry.singles.len())
			.field("batched_keys", &registry.batches.len())
			.finish()
	}
}

impl<K, V, E> RequestDeduplicator<K, V, E>
where
	K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
	V: Clone + Send + Sync + 'static,
	E: Clone + Send + Sync + 'static,
{
	/// Creates an empty deduplicator.
	pub fn new() -> Self {
		Self::default()
	}

	/// Fetches one key, joining an in-flight single or batch fetch if one covers it.
	///
	/// `factory` is only called when nothing covers `key`. The registration is
	/// made before this method returns.
	///
	/// # Panics
	///
	/// Panics when a new fetch is registered outside of a Tokio runtime.
	pub fn request_single<F, Fut>(&self, key: K, factory: F) -> BoxFuture<'static, Result<Option<V>, E>>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = Result<Option<V>, E>> + Send + 'static,
	{
		let mut registry = self.registry.lock();
		if let Some(fut) = registry.lookup(&key) {
			tracing::trace!(?key, "dedup.reuse");
			return fut;
		}

		let id = registry.next_id();
		let weak = Arc::downgrade(&self.registry);
		let settle_key = key.clone();
		let shared = async move {
			let result = factory().await;
			settle(&weak, |registry| registry.settle_single(&settle_key, id));
			result
		}
		.boxed()
		.shared();
		registry.singles.insert(key.clone(), Pending { id, fut: shared.clone() });
		tracing::trace!(?key, id, "dedup.register_single");
		drive(shared.clone());
		shared.boxed()
	}

	/// Fetches many keys with at most one new batch call.
	///
	/// Keys already covered by an in-flight fetch reuse it; the rest are passed
	/// to `batch_factory` in one call. Keys with no value are absent from the
	/// result. The combined future fails if any constituent fetch fails.
	///
	/// # Panics
	///
	/// Panics when a new batch is registered outside of a Tokio runtime.
	pub fn request_multiple<I, F, Fut>(&self, keys: I, batch_factory: F) -> BoxFuture<'static, Result<HashMap<K, V>, E>>
	where
		I: IntoIterator<Item = K>,
		F: FnOnce(Vec<K>) -> Fut + Send + 'static,
		Fut: Future<Output = Result<HashMap<K, V>, E>> + Send + 'static,
	{
		let mut registry = self.registry.lock();
		let mut seen = HashSet::new();
		let mut reused = Vec::new();
		let mut missing = Vec::new();
		for key in keys {
			if !seen.insert(key.clone()) {
				continue;
			}
			match registry.lookup(&key) {
				Some(fut) => reused.push(fut.map_ok(move |value| (key, value))),
				None => missing.push(key),
			}
		}

		let fetched = if missing.is_empty() {
			None
		} else {
			let id = registry.next_id();
			let weak = Arc::downgrade(&self.registry);
			let settle_keys = missing.clone();
			let shared = async move {
				let result = batch_factory(settle_keys.clone()).await.map(Arc::new);
				settle(&weak, |registry| registry.settle_batch(&settle_keys, id));
				result
			}
			.boxed()
			.shared();
			for key in &missing {
				registry.batches.insert(key.clone(), Pending { id, fut: shared.clone() });
			}
			drive(shared.clone());
			Some((missing, shared))
		};
		drop(registry);

		tracing::debug!(
			reused = reused.len(),
			fetched = fetched.as_ref().map_or(0, |(missing, _)| missing.len()),
			"dedup.request_multiple"
		);

		let batch = async move {
			let Some((missing, shared)) = fetched else {
				return Ok::<_, E>(Vec::new());
			};
			let found = shared.await?;
			Ok(missing
				.into_iter()
				.filter_map(|key| found.get(&key).cloned().map(|value| (key, value)))
				.collect())
		};

		async move {
			let (reused, fetched) = try_join(try_join_all(reused), batch).await?;
			Ok::<HashMap<K, V>, E>(reused
				.into_iter()
				.filter_map(|(key, value)| value.map(|value| (key, value)))
				.chain(fetched)
				.collect())
		}
		.boxed()
	}

	/// Returns `true` if a fetch covering `key` is in flight.
	pub fn is_pending(&self, key: &K) -> bool {
		let registry = self.registry.lock();
		registry.singles.contains_key(key) || registry.batches.contains_key(key)
	}

	/// Number of keys covered by in-flight fetches.
	pub fn pending_len(&self) -> usize {
		let registry = self.registry.lock();
		registry.singles.len() + registry.batches.len()
	}
}

/// Polls a registered fetch to completion independently of its callers.
fn drive<T>(shared: Shared<BoxFuture<'static, T>>)
where
	T: Clone + Send + Sync + 'static,
{
	spawn(TaskClass::Background, shared.map(|_| ()));
}

fn settle<K, V, E>(registry: &Weak<Mutex<Registry<K, V, E>>>, apply: impl FnOnce(&mut Registry<K, V, E>)) {
	if let Some(registry) = registry.upgrade() {
		apply(&mut registry.lock());
	}
}
