//! On-demand cached broadcast.
//!
//! A [`CachedBroadcast`] computes its value lazily when the first [`Observer`]
//! attaches and shares that one result with every observer. Each event on the
//! invalidation stream triggers exactly one recompute. When the last observer
//! detaches, the driver (and with it the invalidation subscription) is cancelled
//! and the cache is cleared.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use waymark_worker::{GenerationClock, GenerationToken, TaskClass, spawn};

type Provider<T> = Arc<dyn Fn() -> BoxFuture<'static, T> + Send + Sync>;
type Invalidations = Arc<dyn Fn() -> BoxStream<'static, ()> + Send + Sync>;

struct BroadcastState {
	observers: usize,
	driver: Option<GenerationToken>,
}

struct Inner<T> {
	provider: Provider<T>,
	invalidations: Invalidations,
	clock: GenerationClock,
	state: Mutex<BroadcastState>,
	value: watch::Sender<Option<Arc<T>>>,
}

impl<T> Inner<T> {
	/// Publishes `value` if `generation` is still the live driver.
	fn publish(&self, generation: u64, value: T) -> bool {
		let state = self.state.lock();
		if !state.driver.as_ref().is_some_and(|driver| driver.is_for(generation)) {
			tracing::trace!(generation, "broadcast.discard_stale");
			return false;
		}
		self.value.send_replace(Some(Arc::new(value)));
		tracing::debug!(generation, observers = state.observers, "broadcast.publish");
		true
	}
}

/// Lazily computed value shared by all attached observers.
pub struct CachedBroadcast<T> {
	inner: Arc<Inner<T>>,
}

impl<T> Clone for CachedBroadcast<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> std::fmt::Debug for CachedBroadcast<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.inner.state.lock();
		f.debug_struct("CachedBroadcast")
			.field("observers", &state.observers)
			.field("generation", &state.driver.as_ref().map(GenerationToken::generation))
			.finish_non_exhaustive()
	}
}

impl<T> CachedBroadcast<T>
where
	T: Send + Sync + 'static,
{
	/// Creates a broadcast over `provider`, recomputed on every item of the
	/// stream produced by `invalidations`.
	///
	/// `invalidations` is called once per first attach, so each live period
	/// gets its own subscription. Item contents are ignored.
	pub fn new<P, Fut, I, St>(provider: P, invalidations: I) -> Self
	where
		P: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = T> + Send + 'static,
		I: Fn() -> St + Send + Sync + 'static,
		St: Stream + Send + 'static,
	{
		let (value, _) = watch::channel(None);
		Self {
			inner: Arc::new(Inner {
				provider: Arc::new(move || provider().boxed()),
				invalidations: Arc::new(move || invalidations().map(|_| ()).boxed()),
				clock: GenerationClock::new(),
				state: Mutex::new(BroadcastState {
					observers: 0,
					driver: None,
				}),
				value,
			}),
		}
	}

	/// Attaches an observer.
	///
	/// The first observer starts the computation. Later observers receive the
	/// cached value, if one exists, without triggering a recompute.
	pub fn subscribe(&self) -> Observer<T> {
		let mut rx = self.inner.value.subscribe();
		let mut state = self.inner.state.lock();
		state.observers += 1;
		if state.observers == 1 {
			let token = GenerationToken::new(self.inner.clock.next());
			state.driver = Some(token.clone());
			drop(state);
			tracing::debug!(generation = token.generation(), "broadcast.start");
			spawn(TaskClass::Interactive, drive(Arc::clone(&self.inner), token));
		} else {
			drop(state);
			rx.mark_changed();
		}
		Observer {
			rx,
			inner: Arc::clone(&self.inner),
		}
	}

	/// Number of attached observers.
	pub fn observer_count(&self) -> usize {
		self.inner.state.lock().observers
	}

	/// Currently cached value, if any.
	pub fn cached(&self) -> Option<Arc<T>> {
		self.inner.value.borrow().clone()
	}
}

/// Computes once, then once per invalidation, until `token` is cancelled.
async fn drive<T>(inner: Arc<Inner<T>>, token: GenerationToken) {
	let generation = token.generation();
	// Subscribe before the first compute so invalidations during it are not lost.
	let mut invalidations = (inner.invalidations)();
	let run = async {
		let value = (inner.provider)().await;
		inner.publish(generation, value);
		while invalidations.next().await.is_some() {
			let value = (inner.provider)().await;
			if !inner.publish(generation, value) {
				return;
			}
		}
	};
	tokio::select! {
		() = token.cancelled() => tracing::debug!(generation, "broadcast.stop"),
		() = run => tracing::debug!(generation, "broadcast.invalidations_ended"),
	}
}

/// One attached consumer of a [`CachedBroadcast`]. Dropping it detaches.
pub struct Observer<T> {
	rx: watch::Receiver<Option<Arc<T>>>,
	inner: Arc<Inner<T>>,
}

impl<T> Observer<T> {
	/// Waits for a value this observer has not seen yet.
	///
	/// Returns `None` only if the broadcast was torn down.
	pub async fn recv(&mut self) -> Option<Arc<T>> {
		loop {
			self.rx.changed().await.ok()?;
			if let Some(value) = self.rx.borrow_and_update().clone() {
				return Some(value);
			}
		}
	}

	/// Latest value without waiting.
	pub fn current(&self) -> Option<Arc<T>> {
		self.rx.borrow().clone()
	}
}

impl<T> Drop for Observer<T> {
	fn drop(&mut self) {
		let mut state = self.inner.state.lock();
		state.observers -= 1;
		if state.observers > 0 {
			return;
		}
		if let Some(token) = state.driver.take() {
			token.cancel();
			tracing::debug!(generation = token.generation(), "broadcast.release");
		}
		self.inner.value.send_replace(None);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use futures::stream;
	use tokio::sync::broadcast;

	use super::*;

	fn signal_stream(tx: &broadcast::Sender<()>) -> impl Stream<Item = ()> + Send + use<> {
		stream::unfold(tx.subscribe(), |mut rx| async move { rx.recv().await.ok().map(|()| ((), rx)) })
	}

	fn counting_broadcast(delay: Duration) -> (CachedBroadcast<usize>, Arc<AtomicUsize>, broadcast::Sender<()>) {
		let computes = Arc::new(AtomicUsize::new(0));
		let (signal, _) = broadcast::channel(8);
		let counter = Arc::clone(&computes);
		let invalidate = signal.clone();
		let cache = CachedBroadcast::new(
			move || {
				let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
				async move {
					tokio::time::sleep(delay).await;
					n
				}
			},
			move || signal_stream(&invalidate),
		);
		(cache, computes, signal)
	}

	#[tokio::test(start_paused = true)]
	async fn observers_share_one_compute_per_invalidation() {
		let (cache, computes, signal) = counting_broadcast(Duration::from_millis(5));

		let mut a = cache.subscribe();
		assert_eq!(a.recv().await.as_deref(), Some(&1));

		let mut b = cache.subscribe();
		assert_eq!(b.recv().await.as_deref(), Some(&1));
		assert_eq!(computes.load(Ordering::SeqCst), 1, "late attach must reuse the cache");

		signal.send(()).expect("driver subscribed");
		let from_a = a.recv().await.expect("value");
		let from_b = b.recv().await.expect("value");
		assert!(Arc::ptr_eq(&from_a, &from_b));
		assert_eq!(*from_a, 2);
		assert_eq!(computes.load(Ordering::SeqCst), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn last_detach_clears_cache_and_next_attach_recomputes() {
		let (cache, computes, signal) = counting_broadcast(Duration::ZERO);

		let mut a = cache.subscribe();
		assert_eq!(a.recv().await.as_deref(), Some(&1));
		drop(a);

		assert_eq!(cache.observer_count(), 0);
		assert!(cache.cached().is_none());

		// Give the cancelled driver a chance to exit and drop its subscription.
		tokio::time::sleep(Duration::from_millis(1)).await;
		assert_eq!(signal.receiver_count(), 0);

		let mut c = cache.subscribe();
		assert_eq!(c.recv().await.as_deref(), Some(&2));
		assert_eq!(computes.load(Ordering::SeqCst), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn detaching_mid_compute_never_publishes_stale_value() {
		let (cache, computes, _signal) = counting_broadcast(Duration::from_millis(50));

		let early = cache.subscribe();
		tokio::time::sleep(Duration::from_millis(10)).await;
		drop(early);

		let mut late = cache.subscribe();
		assert_eq!(late.recv().await.as_deref(), Some(&2));
		assert_eq!(computes.load(Ordering::SeqCst), 2);
		assert_eq!(late.current().as_deref(), Some(&2));
	}
}
