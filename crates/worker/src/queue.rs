//! Bounded concurrency queue.
//!
//! [`RequestQueue`] starts submitted operations in submission order while never
//! letting more than `max_requests` of them run at once. Each submitter gets a
//! handle that observes only its own operation's output.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::{TaskClass, spawn};

/// Error observed by a submitter whose operation could not deliver a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
	/// The operation panicked or its task was torn down before finishing.
	#[error("queued operation was aborted before producing a result")]
	Aborted,
}

/// Deferred start of one operation. Returns `None` when nobody is waiting for it.
type Job = Box<dyn FnOnce() -> Option<BoxFuture<'static, ()>> + Send>;

struct QueueState {
	in_flight: usize,
	waiting: VecDeque<Job>,
}

struct QueueInner {
	max_requests: usize,
	state: Mutex<QueueState>,
}

/// FIFO queue that bounds how many operations are in flight.
#[derive(Clone)]
pub struct RequestQueue {
	inner: Arc<QueueInner>,
}

impl std::fmt::Debug for RequestQueue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.inner.state.lock();
		f.debug_struct("RequestQueue")
			.field("max_requests", &self.inner.max_requests)
			.field("in_flight", &state.in_flight)
			.field("queued", &state.waiting.len())
			.finish()
	}
}

impl RequestQueue {
	/// Creates a queue allowing `max_requests` concurrent operations.
	///
	/// # Panics
	///
	/// Panics if `max_requests` is zero.
	pub fn new(max_requests: usize) -> Self {
		assert!(max_requests > 0, "max_requests must be > 0");
		Self {
			inner: Arc::new(QueueInner {
				max_requests,
				state: Mutex::new(QueueState {
					in_flight: 0,
					waiting: VecDeque::new(),
				}),
			}),
		}
	}

	/// Queues a future-producing operation.
	///
	/// `factory` is invoked when the operation is granted a slot. The returned
	/// [`Submission`] resolves to the operation's output unchanged.
	pub fn submit<F, Fut>(&self, factory: F) -> Submission<Fut::Output>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future + Send + 'static,
		Fut::Output: Send + 'static,
	{
		let (tx, rx) = oneshot::channel();
		self.enqueue(Box::new(move || {
			if tx.is_closed() {
				return None;
			}
			let fut = factory();
			Some(
				async move {
					let _ = tx.send(fut.await);
				}
				.boxed(),
			)
		}));
		Submission { rx }
	}

	/// Queues a stream-producing operation.
	///
	/// The slot stays occupied until the stream ends or the returned
	/// [`SubmittedStream`] is dropped. Items are forwarded unchanged.
	pub fn submit_stream<F, S>(&self, factory: F) -> SubmittedStream<S::Item>
	where
		F: FnOnce() -> S + Send + 'static,
		S: Stream + Send + 'static,
		S::Item: Send + 'static,
	{
		let (tx, rx) = mpsc::unbounded_channel();
		self.enqueue(Box::new(move || {
			if tx.is_closed() {
				return None;
			}
			let stream = factory();
			Some(
				async move {
					let mut stream = std::pin::pin!(stream);
					while let Some(item) = stream.next().await {
						if tx.send(item).is_err() {
							break;
						}
					}
				}
				.boxed(),
			)
		}));
		SubmittedStream { rx }
	}

	/// Number of operations currently running.
	pub fn in_flight(&self) -> usize {
		self.inner.state.lock().in_flight
	}

	/// Number of operations waiting for a slot.
	pub fn queued(&self) -> usize {
		self.inner.state.lock().waiting.len()
	}

	/// Configured concurrency bound.
	pub fn max_requests(&self) -> usize {
		self.inner.max_requests
	}

	fn enqueue(&self, job: Job) {
		let queued = {
			let mut state = self.inner.state.lock();
			state.waiting.push_back(job);
			state.waiting.len()
		};
		tracing::trace!(queued, "queue.submit");
		dispatch(&self.inner);
	}
}

/// Starts queued jobs until the bound is reached or the queue is empty.
fn dispatch(inner: &Arc<QueueInner>) {
	loop {
		let job = {
			let mut state = inner.state.lock();
			if state.in_flight >= inner.max_requests {
				return;
			}
			let Some(job) = state.waiting.pop_front() else {
				return;
			};
			state.in_flight += 1;
			job
		};

		// A panicking factory drops its sender, so its submitter sees `Aborted`.
		let fut = match std::panic::catch_unwind(AssertUnwindSafe(job)) {
			Ok(Some(fut)) => fut,
			Ok(None) => {
				inner.state.lock().in_flight -= 1;
				tracing::trace!("queue.skip_abandoned");
				continue;
			}
			Err(_) => {
				inner.state.lock().in_flight -= 1;
				tracing::warn!("queue.factory_panicked");
				continue;
			}
		};

		tracing::trace!(max = inner.max_requests, "queue.dispatch");
		let slot = SlotGuard { inner: Arc::clone(inner) };
		spawn(TaskClass::Interactive, async move {
			let _slot = slot;
			fut.await;
		});
	}
}

/// Releases one in-flight slot on drop, including when the job panics.
struct SlotGuard {
	inner: Arc<QueueInner>,
}

impl Drop for SlotGuard {
	fn drop(&mut self) {
		self.inner.state.lock().in_flight -= 1;
		if std::thread::panicking() {
			// Starting the next job here would run its factory mid-unwind.
			let inner = Arc::clone(&self.inner);
			spawn(TaskClass::Interactive, async move { dispatch(&inner) });
		} else {
			dispatch(&self.inner);
		}
	}
}

/// Handle to a future submitted through [`RequestQueue::submit`].
#[derive(Debug)]
#[must_use = "dropping a submission before it starts skips the operation"]
pub struct Submission<T> {
	rx: oneshot::Receiver<T>,
}

impl<T> Future for Submission<T> {
	type Output = Result<T, QueueError>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.rx).poll(cx).map_err(|_| QueueError::Aborted)
	}
}

/// Handle to a stream submitted through [`RequestQueue::submit_stream`].
#[derive(Debug)]
#[must_use = "dropping a submitted stream before it starts skips the operation"]
pub struct SubmittedStream<T> {
	rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Stream for SubmittedStream<T> {
	type Item = T;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
		self.rx.poll_recv(cx)
	}
}

#[cfg(test)]
mod tests;
