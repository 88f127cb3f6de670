//! Deadline operators: bound how long a consumer waits for an acceptable value.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep};

fn arm(deadline: &mut Option<Pin<Box<Sleep>>>, timeout: Duration) {
	let due = Instant::now() + timeout;
	match deadline {
		Some(sleep) => sleep.as_mut().reset(due),
		None => *deadline = Some(Box::pin(tokio::time::sleep_until(due))),
	}
}

fn elapsed(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
	let fired = deadline.as_mut().is_some_and(|sleep| sleep.as_mut().poll(cx).is_ready());
	if fired {
		*deadline = None;
	}
	fired
}

pin_project! {
	/// Stream returned by [`crate::CoalesceExt::filter_or_else`].
	///
	/// Matching values pass through and cancel any pending fallback. The first
	/// rejected value while no fallback is pending arms one for `timeout` later.
	#[must_use = "streams do nothing unless polled"]
	pub struct FilterOrElse<S, P, F> {
		#[pin]
		source: S,
		timeout: Duration,
		predicate: P,
		fallback: F,
		deadline: Option<Pin<Box<Sleep>>>,
		finished: bool,
	}
}

impl<S, P, F> FilterOrElse<S, P, F> {
	pub(crate) fn new(source: S, timeout: Duration, predicate: P, fallback: F) -> Self {
		Self {
			source,
			timeout,
			predicate,
			fallback,
			deadline: None,
			finished: false,
		}
	}

	/// Returns `true` while a fallback is armed.
	pub fn has_pending_fallback(&self) -> bool {
		self.deadline.is_some()
	}
}

impl<S, T, E, P, F> Stream for FilterOrElse<S, P, F>
where
	S: Stream<Item = Result<T, E>>,
	P: FnMut(&T) -> bool,
	F: FnMut() -> T,
{
	type Item = Result<T, E>;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let mut this = self.project();
		if *this.finished {
			return Poll::Ready(None);
		}

		loop {
			match this.source.as_mut().poll_next(cx) {
				Poll::Ready(Some(Ok(value))) => {
					if (this.predicate)(&value) {
						*this.deadline = None;
						return Poll::Ready(Some(Ok(value)));
					}
					if this.deadline.is_none() {
						arm(this.deadline, *this.timeout);
					}
				}
				Poll::Ready(Some(Err(err))) => {
					*this.deadline = None;
					*this.finished = true;
					return Poll::Ready(Some(Err(err)));
				}
				Poll::Ready(None) => {
					*this.finished = true;
					if this.deadline.take().is_some() {
						return Poll::Ready(Some(Ok((this.fallback)())));
					}
					return Poll::Ready(None);
				}
				Poll::Pending => break,
			}
		}

		if elapsed(this.deadline, cx) {
			tracing::trace!(timeout_ms = this.timeout.as_millis() as u64, "deadline.fallback");
			return Poll::Ready(Some(Ok((this.fallback)())));
		}
		Poll::Pending
	}
}

pin_project! {
	/// Future returned by [`crate::CoalesceExt::first_or_else`].
	///
	/// Resolves to the first matching value, or to the fallback once `timeout`
	/// passes after the most recent rejected value. The source is dropped as
	/// soon as the future resolves.
	#[must_use = "futures do nothing unless polled"]
	pub struct FirstOrElse<S, P, F> {
		#[pin]
		source: Option<S>,
		timeout: Duration,
		predicate: P,
		fallback: Option<F>,
		deadline: Option<Pin<Box<Sleep>>>,
	}
}

impl<S, P, F> FirstOrElse<S, P, F> {
	pub(crate) fn new(source: S, timeout: Duration, predicate: P, fallback: F) -> Self {
		Self {
			source: Some(source),
			timeout,
			predicate,
			fallback: Some(fallback),
			deadline: None,
		}
	}
}

impl<S, T, E, P, F> Future for FirstOrElse<S, P, F>
where
	S: Stream<Item = Result<T, E>>,
	P: FnMut(&T) -> bool,
	F: FnOnce() -> T,
{
	type Output = Result<T, E>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut this = self.project();
		let fallback = |slot: &mut Option<F>| match slot.take() {
			Some(fallback) => fallback(),
			None => panic!("FirstOrElse polled after completion"),
		};

		loop {
			let Some(source) = this.source.as_mut().as_pin_mut() else {
				panic!("FirstOrElse polled after completion");
			};
			match source.poll_next(cx) {
				Poll::Ready(Some(Ok(value))) => {
					if (this.predicate)(&value) {
						this.source.set(None);
						*this.deadline = None;
						return Poll::Ready(Ok(value));
					}
					arm(this.deadline, *this.timeout);
				}
				Poll::Ready(Some(Err(err))) => {
					this.source.set(None);
					*this.deadline = None;
					return Poll::Ready(Err(err));
				}
				Poll::Ready(None) => {
					this.source.set(None);
					*this.deadline = None;
					return Poll::Ready(Ok(fallback(this.fallback)));
				}
				Poll::Pending => break,
			}
		}

		if elapsed(this.deadline, cx) {
			this.source.set(None);
			tracing::trace!(timeout_ms = this.timeout.as_millis() as u64, "deadline.first_fallback");
			return Poll::Ready(Ok(fallback(this.fallback)));
		}
		Poll::Pending
	}
}
