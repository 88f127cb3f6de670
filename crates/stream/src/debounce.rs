//! Temporal coalescing operators.
//!
//! [`Debounce`] holds back bursts of source values and emits one representative
//! value per quiet window. What "representative" means is decided by a
//! [`Coalesce`] policy: [`KeepLatest`] drops superseded values, [`Accumulate`]
//! folds them into the pending value.
//!
//! # State machine
//!
//! ```text
//!          value (delayed)             deadline elapsed
//!   Idle ─────────────────▶ Scheduled ────────────────▶ Idle (emit)
//!    ▲                        │  value: merge + re-arm
//!    └──── value (immediate) ─┘
//! ```
//!
//! Source completion flushes a scheduled value and moves to `Done`. A source
//! error discards the scheduled value, is forwarded, and also moves to `Done`.
//! Once `Done`, the stream yields `None` without polling the source again.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep};

/// Timing options shared by the debounce operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceOptions {
	initial_delay: Duration,
	subsequent_delay: Duration,
	max_pending: Option<usize>,
}

impl DebounceOptions {
	/// Uses `delay` both before and after the first emission, with no pending limit.
	pub fn new(delay: Duration) -> Self {
		Self {
			initial_delay: delay,
			subsequent_delay: delay,
			max_pending: None,
		}
	}

	/// Delay applied until the first emission. Zero emits the first value immediately.
	#[must_use]
	pub fn initial_delay(mut self, delay: Duration) -> Self {
		self.initial_delay = delay;
		self
	}

	/// Delay applied after the first emission.
	#[must_use]
	pub fn subsequent_delay(mut self, delay: Duration) -> Self {
		self.subsequent_delay = delay;
		self
	}

	/// Emits immediately once `count` values arrived since the last emission.
	///
	/// # Panics
	///
	/// Panics if `count` is zero.
	#[must_use]
	pub fn max_pending(mut self, count: usize) -> Self {
		assert!(count > 0, "max_pending must be > 0");
		self.max_pending = Some(count);
		self
	}

	fn delay(&self, emitted_before: bool) -> Duration {
		if emitted_before { self.subsequent_delay } else { self.initial_delay }
	}
}

/// How a newly arrived value combines with the one already waiting.
pub trait Coalesce<T> {
	/// Returns the value that replaces `pending`.
	fn merge(&mut self, pending: T, next: T) -> T;
}

/// Keeps only the newest value.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepLatest;

impl<T> Coalesce<T> for KeepLatest {
	fn merge(&mut self, _pending: T, next: T) -> T {
		next
	}
}

/// Folds superseded values with an accumulator, left to right.
#[derive(Debug, Clone)]
pub struct Accumulate<F>(pub F);

impl<T, F> Coalesce<T> for Accumulate<F>
where
	F: FnMut(T, T) -> T,
{
	fn merge(&mut self, pending: T, next: T) -> T {
		(self.0)(pending, next)
	}
}

/// Predicate type used when no skip-delay predicate was configured.
pub type NeverSkip<T> = fn(Option<&T>, &T) -> bool;

fn never_skip<T>(_last: Option<&T>, _next: &T) -> bool {
	false
}

/// Latest-value debounce, see [`crate::CoalesceExt::debounce_latest`].
pub type DebounceLatest<S, T> = Debounce<S, T, KeepLatest, NeverSkip<T>>;

/// Reducing debounce, see [`crate::CoalesceExt::debounce_reduce`].
pub type DebounceReduce<S, T, F> = Debounce<S, T, Accumulate<F>, NeverSkip<T>>;

enum Phase<T> {
	Idle,
	Scheduled { value: T, deadline: Pin<Box<Sleep>> },
	/// Source completed or failed; nothing more is emitted.
	Done,
}

struct DebounceCore<T, C, P> {
	options: DebounceOptions,
	coalesce: C,
	skip_delay: P,
	phase: Phase<T>,
	since_emit: usize,
	last_emitted: Option<T>,
}

impl<T, C, P> DebounceCore<T, C, P>
where
	T: Clone,
	C: Coalesce<T>,
	P: FnMut(Option<&T>, &T) -> bool,
{
	/// Feeds one source value. Returns a value to emit right away, if any.
	fn on_value(&mut self, value: T) -> Option<T> {
		let skip = (self.skip_delay)(self.last_emitted.as_ref(), &value);
		self.since_emit += 1;

		let (merged, timer) = match std::mem::replace(&mut self.phase, Phase::Idle) {
			Phase::Idle | Phase::Done => (value, None),
			Phase::Scheduled { value: pending, deadline } => (self.coalesce.merge(pending, value), Some(deadline)),
		};

		let emitted_before = self.last_emitted.is_some();
		let immediate = (!emitted_before && self.options.initial_delay.is_zero())
			|| self.options.max_pending.is_some_and(|max| self.since_emit >= max)
			|| skip;
		if immediate {
			return Some(self.emit(merged));
		}

		let due = Instant::now() + self.options.delay(emitted_before);
		let deadline = match timer {
			Some(mut deadline) => {
				deadline.as_mut().reset(due);
				deadline
			}
			None => Box::pin(tokio::time::sleep_until(due)),
		};
		self.phase = Phase::Scheduled { value: merged, deadline };
		None
	}

	fn poll_deadline(&mut self, cx: &mut Context<'_>) -> Option<T> {
		let Phase::Scheduled { deadline, .. } = &mut self.phase else {
			return None;
		};
		if deadline.as_mut().poll(cx).is_pending() {
			return None;
		}
		let Phase::Scheduled { value, .. } = std::mem::replace(&mut self.phase, Phase::Idle) else {
			return None;
		};
		Some(self.emit(value))
	}

	/// Source ended: flush whatever is scheduled.
	fn complete(&mut self) -> Option<T> {
		match std::mem::replace(&mut self.phase, Phase::Done) {
			Phase::Scheduled { value, .. } => Some(self.emit(value)),
			Phase::Idle | Phase::Done => None,
		}
	}

	/// Source failed: the scheduled value is dropped, not emitted.
	fn fail(&mut self) {
		if matches!(std::mem::replace(&mut self.phase, Phase::Done), Phase::Scheduled { .. }) {
			tracing::debug!(pending = self.since_emit, "debounce.discard_on_error");
		}
	}

	fn emit(&mut self, value: T) -> T {
		self.since_emit = 0;
		self.last_emitted = Some(value.clone());
		value
	}
}

pin_project! {
	/// Stream returned by the debounce operators.
	#[must_use = "streams do nothing unless polled"]
	pub struct Debounce<S, T, C, P> {
		#[pin]
		source: S,
		core: DebounceCore<T, C, P>,
	}
}

impl<S, T, C> Debounce<S, T, C, NeverSkip<T>> {
	pub(crate) fn new(source: S, options: DebounceOptions, coalesce: C) -> Self {
		Self {
			source,
			core: DebounceCore {
				options,
				coalesce,
				skip_delay: never_skip::<T> as NeverSkip<T>,
				phase: Phase::Idle,
				since_emit: 0,
				last_emitted: None,
			},
		}
	}
}

impl<S, T, C, P> Debounce<S, T, C, P> {
	/// Emits immediately whenever `predicate(last_emitted, next)` holds.
	pub fn skip_delay_when<Q>(self, predicate: Q) -> Debounce<S, T, C, Q>
	where
		Q: FnMut(Option<&T>, &T) -> bool,
	{
		let Self { source, core } = self;
		Debounce {
			source,
			core: DebounceCore {
				options: core.options,
				coalesce: core.coalesce,
				skip_delay: predicate,
				phase: core.phase,
				since_emit: core.since_emit,
				last_emitted: core.last_emitted,
			},
		}
	}

	/// Returns `true` while a value is waiting for its deadline.
	pub fn has_pending(&self) -> bool {
		matches!(self.core.phase, Phase::Scheduled { .. })
	}
}

impl<S, T, E, C, P> Stream for Debounce<S, T, C, P>
where
	S: Stream<Item = Result<T, E>>,
	T: Clone,
	C: Coalesce<T>,
	P: FnMut(Option<&T>, &T) -> bool,
{
	type Item = Result<T, E>;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		let mut this = self.project();
		let core = this.core;
		if matches!(core.phase, Phase::Done) {
			return Poll::Ready(None);
		}

		loop {
			match this.source.as_mut().poll_next(cx) {
				Poll::Ready(Some(Ok(value))) => {
					if let Some(out) = core.on_value(value) {
						return Poll::Ready(Some(Ok(out)));
					}
				}
				Poll::Ready(Some(Err(err))) => {
					core.fail();
					return Poll::Ready(Some(Err(err)));
				}
				Poll::Ready(None) => return Poll::Ready(core.complete().map(Ok)),
				Poll::Pending => break,
			}
		}

		match core.poll_deadline(cx) {
			Some(value) => Poll::Ready(Some(Ok(value))),
			None => Poll::Pending,
		}
	}
}

#[cfg(test)]
mod tests;
