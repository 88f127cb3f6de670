//! Stream operators that shape bursty input before it reaches storage or the
//! network, plus a lazily computed broadcast for derived state.
//!
//! All operators work on fallible streams (`Stream<Item = Result<T, E>>`). An
//! `Err` item is terminal: it is forwarded and the operator ends.
//!
//! - [`CoalesceExt::debounce_latest`] / [`CoalesceExt::debounce_reduce`]: temporal coalescing.
//! - [`CoalesceExt::filter_or_else`] / [`CoalesceExt::first_or_else`]: deadline operators.
//! - [`CachedBroadcast`]: one shared computation for many observers.
//!
//! The operators are poll-driven, so their deadlines are tokio [`Sleep`]
//! futures owned by the stream and polled alongside the source. Dropping the
//! stream drops the deadline with it. Components that must fire a callback
//! with nobody polling use `waymark_worker::Scheduler` instead.
//!
//! [`Sleep`]: tokio::time::Sleep

use std::time::Duration;

use futures::Stream;

pub mod broadcast;
pub mod debounce;
pub mod deadline;

pub use broadcast::{CachedBroadcast, Observer};
pub use debounce::{Accumulate, Coalesce, Debounce, DebounceLatest, DebounceOptions, DebounceReduce, KeepLatest, NeverSkip};
pub use deadline::{FilterOrElse, FirstOrElse};

/// Coalescing and deadline operators for fallible streams.
pub trait CoalesceExt<T, E>: Stream<Item = Result<T, E>> + Sized {
	/// Emits only the most recent value of each debounce window.
	fn debounce_latest(self, options: DebounceOptions) -> DebounceLatest<Self, T>
	where
		T: Clone,
	{
		Debounce::new(self, options, KeepLatest)
	}

	/// Folds every value of a debounce window with `accumulator(pending, next)`.
	fn debounce_reduce<F>(self, options: DebounceOptions, accumulator: F) -> DebounceReduce<Self, T, F>
	where
		T: Clone,
		F: FnMut(T, T) -> T,
	{
		Debounce::new(self, options, Accumulate(accumulator))
	}

	/// Passes values matching `predicate`; emits `fallback()` when a rejected
	/// value is not followed by a match within `timeout`.
	fn filter_or_else<P, F>(self, timeout: Duration, predicate: P, fallback: F) -> FilterOrElse<Self, P, F>
	where
		P: FnMut(&T) -> bool,
		F: FnMut() -> T,
	{
		FilterOrElse::new(self, timeout, predicate, fallback)
	}

	/// Resolves to the first value matching `predicate`, or to `fallback()`
	/// when `timeout` passes after the latest rejected value or the source ends.
	fn first_or_else<P, F>(self, timeout: Duration, predicate: P, fallback: F) -> FirstOrElse<Self, P, F>
	where
		P: FnMut(&T) -> bool,
		F: FnOnce() -> T,
	{
		FirstOrElse::new(self, timeout, predicate, fallback)
	}
}

impl<S, T, E> CoalesceExt<T, E> for S where S: Stream<Item = Result<T, E>> {}
