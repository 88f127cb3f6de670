use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

/// Hands out increasing generation numbers, starting at 1.
///
/// A component that restarts a timer or a background driver stamps each start
/// with a fresh generation. Work carrying an older stamp is stale and must not
/// touch shared state.
#[derive(Debug, Default)]
pub struct GenerationClock {
	last: AtomicU64,
}

impl GenerationClock {
	pub fn new() -> Self {
		Self::default()
	}

	/// Advances the clock and returns the new generation.
	pub fn next(&self) -> u64 {
		self.last.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
	}

	/// Last generation handed out, or 0 if none was.
	pub fn current(&self) -> u64 {
		self.last.load(Ordering::Acquire)
	}
}

/// Stop signal for one background driver.
///
/// Clones share the signal. The generation identifies which start of the
/// driver the token was issued to.
#[derive(Debug, Clone)]
pub struct GenerationToken {
	generation: u64,
	cancel: CancellationToken,
}

impl GenerationToken {
	pub fn new(generation: u64) -> Self {
		Self {
			generation,
			cancel: CancellationToken::new(),
		}
	}

	pub const fn generation(&self) -> u64 {
		self.generation
	}

	/// Returns `true` if this token was issued to `generation`.
	pub const fn is_for(&self, generation: u64) -> bool {
		self.generation == generation
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Signals the driver to stop. Repeated calls are no-ops.
	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	/// Resolves once [`Self::cancel`] has been called on any clone.
	pub async fn cancelled(&self) {
		self.cancel.cancelled().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clock_hands_out_increasing_generations() {
		let clock = GenerationClock::new();
		assert_eq!(clock.current(), 0);
		assert_eq!(clock.next(), 1);
		assert_eq!(clock.next(), 2);
		assert_eq!(clock.current(), 2);
	}

	#[test]
	fn token_recognises_only_its_own_generation() {
		let clock = GenerationClock::new();
		let stale = GenerationToken::new(clock.next());
		let live = GenerationToken::new(clock.next());
		assert!(stale.is_for(1));
		assert!(!stale.is_for(live.generation()));
		assert!(live.is_for(clock.current()));
	}

	#[tokio::test]
	async fn token_clones_observe_cancellation() {
		let token = GenerationToken::new(7);
		let clone = token.clone();
		assert!(!clone.is_cancelled());

		token.cancel();
		token.cancel();
		clone.cancelled().await;
		assert!(clone.is_cancelled());
	}
}
