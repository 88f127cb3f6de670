//! Cancellable, delayed units of work.
//!
//! A [`Scheduler`] registers a callback to run after a delay and hands back a
//! [`ScheduledTask`] guard. Dropping or cancelling the guard before the deadline
//! guarantees the callback never runs. [`TimerSlot`] is the owner-side holder
//! that keeps at most one live task per owner: arming it again cancels the task
//! it replaces.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::token::GenerationClock;
use crate::{TaskClass, spawn};

/// Deferred callback run by a [`Scheduler`].
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Registers deferred callbacks.
pub trait Scheduler: Send + Sync + 'static {
	/// Runs `callback` once after `delay` unless the returned task is cancelled first.
	fn schedule(&self, delay: Duration, callback: TimerCallback) -> ScheduledTask;
}

/// [`Scheduler`] backed by the Tokio timer wheel.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
	fn schedule(&self, delay: Duration, callback: TimerCallback) -> ScheduledTask {
		let (task, trigger) = ScheduledTask::new();
		spawn(TaskClass::Background, async move {
			tokio::select! {
				biased;
				() = trigger.cancelled() => {}
				() = tokio::time::sleep(delay) => {
					trigger.fire(callback);
				}
			}
		});
		task
	}
}

#[derive(Debug)]
struct TaskShared {
	cancel: CancellationToken,
	fired: AtomicBool,
}

/// Owner-side guard for one scheduled callback. Dropping it cancels the callback.
#[derive(Debug)]
pub struct ScheduledTask {
	shared: Arc<TaskShared>,
}

/// Scheduler-side half of a [`ScheduledTask`].
#[derive(Debug)]
pub struct TaskTrigger {
	shared: Arc<TaskShared>,
}

impl ScheduledTask {
	/// Creates a linked task/trigger pair for [`Scheduler`] implementations.
	pub fn new() -> (Self, TaskTrigger) {
		let shared = Arc::new(TaskShared {
			cancel: CancellationToken::new(),
			fired: AtomicBool::new(false),
		});
		(
			Self {
				shared: Arc::clone(&shared),
			},
			TaskTrigger { shared },
		)
	}

	/// Cancels the callback. Returns `true` if it was still pending.
	pub fn cancel(&self) -> bool {
		let was_pending = self.is_pending();
		self.shared.cancel.cancel();
		was_pending
	}

	/// Returns `true` while the callback has neither fired nor been cancelled.
	pub fn is_pending(&self) -> bool {
		!self.shared.cancel.is_cancelled() && !self.shared.fired.load(Ordering::Acquire)
	}

	/// Returns `true` once the callback has run.
	pub fn has_fired(&self) -> bool {
		self.shared.fired.load(Ordering::Acquire)
	}
}

impl Drop for ScheduledTask {
	fn drop(&mut self) {
		self.shared.cancel.cancel();
	}
}

impl TaskTrigger {
	/// Returns `true` once the owner cancelled or dropped the task.
	pub fn is_cancelled(&self) -> bool {
		self.shared.cancel.is_cancelled()
	}

	/// Resolves when the owner cancels or drops the task.
	pub async fn cancelled(&self) {
		self.shared.cancel.cancelled().await;
	}

	/// Runs `callback` unless the task was cancelled. Returns whether it ran.
	pub fn fire(self, callback: TimerCallback) -> bool {
		if self.shared.cancel.is_cancelled() || self.shared.fired.swap(true, Ordering::AcqRel) {
			return false;
		}
		callback();
		true
	}
}

#[derive(Debug)]
struct ArmedTimer {
	generation: u64,
	task: ScheduledTask,
}

/// Holds at most one scheduled task for its owner.
///
/// Every arm is stamped with a fresh generation that is passed to the callback,
/// so a callback racing with a re-arm can detect it is stale via [`Self::retire`].
#[derive(Debug, Default)]
pub struct TimerSlot {
	clock: GenerationClock,
	current: Option<ArmedTimer>,
}

impl TimerSlot {
	/// Creates an empty slot.
	pub fn new() -> Self {
		Self::default()
	}

	/// Cancels any current task and schedules `callback` after `delay`.
	///
	/// Returns the generation handed to `callback`.
	pub fn arm<F>(&mut self, scheduler: &dyn Scheduler, delay: Duration, callback: F) -> u64
	where
		F: FnOnce(u64) + Send + 'static,
	{
		self.cancel();
		let generation = self.clock.next();
		let task = scheduler.schedule(delay, Box::new(move || callback(generation)));
		tracing::trace!(generation, delay_ms = delay.as_millis() as u64, "timer.arm");
		self.current = Some(ArmedTimer { generation, task });
		generation
	}

	/// Cancels and clears the current task. Returns `true` if one was still pending.
	pub fn cancel(&mut self) -> bool {
		let Some(armed) = self.current.take() else {
			return false;
		};
		let was_pending = armed.task.cancel();
		if was_pending {
			tracing::trace!(generation = armed.generation, "timer.cancel");
		}
		was_pending
	}

	/// Returns `true` while the current task is waiting to fire.
	pub fn is_armed(&self) -> bool {
		self.current.as_ref().is_some_and(|armed| armed.task.is_pending())
	}

	/// Generation of the task currently held, fired or not.
	pub fn generation(&self) -> Option<u64> {
		self.current.as_ref().map(|armed| armed.generation)
	}

	/// Clears the slot if `generation` is still the current one.
	///
	/// Callbacks call this first; `false` means they were superseded and must do nothing.
	pub fn retire(&mut self, generation: u64) -> bool {
		if self.generation() != Some(generation) {
			return false;
		}
		self.current = None;
		true
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use parking_lot::Mutex;

	use super::*;

	/// Scheduler that only fires when told to.
	#[derive(Default, Clone)]
	struct ManualScheduler {
		queued: Arc<Mutex<Vec<(Duration, TaskTrigger, TimerCallback)>>>,
	}

	impl Scheduler for ManualScheduler {
		fn schedule(&self, delay: Duration, callback: TimerCallback) -> ScheduledTask {
			let (task, trigger) = ScheduledTask::new();
			self.queued.lock().push((delay, trigger, callback));
			task
		}
	}

	impl ManualScheduler {
		fn fire_all(&self) -> usize {
			let queued = std::mem::take(&mut *self.queued.lock());
			queued.into_iter().map(|(_, trigger, cb)| trigger.fire(cb)).filter(|ran| *ran).count()
		}

		fn delays(&self) -> Vec<Duration> {
			self.queued.lock().iter().map(|(delay, _, _)| *delay).collect()
		}
	}

	#[test]
	fn rearming_cancels_the_previous_task() {
		let scheduler = ManualScheduler::default();
		let seen = Arc::new(Mutex::new(Vec::new()));
		let mut slot = TimerSlot::new();

		let s = Arc::clone(&seen);
		let first = slot.arm(&scheduler, Duration::from_millis(10), move |generation| s.lock().push(generation));
		assert!(slot.is_armed());

		let s = Arc::clone(&seen);
		let second = slot.arm(&scheduler, Duration::from_millis(20), move |generation| s.lock().push(generation));
		assert_ne!(first, second);
		assert_eq!(slot.generation(), Some(second));
		assert_eq!(scheduler.delays(), vec![Duration::from_millis(10), Duration::from_millis(20)]);

		assert_eq!(scheduler.fire_all(), 1, "only the replacement may fire");
		assert_eq!(*seen.lock(), vec![second]);
		assert!(!slot.is_armed());
	}

	#[test]
	fn dropping_a_task_cancels_it() {
		let scheduler = ManualScheduler::default();
		let hits = Arc::new(AtomicUsize::new(0));
		let h = Arc::clone(&hits);
		let task = scheduler.schedule(
			Duration::from_millis(5),
			Box::new(move || {
				h.fetch_add(1, Ordering::SeqCst);
			}),
		);
		assert!(task.is_pending());
		drop(task);

		assert_eq!(scheduler.fire_all(), 0);
		assert_eq!(hits.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn cancel_reports_pending_state_and_is_idempotent() {
		let scheduler = ManualScheduler::default();
		let mut slot = TimerSlot::new();
		slot.arm(&scheduler, Duration::from_millis(1), |_| {});

		assert!(slot.cancel());
		assert!(!slot.cancel());
		assert_eq!(slot.generation(), None);
	}

	#[test]
	fn retire_rejects_stale_generations() {
		let scheduler = ManualScheduler::default();
		let mut slot = TimerSlot::new();
		let stale = slot.arm(&scheduler, Duration::from_millis(1), |_| {});
		let current = slot.arm(&scheduler, Duration::from_millis(1), |_| {});

		assert!(!slot.retire(stale));
		assert!(slot.retire(current));
		assert_eq!(slot.generation(), None);
	}

	#[tokio::test(start_paused = true)]
	async fn tokio_scheduler_fires_after_delay() {
		let hits = Arc::new(AtomicUsize::new(0));
		let h = Arc::clone(&hits);
		let task = TokioScheduler.schedule(
			Duration::from_millis(50),
			Box::new(move || {
				h.fetch_add(1, Ordering::SeqCst);
			}),
		);

		tokio::time::sleep(Duration::from_millis(49)).await;
		assert_eq!(hits.load(Ordering::SeqCst), 0);
		assert!(task.is_pending());

		tokio::time::sleep(Duration::from_millis(2)).await;
		assert_eq!(hits.load(Ordering::SeqCst), 1);
		assert!(task.has_fired());
		assert!(!task.cancel());
	}

	#[tokio::test(start_paused = true)]
	async fn tokio_scheduler_respects_cancellation() {
		let hits = Arc::new(AtomicUsize::new(0));
		let h = Arc::clone(&hits);
		let task = TokioScheduler.schedule(
			Duration::from_millis(50),
			Box::new(move || {
				h.fetch_add(1, Ordering::SeqCst);
			}),
		);
		assert!(task.cancel());

		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(hits.load(Ordering::SeqCst), 0);
		assert!(!task.has_fired());
	}
}
