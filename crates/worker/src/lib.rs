//! Scheduling and concurrency primitives shared by the waymark crates.
//!
//! * [`timer`]: cancellable delayed callbacks and the one-timer-per-owner [`TimerSlot`].
//! * [`queue`]: a FIFO queue that bounds how many operations run at once.
//! * [`token`]: generation-stamped cancellation used to discard stale work.

mod class;
pub mod queue;
mod spawn;
pub mod timer;
pub mod token;

pub use class::TaskClass;
pub use queue::{QueueError, RequestQueue, Submission, SubmittedStream};
pub use spawn::spawn;
pub use timer::{ScheduledTask, Scheduler, TaskTrigger, TimerCallback, TimerSlot, TokioScheduler};
pub use token::{GenerationClock, GenerationToken};
