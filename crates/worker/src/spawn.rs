use std::future::Future;

use tokio::task::JoinHandle;

use crate::TaskClass;

/// Spawns an async task on the current runtime, tagged with a task class.
///
/// # Panics
///
/// Panics when called outside of a Tokio runtime.
pub fn spawn<F>(class: TaskClass, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tracing::trace!(task_class = class.as_str(), "worker.spawn");
	tokio::spawn(fut)
}
