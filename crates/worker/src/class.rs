/// Execution classes used to tag spawned coordination work in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// Work a caller is actively waiting on (queued requests, broadcast recomputes).
	Interactive,
	/// Deferred housekeeping (timer callbacks, write-buffer flushes).
	Background,
}

impl TaskClass {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Interactive => "interactive",
			Self::Background => "background",
		}
	}
}
