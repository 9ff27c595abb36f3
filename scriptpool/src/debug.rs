use serde::Serialize;

use crate::thread::ExecutionThread;

/// Snapshot of every booted thread, as returned by
/// [`Runtime::debug_state`](crate::Runtime::debug_state).
#[derive(Debug, Clone, Serialize)]
pub struct DebugState {
    pub threads: Vec<ThreadDebugState>,
    /// Capacity not booted yet.
    pub reserved_thread_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadDebugState {
    pub index: usize,
    pub name: String,
    pub state: String,
    pub is_waiting: bool,
    pub is_busy: bool,
    pub waiting_since_ms: u64,
}

impl ThreadDebugState {
    pub(crate) fn of(thread: &ExecutionThread) -> Self {
        let state = thread.state();
        let is_waiting = state.is_in_waiting_state();
        Self {
            index: thread.index(),
            name: thread.name(),
            state: state.name().to_string(),
            is_waiting,
            is_busy: !is_waiting,
            waiting_since_ms: state.wait_time(),
        }
    }
}
