use std::sync::Arc;

use tracing::warn;

use super::{unexpected_state, Step};
use crate::thread::execution::ExecutionThread;
use crate::thread::state::StateId;

/// A booted thread without work. It parks until a new role is installed or
/// the thread is shut down, and never executes a script.
#[derive(Debug, Clone, Copy, Default)]
pub struct InactiveHandler;

impl InactiveHandler {
    pub(crate) fn before_script_execution(&self, thread: &Arc<ExecutionThread>) -> Step {
        let state = thread.state();
        loop {
            match state.get() {
                StateId::TransitionRequested => return Step::Transition,
                StateId::Booting | StateId::TransitionComplete => {
                    state.set(StateId::Inactive);
                    state.mark_as_waiting(true);
                    state.wait_for(&[StateId::TransitionRequested, StateId::ShuttingDown]);
                    state.mark_as_waiting(false);
                }
                StateId::ShuttingDown => return Step::Stop,
                _ => return unexpected_state(thread, "inactive"),
            }
        }
    }

    pub(crate) fn after_script_execution(&self, thread: &Arc<ExecutionThread>, exit_status: i32) {
        warn!(
            thread = thread.index(),
            exit_status, "inactive thread executed a script"
        );
    }
}
