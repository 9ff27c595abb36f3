use std::sync::Arc;

use crossbeam_channel::select;
use http::StatusCode;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{unexpected_state, Step};
use crate::context::RequestContext;
use crate::scheduler::ThreadPool;
use crate::thread::execution::ExecutionThread;
use crate::thread::state::StateId;

/// Serves one-shot scripts: every request runs its own script to completion.
pub struct RegularHandler {
    pool: Arc<ThreadPool>,
    active: Mutex<Option<Arc<RequestContext>>>,
}

impl RegularHandler {
    pub(crate) fn new(pool: Arc<ThreadPool>) -> Self {
        Self {
            pool,
            active: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub(crate) fn before_script_execution(&self, thread: &Arc<ExecutionThread>) -> Step {
        let state = thread.state();
        loop {
            match state.get() {
                StateId::TransitionRequested => {
                    self.pool.detach(thread);
                    return Step::Transition;
                }
                StateId::TransitionComplete => {
                    self.pool.attach(thread);
                    state.set(StateId::Ready);
                }
                StateId::Ready => {}
                StateId::ShuttingDown => {
                    self.pool.detach(thread);
                    return Step::Stop;
                }
                _ => {
                    self.pool.detach(thread);
                    return unexpected_state(thread, "regular");
                }
            }

            if let Some(script) = self.wait_for_request(thread) {
                return Step::Execute(script);
            }
        }
    }

    /// Blocks until a request arrives or the drain signal closes.
    fn wait_for_request(&self, thread: &Arc<ExecutionThread>) -> Option<String> {
        let state = thread.state();
        let drain = thread.drain_signal();
        let queue = self.pool.receiver(thread.is_low_latency());

        state.mark_as_waiting(true);
        let received = select! {
            recv(drain.receiver()) -> _ => None,
            recv(thread.request_receiver()) -> ctx => ctx.ok(),
            recv(queue) -> ctx => ctx.ok(),
        };
        state.mark_as_waiting(false);

        let ctx = received?;
        let script = ctx.script_filename();
        if script.is_empty() {
            warn!(thread = thread.index(), request = %ctx.id(), "request has no script to execute");
            ctx.reject(StatusCode::NOT_FOUND, "no script to execute");
            return None;
        }

        debug!(thread = thread.index(), request = %ctx.id(), script = %script, "request handling started");
        *self.active.lock() = Some(ctx);
        Some(script)
    }

    pub(crate) fn after_script_execution(&self, thread: &Arc<ExecutionThread>, exit_status: i32) {
        let ctx = self.active.lock().take();
        if let Some(ctx) = ctx {
            debug!(thread = thread.index(), request = %ctx.id(), exit_status, "request handling finished");
            ctx.close();
        }
    }

    pub(crate) fn request_context(&self) -> Option<Arc<RequestContext>> {
        self.active.lock().clone()
    }
}
