use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::select;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{unexpected_state, Step};
use crate::backoff::ExponentialBackoff;
use crate::context::RequestContext;
use crate::error::RuntimeError;
use crate::metrics::StopReason;
use crate::thread::execution::ExecutionThread;
use crate::thread::state::StateId;
use crate::worker::Worker;

/// Delay before a failed worker script is started again when no backoff is configured.
pub const WORKER_RESTART_DELAY: Duration = Duration::from_millis(250);

#[derive(Default)]
struct WorkerThreadState {
    /// Context held while the script boots, before its first request.
    bootstrap: Option<Arc<RequestContext>>,
    active: Option<Arc<RequestContext>>,
    is_booting_script: bool,
}

/// Keeps a worker script running in a loop. The script pulls requests
/// itself through [`ScriptScope::wait_for_worker_request`](crate::ScriptScope::wait_for_worker_request).
pub struct WorkerHandler {
    worker: Arc<Worker>,
    backoff: ExponentialBackoff,
    inner: Mutex<WorkerThreadState>,
}

impl WorkerHandler {
    pub(crate) fn new(worker: Arc<Worker>, min_backoff: Duration, max_backoff: Duration) -> Self {
        let backoff = ExponentialBackoff::new(
            min_backoff,
            max_backoff,
            worker.max_consecutive_failures(),
        );
        Self {
            worker,
            backoff,
            inner: Mutex::new(WorkerThreadState::default()),
        }
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub(crate) fn before_script_execution(&self, thread: &Arc<ExecutionThread>) -> Step {
        let state = thread.state();
        loop {
            match state.get() {
                StateId::TransitionRequested => {
                    self.notify_shutdown(thread);
                    self.worker.detach_thread(thread);
                    return Step::Transition;
                }
                StateId::Restarting => {
                    self.notify_shutdown(thread);
                    state.set(StateId::Yielding);
                    state.wait_for(&[StateId::Ready, StateId::ShuttingDown]);
                }
                current @ (StateId::Ready | StateId::TransitionComplete) => {
                    if current == StateId::TransitionComplete {
                        self.worker.attach_thread(thread);
                    }
                    if let Some(hook) = self.worker.on_thread_ready() {
                        hook(thread.index());
                    }
                    self.setup_script(thread);
                    return Step::Execute(self.worker.file_name().to_string_lossy().into_owned());
                }
                StateId::ShuttingDown => {
                    self.notify_shutdown(thread);
                    self.worker.detach_thread(thread);
                    return Step::Stop;
                }
                _ => {
                    self.worker.detach_thread(thread);
                    return unexpected_state(thread, "worker");
                }
            }
        }
    }

    fn notify_shutdown(&self, thread: &ExecutionThread) {
        if let Some(hook) = self.worker.on_thread_shutdown() {
            hook(thread.index());
        }
    }

    fn setup_script(&self, thread: &ExecutionThread) {
        let metrics = &thread.shared().metrics;
        metrics.start_worker(self.worker.name());

        let mut inner = self.inner.lock();
        inner.bootstrap = Some(Arc::new(RequestContext::bootstrap(
            self.worker.file_name().to_path_buf(),
            self.worker.env().clone(),
            Some(Arc::clone(&self.worker)),
        )));
        inner.is_booting_script = true;
        debug!(thread = thread.index(), worker = %self.worker.name(), "starting worker script");
    }

    pub(crate) fn after_script_execution(&self, thread: &Arc<ExecutionThread>, exit_status: i32) {
        let (was_booting, leftover) = {
            let mut inner = self.inner.lock();
            inner.bootstrap = None;
            (inner.is_booting_script, inner.active.take())
        };
        // the script ended without finishing its request
        if let Some(ctx) = leftover {
            ctx.close();
        }

        let shared = thread.shared();
        let name = self.worker.name();

        if exit_status == 0 && !was_booting {
            let reason = match thread.state().get() {
                StateId::ShuttingDown | StateId::TransitionRequested => StopReason::Shutdown,
                _ => StopReason::Restart,
            };
            shared.metrics.stop_worker(name, reason);
            debug!(thread = thread.index(), worker = %name, ?reason, "worker script stopped");
            return;
        }

        let reason = if was_booting {
            StopReason::BootFailure
        } else {
            StopReason::Crash
        };
        shared.metrics.stop_worker(name, reason);
        self.worker.record_failure();

        if !was_booting {
            warn!(thread = thread.index(), worker = %name, exit_status, "worker script crashed, restarting");
            return;
        }

        // the script never reached its request loop
        if !shared.watcher_enabled && !thread.state().is(StateId::Ready) {
            error!(thread = thread.index(), worker = %name, exit_status, "worker script failed to boot");
            shared.report_startup_failure(RuntimeError::WorkerBoot {
                worker: name.to_string(),
                reason: format!("script exited with status {exit_status} before handling requests"),
            });
            thread.state().set(StateId::ShuttingDown);
            return;
        }

        if self.backoff.record_failure() {
            error!(
                thread = thread.index(),
                worker = %name,
                failures = self.backoff.failure_count(),
                "too many consecutive worker failures"
            );
            shared.report_startup_failure(RuntimeError::WorkerBoot {
                worker: name.to_string(),
                reason: format!(
                    "{} consecutive failures",
                    self.backoff.failure_count()
                ),
            });
            thread.state().set(StateId::ShuttingDown);
            return;
        }

        if shared.watcher_enabled {
            warn!(thread = thread.index(), worker = %name, exit_status, "(watcher enabled) worker script has not reached its request loop");
        } else {
            error!(thread = thread.index(), worker = %name, exit_status, "worker script has failed on restart");
        }

        if self.worker.max_consecutive_failures().is_some() {
            self.backoff.wait();
        } else {
            std::thread::sleep(WORKER_RESTART_DELAY);
        }
    }

    /// Called by the worker script between two requests.
    ///
    /// Returns `None` when the script should stop looping: the drain signal
    /// closed because of a restart, a role change or shutdown.
    pub(crate) fn wait_for_worker_request(
        &self,
        thread: &Arc<ExecutionThread>,
    ) -> Option<Arc<RequestContext>> {
        let state = thread.state();
        let shared = thread.shared();

        {
            let mut inner = self.inner.lock();
            if inner.is_booting_script {
                inner.is_booting_script = false;
                inner.bootstrap = None;
                self.backoff.record_success();
                shared.metrics.ready_worker(self.worker.name());
            }
        }

        if state.compare_and_swap(StateId::TransitionComplete, StateId::Ready) {
            info!(thread = thread.index(), worker = %self.worker.name(), "worker thread ready");
        }

        debug!(thread = thread.index(), worker = %self.worker.name(), "waiting for request");

        let drain = thread.drain_signal();
        let queue = self.worker.pool().receiver(thread.is_low_latency());

        state.mark_as_waiting(true);
        let received = select! {
            recv(drain.receiver()) -> _ => None,
            recv(thread.request_receiver()) -> ctx => ctx.ok(),
            recv(queue) -> ctx => ctx.ok(),
        };
        state.mark_as_waiting(false);

        let Some(ctx) = received else {
            if state.is(StateId::Restarting) {
                shared.executor.reset_cache(thread.index());
            }
            debug!(thread = thread.index(), worker = %self.worker.name(), state = %state.get(), "worker script leaving its request loop");
            return None;
        };

        self.inner.lock().active = Some(Arc::clone(&ctx));
        debug!(thread = thread.index(), worker = %self.worker.name(), request = %ctx.id(), "request handling started");
        Some(ctx)
    }

    /// Completes the request currently held by the worker script.
    pub(crate) fn finish_worker_request(
        &self,
        thread: &ExecutionThread,
        handler_return: Option<serde_json::Value>,
    ) -> bool {
        let Some(ctx) = self.inner.lock().active.take() else {
            return false;
        };
        ctx.set_handler_return(handler_return);
        ctx.close();
        debug!(thread = thread.index(), worker = %self.worker.name(), request = %ctx.id(), "request handling finished");
        true
    }

    pub(crate) fn request_context(&self) -> Option<Arc<RequestContext>> {
        let inner = self.inner.lock();
        inner.active.clone().or_else(|| inner.bootstrap.clone())
    }
}
