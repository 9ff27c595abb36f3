use std::sync::Arc;

use crossbeam_channel::select;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::worker::WORKER_RESTART_DELAY;
use super::{unexpected_state, Step};
use crate::context::RequestContext;
use crate::task::{PendingTask, TaskWorker};
use crate::thread::execution::ExecutionThread;
use crate::thread::state::StateId;

#[derive(Default)]
struct TaskThreadState {
    bootstrap: Option<Arc<RequestContext>>,
    current: Option<Arc<PendingTask>>,
}

/// Runs a task worker's dispatcher script, which pulls tasks through
/// [`ScriptScope::wait_for_task`](crate::ScriptScope::wait_for_task).
pub struct TaskWorkerHandler {
    task_worker: Arc<TaskWorker>,
    inner: Mutex<TaskThreadState>,
}

impl TaskWorkerHandler {
    pub(crate) fn new(task_worker: Arc<TaskWorker>) -> Self {
        Self {
            task_worker,
            inner: Mutex::new(TaskThreadState::default()),
        }
    }

    pub fn task_worker(&self) -> &Arc<TaskWorker> {
        &self.task_worker
    }

    pub(crate) fn before_script_execution(&self, thread: &Arc<ExecutionThread>) -> Step {
        let state = thread.state();
        loop {
            match state.get() {
                StateId::TransitionRequested => {
                    self.task_worker.detach_thread(thread);
                    return Step::Transition;
                }
                StateId::TransitionComplete => {
                    self.task_worker.attach_thread(thread);
                    state.set(StateId::Ready);
                    return self.setup_script(thread);
                }
                StateId::Ready => return self.setup_script(thread),
                StateId::Restarting => {
                    state.set(StateId::Yielding);
                    state.wait_for(&[StateId::Ready, StateId::ShuttingDown]);
                }
                StateId::ShuttingDown => {
                    self.task_worker.detach_thread(thread);
                    return Step::Stop;
                }
                _ => {
                    self.task_worker.detach_thread(thread);
                    return unexpected_state(thread, "task worker");
                }
            }
        }
    }

    fn setup_script(&self, thread: &ExecutionThread) -> Step {
        self.inner.lock().bootstrap = Some(Arc::new(RequestContext::bootstrap(
            self.task_worker.file_name().to_path_buf(),
            self.task_worker.env().clone(),
            None,
        )));
        debug!(thread = thread.index(), task_worker = %self.task_worker.name(), "starting task worker script");
        Step::Execute(self.task_worker.file_name().to_string_lossy().into_owned())
    }

    pub(crate) fn after_script_execution(&self, thread: &Arc<ExecutionThread>, exit_status: i32) {
        let leftover = {
            let mut inner = self.inner.lock();
            inner.bootstrap = None;
            inner.current.take()
        };
        if let Some(task) = leftover {
            task.finish(None);
        }

        if exit_status != 0 {
            warn!(
                thread = thread.index(),
                task_worker = %self.task_worker.name(),
                exit_status,
                "task worker script exited with an error, restarting"
            );
            std::thread::sleep(WORKER_RESTART_DELAY);
        }
    }

    /// Blocks until a message task arrives. Callback tasks are run inline
    /// and never returned to the script.
    ///
    /// Returns `None` once the drain signal closes.
    pub(crate) fn wait_for_task(&self, thread: &Arc<ExecutionThread>) -> Option<Arc<PendingTask>> {
        let state = thread.state();
        self.inner.lock().bootstrap = None;

        let drain = thread.drain_signal();
        let tasks = self.task_worker.receiver();
        loop {
            state.mark_as_waiting(true);
            let received = select! {
                recv(drain.receiver()) -> _ => None,
                recv(tasks) -> task => task.ok(),
            };
            state.mark_as_waiting(false);

            let task = received?;
            if task.run_callback() {
                continue;
            }

            self.inner.lock().current = Some(Arc::clone(&task));
            debug!(thread = thread.index(), task_worker = %self.task_worker.name(), "task received");
            return Some(task);
        }
    }

    pub(crate) fn finish_task(&self, result: Option<String>) -> bool {
        let Some(task) = self.inner.lock().current.take() else {
            return false;
        };
        task.finish(result);
        true
    }

    pub(crate) fn request_context(&self) -> Option<Arc<RequestContext>> {
        self.inner.lock().bootstrap.clone()
    }
}
