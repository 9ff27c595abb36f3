//! Task workers: background scripts fed from a bounded queue.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::config::TaskWorkerConfig;
use crate::error::{ConfigError, RuntimeError};
use crate::thread::{ExecutionThread, Signal};
use crate::worker::resolve_script_path;

type TaskCallback = Box<dyn FnOnce() + Send + 'static>;

/// A task handed to a task worker, and the handle its dispatcher waits on.
///
/// A task carries either a message for the task worker script or a host
/// callback run directly on a task worker thread.
pub struct PendingTask {
    message: Option<String>,
    callback: Mutex<Option<TaskCallback>>,
    result: Mutex<Option<String>>,
    done: Signal,
}

impl PendingTask {
    pub(crate) fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            callback: Mutex::new(None),
            result: Mutex::new(None),
            done: Signal::new(),
        }
    }

    pub(crate) fn callback(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            message: None,
            callback: Mutex::new(Some(Box::new(callback))),
            result: Mutex::new(None),
            done: Signal::new(),
        }
    }

    /// The payload for the task worker script. `None` for callback tasks.
    pub fn payload(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_closed()
    }

    /// Blocks until the task finished and returns its result.
    pub fn wait_for_completion(&self) -> Option<String> {
        self.done.wait();
        self.result.lock().clone()
    }

    /// Like [`wait_for_completion`](Self::wait_for_completion) with a deadline.
    pub fn wait_for_completion_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<String>, RuntimeError> {
        if self.done.wait_timeout(timeout) {
            Ok(self.result.lock().clone())
        } else {
            Err(RuntimeError::TaskTimeout(timeout))
        }
    }

    /// Waits on the blocking pool so async callers do not stall their executor.
    pub async fn wait_for_completion_async(self: Arc<Self>) -> Option<String> {
        tokio::task::spawn_blocking(move || self.wait_for_completion())
            .await
            .ok()
            .flatten()
    }

    /// Stores `result` and wakes the waiters. Only the first call counts.
    pub(crate) fn finish(&self, result: Option<String>) -> bool {
        let mut slot = self.result.lock();
        if self.done.is_closed() {
            return false;
        }
        *slot = result;
        self.done.close()
    }

    /// Runs the callback if this is a callback task. Returns `false` for message tasks.
    pub(crate) fn run_callback(&self) -> bool {
        let Some(callback) = self.callback.lock().take() else {
            return false;
        };
        if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
            error!("task callback panicked");
        }
        self.finish(None);
        true
    }
}

impl fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTask")
            .field("message", &self.message)
            .field("has_callback", &self.callback.lock().is_some())
            .field("is_done", &self.is_done())
            .finish()
    }
}

/// A named task worker script and its queue.
pub struct TaskWorker {
    name: String,
    file_name: PathBuf,
    num: usize,
    env: HashMap<String, String>,
    max_queue_len: usize,
    tasks_tx: Sender<Arc<PendingTask>>,
    tasks_rx: Receiver<Arc<PendingTask>>,
    threads: RwLock<Vec<Arc<ExecutionThread>>>,
}

impl TaskWorker {
    pub fn new(config: &TaskWorkerConfig, existing: &[Arc<TaskWorker>]) -> Result<Self, ConfigError> {
        if existing.iter().any(|tw| tw.name == config.name) {
            return Err(ConfigError::DuplicateTaskWorkerName(config.name.clone()));
        }
        let file_name = resolve_script_path(&config.file_name)?;
        let (tasks_tx, tasks_rx) = bounded(config.max_queue_len);

        Ok(Self {
            name: config.name.clone(),
            file_name,
            num: config.effective_num(),
            env: config.env.clone(),
            max_queue_len: config.max_queue_len,
            tasks_tx,
            tasks_rx,
            threads: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_name(&self) -> &Path {
        &self.file_name
    }

    pub fn num(&self) -> usize {
        self.num
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn max_queue_len(&self) -> usize {
        self.max_queue_len
    }

    /// Tasks waiting for a thread.
    pub fn queue_len(&self) -> usize {
        self.tasks_tx.len()
    }

    pub(crate) fn receiver(&self) -> &Receiver<Arc<PendingTask>> {
        &self.tasks_rx
    }

    pub(crate) fn attach_thread(&self, thread: &Arc<ExecutionThread>) {
        let mut threads = self.threads.write();
        if !threads.iter().any(|t| t.index() == thread.index()) {
            threads.push(Arc::clone(thread));
        }
    }

    pub(crate) fn detach_thread(&self, thread: &ExecutionThread) {
        self.threads.write().retain(|t| t.index() != thread.index());
    }

    pub fn count_threads(&self) -> usize {
        self.threads.read().len()
    }

    pub fn threads(&self) -> Vec<Arc<ExecutionThread>> {
        self.threads.read().clone()
    }

    /// Enqueues `task` without blocking.
    pub(crate) fn dispatch(&self, task: Arc<PendingTask>) -> Result<(), RuntimeError> {
        match self.tasks_tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                error!(task_worker = %self.name, "task worker queue is full, dropping task");
                Err(RuntimeError::TaskQueueFull(self.name.clone()))
            }
            Err(TrySendError::Disconnected(_)) => Err(RuntimeError::NotRunning),
        }
    }

    /// Completes every queued task without a result. Returns how many were dropped.
    pub(crate) fn drain_pending(&self) -> usize {
        let mut drained = 0;
        for task in self.tasks_rx.try_iter() {
            task.finish(None);
            drained += 1;
        }
        if drained > 0 {
            debug!(task_worker = %self.name, drained, "completed queued tasks without result");
        }
        drained
    }
}

impl fmt::Debug for TaskWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskWorker")
            .field("name", &self.name)
            .field("file_name", &self.file_name)
            .field("num", &self.num)
            .field("queue_len", &self.queue_len())
            .field("threads", &self.count_threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_is_applied_once() {
        let task = PendingTask::message("job");
        assert!(task.finish(Some("first".into())));
        assert!(!task.finish(Some("second".into())));
        assert_eq!(task.wait_for_completion(), Some("first".to_string()));
    }

    #[test]
    fn callbacks_complete_the_task() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let task = PendingTask::callback(move || tx.send(42).unwrap());
        assert!(task.run_callback());
        assert_eq!(rx.recv().unwrap(), 42);
        assert!(task.is_done());
        assert!(!PendingTask::message("job").run_callback());
    }

    #[test]
    fn panicking_callback_still_completes() {
        let task = PendingTask::callback(|| panic!("boom"));
        assert!(task.run_callback());
        assert_eq!(task.wait_for_completion(), None);
    }

    #[test]
    fn unfinished_task_times_out() {
        let task = PendingTask::message("job");
        assert!(task
            .wait_for_completion_timeout(Duration::from_millis(10))
            .is_err());
    }
}
