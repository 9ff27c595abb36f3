//! # Runtime
//!
//! The [`Runtime`] owns every execution thread, the regular pool, the workers
//! and the task workers. It boots the threads, assigns their roles, routes
//! requests and tears everything down again.
//!
//! ## Key Concepts
//! - Reserved capacity: `max_threads` threads are allocated up front, only
//!   `num_threads` are booted. The rest is claimed by the autoscaler.
//! - Routing: a request addressed to a worker by name, or whose script path
//!   matches a path-matching worker, goes to that worker. Everything else is
//!   served by the regular pool.
//! - Scaling lock: autoscaling, worker restarts and admin conversions are
//!   serialized so that one thread is never claimed twice.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use http::{Request, Response};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::config::{RuntimeConfig, ThreadCounts, MODULE_WORKER_PREFIX};
use crate::context::RequestContext;
use crate::debug::{DebugState, ThreadDebugState};
use crate::error::{ConfigError, RequestError, Result, RuntimeError};
use crate::executor::ScriptExecutor;
use crate::metrics::{Metrics, NullMetrics};
use crate::scheduler::scaling::ScalingState;
use crate::scheduler::{AdmissionPolicy, LatencyTracker, ScalingConfig, ThreadPool};
use crate::task::{PendingTask, TaskWorker};
use crate::thread::handler::{RegularHandler, TaskWorkerHandler, WorkerHandler};
use crate::thread::{ExecutionThread, Signal, StateId, ThreadHandler, ThreadState};
use crate::worker::{clean_path, Worker};
use crate::{log_error, log_runtime};

type ScaleChannel = (Sender<Arc<RequestContext>>, Receiver<Arc<RequestContext>>);

/// State every execution thread can reach.
pub(crate) struct RuntimeShared {
    pub(crate) executor: Arc<dyn ScriptExecutor>,
    pub(crate) metrics: Arc<dyn Metrics>,
    /// `Ready` while the runtime accepts work and threads may be re-booted.
    pub(crate) main_state: ThreadState,
    pub(crate) watcher_enabled: bool,
    pub(crate) admission: AdmissionPolicy,
    pub(crate) worker_min_backoff: Duration,
    pub(crate) worker_max_backoff: Duration,
    pub(crate) latency: LatencyTracker,
    /// Only present when there is room to scale.
    scale: Option<ScaleChannel>,
    startup_failures: (Sender<RuntimeError>, Receiver<RuntimeError>),
}

impl RuntimeShared {
    fn new(
        config: &RuntimeConfig,
        counts: ThreadCounts,
        executor: Arc<dyn ScriptExecutor>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            executor,
            metrics,
            main_state: ThreadState::with_state(StateId::Booting),
            watcher_enabled: config.watcher_enabled(),
            admission: AdmissionPolicy {
                max_wait_time: config.max_wait_time,
                min_stall_time: config.min_stall_time,
            },
            worker_min_backoff: config.worker_min_backoff,
            worker_max_backoff: config.worker_max_backoff,
            latency: LatencyTracker::new(
                config.slow_request_threshold,
                config.slow_thread_percentile,
                config.latency_table_capacity,
            ),
            scale: (counts.max_threads > counts.num_threads).then(|| bounded(0)),
            startup_failures: unbounded(),
        }
    }

    pub(crate) fn scale_sender(&self) -> Option<&Sender<Arc<RequestContext>>> {
        self.scale.as_ref().map(|(tx, _)| tx)
    }

    pub(crate) fn scale_receiver(&self) -> Option<&Receiver<Arc<RequestContext>>> {
        self.scale.as_ref().map(|(_, rx)| rx)
    }

    /// Records a failure that must abort startup.
    pub(crate) fn report_startup_failure(&self, err: RuntimeError) {
        // the receiver lives as long as self
        let _ = self.startup_failures.0.send(err);
    }

    pub(crate) fn take_startup_failure(&self) -> Option<RuntimeError> {
        self.startup_failures.1.try_recv().ok()
    }
}

pub(crate) struct RuntimeInner {
    pub(crate) shared: Arc<RuntimeShared>,
    pub(crate) counts: ThreadCounts,
    pub(crate) scaling_config: ScalingConfig,
    document_root: PathBuf,
    threads: RwLock<Vec<Arc<ExecutionThread>>>,
    regular_pool: Arc<ThreadPool>,
    workers: Vec<Arc<Worker>>,
    task_workers: Vec<Arc<TaskWorker>>,
    pub(crate) scaling: Mutex<ScalingState>,
    /// Closed on shutdown; stops the autoscaler loops.
    pub(crate) done: Arc<Signal>,
    pub(crate) background: Mutex<Vec<JoinHandle<()>>>,
}

/// Which roles are assigned once the threads are booted.
#[derive(Clone, Copy, PartialEq, Eq)]
enum BootMode {
    Serve,
    Inactive,
}

/// Handle to a running pool of execution threads. Cheap to clone.
///
/// The runtime shuts down when [`shutdown`](Self::shutdown) is called or
/// when the last handle is dropped.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Boots the threads, starts every worker and task worker and turns the
    /// remaining threads into regular threads.
    ///
    /// Fails if the configuration is invalid or a worker script cannot boot.
    pub fn start(config: RuntimeConfig, executor: impl ScriptExecutor) -> Result<Self> {
        Self::start_with_metrics(config, executor, NullMetrics)
    }

    pub fn start_with_metrics(
        config: RuntimeConfig,
        executor: impl ScriptExecutor,
        metrics: impl Metrics,
    ) -> Result<Self> {
        let inner = RuntimeInner::boot(config, Arc::new(executor), Arc::new(metrics), BootMode::Serve)?;
        Ok(Self { inner })
    }

    /// Boots `num_threads` threads and leaves all of them inactive. Roles are
    /// assigned later through the `convert_thread_to_*` operations.
    pub fn start_inactive(config: RuntimeConfig, executor: impl ScriptExecutor) -> Result<Self> {
        let inner = RuntimeInner::boot(
            config,
            Arc::new(executor),
            Arc::new(NullMetrics),
            BootMode::Inactive,
        )?;
        Ok(Self { inner })
    }

    /// Stops every thread and completes queued tasks without a result. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.inner.shared.main_state.is(StateId::Ready)
    }

    // --- Requests ---

    /// Serves an HTTP request and returns the response the script produced.
    pub fn serve(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let ctx = self.serve_context(RequestContext::new(request))?;
        Ok(ctx.take_response())
    }

    /// Serves `ctx` and blocks until it is closed. The returned context holds
    /// the response and, for worker requests, the handler return value.
    pub fn serve_context(&self, ctx: RequestContext) -> Result<Arc<RequestContext>> {
        let ctx = self.inner.prepare(ctx)?;
        self.inner.route(&ctx)?;
        Ok(ctx)
    }

    /// [`serve`](Self::serve) on tokio's blocking pool.
    pub async fn serve_async(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let runtime = self.clone();
        tokio::task::spawn_blocking(move || runtime.serve(request))
            .await
            .map_err(|err| RuntimeError::Other(anyhow::Error::new(err)))?
    }

    // --- Workers ---

    /// Lets every worker thread finish its current request, then restarts
    /// the worker scripts.
    pub fn restart_workers(&self) {
        self.inner.restart_workers();
    }

    pub async fn restart_workers_async(&self) -> Result<()> {
        let runtime = self.clone();
        tokio::task::spawn_blocking(move || runtime.restart_workers())
            .await
            .map_err(|err| RuntimeError::Other(anyhow::Error::new(err)))
    }

    /// Stops the worker scripts without restarting them. Returns the number
    /// of threads that were drained.
    pub fn drain_workers(&self) -> usize {
        let _scaling = self.inner.scaling.lock();
        self.inner.drain_worker_threads().len()
    }

    pub fn worker(&self, name: &str) -> Option<Arc<Worker>> {
        self.inner.find_worker(name)
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.inner.workers
    }

    // --- Tasks ---

    /// Queues `payload` for the task worker called `name`, or the first task
    /// worker when `name` is `None`.
    pub fn dispatch_task(
        &self,
        payload: impl Into<String>,
        name: Option<&str>,
    ) -> Result<Arc<PendingTask>> {
        self.inner.ensure_running()?;
        let task_worker = self.inner.find_task_worker(name)?;
        let task = Arc::new(PendingTask::message(payload));
        task_worker.dispatch(Arc::clone(&task))?;
        Ok(task)
    }

    /// Runs `callback` on a thread of the selected task worker.
    pub fn execute_on_task_worker(
        &self,
        callback: impl FnOnce() + Send + 'static,
        name: Option<&str>,
    ) -> Result<Arc<PendingTask>> {
        self.inner.ensure_running()?;
        let task_worker = self.inner.find_task_worker(name)?;
        let task = Arc::new(PendingTask::callback(callback));
        task_worker.dispatch(Arc::clone(&task))?;
        Ok(task)
    }

    pub fn task_worker(&self, name: &str) -> Option<Arc<TaskWorker>> {
        self.inner.task_workers.iter().find(|tw| tw.name() == name).cloned()
    }

    pub fn task_workers(&self) -> &[Arc<TaskWorker>] {
        &self.inner.task_workers
    }

    // --- Introspection ---

    pub fn debug_state(&self) -> DebugState {
        let threads = self.inner.threads.read();
        let mut state = DebugState {
            threads: Vec::new(),
            reserved_thread_count: 0,
        };
        for thread in threads.iter() {
            if thread.state().is(StateId::Reserved) {
                state.reserved_thread_count += 1;
            } else {
                state.threads.push(ThreadDebugState::of(thread));
            }
        }
        state
    }

    pub fn thread(&self, index: usize) -> Option<Arc<ExecutionThread>> {
        self.inner.threads.read().get(index).cloned()
    }

    pub fn thread_states(&self) -> Vec<StateId> {
        self.inner
            .threads
            .read()
            .iter()
            .map(|t| t.state().get())
            .collect()
    }

    /// Threads that are booted and not yet stopped.
    pub fn thread_count(&self) -> usize {
        self.inner
            .threads
            .read()
            .iter()
            .filter(|t| !matches!(t.state().get(), StateId::Reserved | StateId::Done))
            .count()
    }

    pub fn regular_thread_count(&self) -> usize {
        self.inner.regular_pool.len()
    }

    pub fn counts(&self) -> ThreadCounts {
        self.inner.counts
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.inner.shared.latency
    }

    // --- Thread administration ---

    pub fn convert_thread_to_regular(&self, index: usize) -> Result<()> {
        let thread = self.inner.existing_thread(index)?;
        let _scaling = self.inner.scaling.lock();
        self.inner.expect_transition(&thread, self.inner.convert_to_regular(&thread))?;
        thread
            .state()
            .wait_for(&[StateId::Ready, StateId::ShuttingDown, StateId::Done]);
        Ok(())
    }

    pub fn convert_thread_to_worker(&self, index: usize, name: &str) -> Result<()> {
        let thread = self.inner.existing_thread(index)?;
        let worker = self
            .inner
            .find_worker(name)
            .ok_or_else(|| RequestError::UnknownWorker(name.to_string()))?;
        let _scaling = self.inner.scaling.lock();
        self.inner
            .expect_transition(&thread, self.inner.convert_to_worker(&thread, &worker))?;
        thread
            .state()
            .wait_for(&[StateId::Ready, StateId::ShuttingDown, StateId::Done]);
        Ok(())
    }

    pub fn convert_thread_to_inactive(&self, index: usize) -> Result<()> {
        let thread = self.inner.existing_thread(index)?;
        let _scaling = self.inner.scaling.lock();
        self.inner.expect_transition(&thread, self.inner.convert_to_inactive(&thread))?;
        thread
            .state()
            .wait_for(&[StateId::Inactive, StateId::ShuttingDown, StateId::Done]);
        Ok(())
    }

    /// Stops one thread. It returns to `Reserved` and can be booted again.
    pub fn shutdown_thread(&self, index: usize) -> Result<()> {
        self.inner.existing_thread(index)?.shutdown();
        Ok(())
    }

    /// Boots a reserved thread. It comes up inactive.
    pub fn boot_thread(&self, index: usize) -> Result<()> {
        self.inner.existing_thread(index)?.boot()
    }

    // --- Scaling ---

    pub fn scale_regular_thread(&self) -> Result<usize> {
        self.inner.scale_regular_thread().map(|t| t.index())
    }

    pub fn scale_worker_thread(&self, name: &str) -> Result<usize> {
        let worker = self
            .inner
            .find_worker(name)
            .ok_or_else(|| RequestError::UnknownWorker(name.to_string()))?;
        self.inner.scale_worker_thread(&worker).map(|t| t.index())
    }

    /// Runs one downscaling pass. Returns the number of threads stopped.
    pub fn deactivate_threads(&self) -> usize {
        self.inner.deactivate_threads()
    }

    pub fn autoscaled_thread_count(&self) -> usize {
        self.inner.autoscaled_thread_count()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.inner.shared.main_state.get())
            .field("counts", &self.inner.counts)
            .field("workers", &self.inner.workers)
            .field("task_workers", &self.inner.task_workers)
            .field("regular_threads", &self.inner.regular_pool.len())
            .finish()
    }
}

impl RuntimeInner {
    fn boot(
        config: RuntimeConfig,
        executor: Arc<dyn ScriptExecutor>,
        metrics: Arc<dyn Metrics>,
        mode: BootMode,
    ) -> Result<Arc<Self>> {
        let counts = config.resolve_thread_counts()?;
        let document_root = std::path::absolute(&config.document_root)
            .map(|root| clean_path(&root))
            .map_err(|err| ConfigError::InvalidDocumentRoot {
                path: config.document_root.clone(),
                reason: err.to_string(),
            })?;

        let mut workers: Vec<Arc<Worker>> = Vec::with_capacity(config.workers.len());
        for worker_config in &config.workers {
            let worker = Worker::new(worker_config, &workers)?;
            workers.push(Arc::new(worker));
        }
        let mut task_workers: Vec<Arc<TaskWorker>> = Vec::with_capacity(config.task_workers.len());
        for task_config in &config.task_workers {
            let task_worker = TaskWorker::new(task_config, &task_workers)?;
            task_workers.push(Arc::new(task_worker));
        }

        let shared = Arc::new(RuntimeShared::new(&config, counts, executor, metrics));
        let threads = (0..counts.max_threads)
            .map(|index| Arc::new(ExecutionThread::new(index, Arc::clone(&shared))))
            .collect();

        let inner = Arc::new(Self {
            shared,
            counts,
            scaling_config: ScalingConfig::from(&config),
            document_root,
            threads: RwLock::new(threads),
            regular_pool: Arc::new(ThreadPool::new()),
            workers,
            task_workers,
            scaling: Mutex::new(ScalingState::default()),
            done: Arc::new(Signal::new()),
            background: Mutex::new(Vec::new()),
        });

        if let Err(err) = inner.start(mode) {
            log_error!(err, "runtime failed to start");
            inner.shutdown();
            return Err(err);
        }
        log_runtime!(
            "start",
            "ready",
            num_threads = counts.num_threads,
            max_threads = counts.max_threads,
            workers = inner.workers.len(),
            task_workers = inner.task_workers.len()
        );
        Ok(inner)
    }

    fn start(self: &Arc<Self>, mode: BootMode) -> Result<()> {
        self.boot_threads()?;
        self.shared.main_state.set(StateId::Ready);
        self.shared.metrics.total_threads(self.counts.num_threads);

        if mode == BootMode::Inactive {
            return Ok(());
        }

        let mut started = Vec::new();
        for worker in &self.workers {
            for _ in 0..worker.num() {
                let thread = self
                    .get_inactive_thread()
                    .ok_or(RuntimeError::MaxThreadsReached)?;
                self.expect_transition(&thread, self.convert_to_worker(&thread, worker))?;
                started.push(thread);
            }
        }
        self.await_started(&started)?;
        debug!(threads = started.len(), "workers started");

        let mut started = Vec::new();
        for task_worker in &self.task_workers {
            for _ in 0..task_worker.num() {
                let thread = self
                    .get_inactive_thread()
                    .ok_or(RuntimeError::MaxThreadsReached)?;
                self.expect_transition(&thread, self.convert_to_task_worker(&thread, task_worker))?;
                started.push(thread);
            }
        }
        self.await_started(&started)?;

        let inactive: Vec<_> = self
            .threads
            .read()
            .iter()
            .filter(|t| t.state().is(StateId::Inactive))
            .cloned()
            .collect();
        for thread in &inactive {
            self.expect_transition(thread, self.convert_to_regular(thread))?;
        }
        for thread in &inactive {
            thread.state().wait_for(&[StateId::Ready, StateId::ShuttingDown, StateId::Done]);
        }

        self.start_autoscaling()
    }

    /// Boots the first `num_threads` threads in parallel.
    fn boot_threads(&self) -> Result<()> {
        let threads: Vec<_> = self.threads.read()[..self.counts.num_threads].to_vec();
        let results: Vec<Result<()>> = std::thread::scope(|s| {
            let handles: Vec<_> = threads
                .iter()
                .map(|thread| s.spawn(move || thread.boot()))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(RuntimeError::Other(anyhow::anyhow!("thread boot panicked")))
                    })
                })
                .collect()
        });
        results.into_iter().collect()
    }

    fn await_started(&self, threads: &[Arc<ExecutionThread>]) -> Result<()> {
        for thread in threads {
            thread
                .state()
                .wait_for(&[StateId::Ready, StateId::ShuttingDown, StateId::Done]);
        }
        match self.shared.take_startup_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn shutdown(&self) {
        let state = &self.shared.main_state;
        if !state.compare_and_swap(StateId::Ready, StateId::ShuttingDown)
            && !state.compare_and_swap(StateId::Booting, StateId::ShuttingDown)
        {
            return;
        }
        log_runtime!("shutdown", "started");
        self.done.close();

        let current = std::thread::current().id();
        let background: Vec<_> = self.background.lock().drain(..).collect();
        for handle in background {
            // the last handle may be dropped on an autoscaler thread
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("autoscaler thread panicked");
            }
        }

        let threads = self.threads.read().clone();
        std::thread::scope(|s| {
            for thread in &threads {
                s.spawn(move || {
                    if thread.state().compare_and_swap(StateId::Reserved, StateId::Done) {
                        return;
                    }
                    thread.shutdown();
                    // threads that died on their own are joined here
                    thread.join();
                });
            }
        });

        for task_worker in &self.task_workers {
            task_worker.drain_pending();
        }
        self.scaling.lock().autoscaled.clear();
        self.threads.write().clear();
        state.set(StateId::Done);
        log_runtime!("shutdown", "done");
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.shared.main_state.is(StateId::Ready) {
            Ok(())
        } else {
            Err(RuntimeError::NotRunning)
        }
    }

    // --- Lookup ---

    fn existing_thread(&self, index: usize) -> Result<Arc<ExecutionThread>> {
        self.threads
            .read()
            .get(index)
            .cloned()
            .ok_or(RuntimeError::UnknownThread(index))
    }

    /// Exact name first, then the module-scoped variant.
    fn find_worker(&self, name: &str) -> Option<Arc<Worker>> {
        self.workers
            .iter()
            .find(|w| w.name() == name)
            .or_else(|| {
                let scoped = format!("{MODULE_WORKER_PREFIX}{name}");
                self.workers.iter().find(|w| w.name() == scoped)
            })
            .cloned()
    }

    fn find_task_worker(&self, name: Option<&str>) -> Result<Arc<TaskWorker>> {
        let found = match name {
            Some(name) => self.task_workers.iter().find(|tw| tw.name() == name),
            None => self.task_workers.first(),
        };
        found.cloned().ok_or_else(|| {
            RuntimeError::TaskWorkerNotFound(name.unwrap_or("default").to_string())
        })
    }

    /// First inactive thread, otherwise a freshly booted reserved one.
    pub(crate) fn get_inactive_thread(&self) -> Option<Arc<ExecutionThread>> {
        let candidate = {
            let threads = self.threads.read();
            if let Some(thread) = threads.iter().find(|t| t.state().is(StateId::Inactive)) {
                return Some(Arc::clone(thread));
            }
            threads
                .iter()
                .find(|t| {
                    t.state()
                        .compare_and_swap(StateId::Reserved, StateId::BootRequested)
                })
                .cloned()
        }?;

        match candidate.boot() {
            Ok(()) => Some(candidate),
            Err(err) => {
                log_error!(err, thread = candidate.index(), "could not boot reserved thread");
                None
            }
        }
    }

    // --- Roles ---

    pub(crate) fn convert_to_regular(&self, thread: &Arc<ExecutionThread>) -> bool {
        thread.set_handler(ThreadHandler::Regular(RegularHandler::new(Arc::clone(
            &self.regular_pool,
        ))))
    }

    pub(crate) fn convert_to_worker(&self, thread: &Arc<ExecutionThread>, worker: &Arc<Worker>) -> bool {
        thread.set_handler(ThreadHandler::Worker(WorkerHandler::new(
            Arc::clone(worker),
            self.shared.worker_min_backoff,
            self.shared.worker_max_backoff,
        )))
    }

    pub(crate) fn convert_to_task_worker(
        &self,
        thread: &Arc<ExecutionThread>,
        task_worker: &Arc<TaskWorker>,
    ) -> bool {
        thread.set_handler(ThreadHandler::TaskWorker(TaskWorkerHandler::new(Arc::clone(
            task_worker,
        ))))
    }

    pub(crate) fn convert_to_inactive(&self, thread: &Arc<ExecutionThread>) -> bool {
        thread.set_handler(ThreadHandler::Inactive)
    }

    fn expect_transition(&self, thread: &ExecutionThread, accepted: bool) -> Result<()> {
        if accepted {
            Ok(())
        } else {
            Err(RuntimeError::TransitionRefused {
                index: thread.index(),
                state: thread.state().name().to_string(),
            })
        }
    }

    // --- Requests ---

    fn prepare(&self, mut ctx: RequestContext) -> Result<Arc<RequestContext>> {
        self.ensure_running()?;
        ctx.validate()?;

        if let Some(name) = ctx.worker_name() {
            let worker = self
                .find_worker(name)
                .ok_or_else(|| RequestError::UnknownWorker(name.to_string()))?;
            ctx.assign_worker(worker);
            return Ok(Arc::new(ctx));
        }

        ctx.resolve_script(&self.document_root);
        let matched = ctx
            .script_path()
            .and_then(|path| self.workers.iter().find(|w| w.matches_path(path)))
            .cloned();
        if let Some(worker) = matched {
            ctx.assign_worker(worker);
        }
        Ok(Arc::new(ctx))
    }

    fn route(&self, ctx: &Arc<RequestContext>) -> Result<()> {
        match ctx.worker() {
            Some(worker) => worker.handle_request(ctx, &self.shared)?,
            None => self.handle_regular_request(ctx)?,
        }
        Ok(())
    }

    fn handle_regular_request(&self, ctx: &Arc<RequestContext>) -> Result<()> {
        let shared = &self.shared;
        let metrics = &shared.metrics;
        metrics.start_request();

        let is_fast = !shared.latency.is_high_latency_request(ctx);
        ctx.set_high_latency(!is_fast);

        // requests already waiting go first
        let dispatched = self.regular_pool.queued_count() == 0
            && self.regular_pool.dispatch_request(ctx, is_fast);
        if !dispatched {
            metrics.queued_request();
            let queued = self.regular_pool.queue_request(
                ctx,
                is_fast,
                shared.scale_sender(),
                shared.admission.max_wait_time,
            );
            metrics.dequeued_request();
            if let Err(err) = queued {
                metrics.stop_request();
                return Err(err.into());
            }
        }

        ctx.wait();
        metrics.stop_request();
        shared.latency.track_request_latency(
            ctx,
            ctx.elapsed(),
            !is_fast,
            shared.scale_receiver(),
        );
        Ok(())
    }

    // --- Restarts ---

    fn restart_workers(&self) {
        let _scaling = self.scaling.lock();
        let drained = self.drain_worker_threads();
        for thread in &drained {
            thread.renew_drain();
            thread
                .state()
                .compare_and_swap(StateId::Yielding, StateId::Ready);
        }
        for worker in &self.workers {
            worker.record_restart();
        }
        self.shared.metrics.restart_workers();
        info!(threads = drained.len(), "workers restarted");
    }

    /// Moves every worker thread to `Yielding`. Threads that are shutting
    /// down are skipped. Returns the threads that are now yielding.
    pub(crate) fn drain_worker_threads(&self) -> Vec<Arc<ExecutionThread>> {
        let mut draining = Vec::new();
        for worker in &self.workers {
            for thread in worker.threads() {
                if thread.state().is(StateId::Yielding) {
                    draining.push(thread);
                    continue;
                }
                if !thread.state().request_safe_state_change(StateId::Restarting) {
                    continue;
                }
                thread.drain_signal().close();
                draining.push(thread);
            }
        }

        for thread in &draining {
            thread
                .state()
                .wait_for(&[StateId::Yielding, StateId::ShuttingDown, StateId::Done]);
        }
        draining.retain(|t| t.state().is(StateId::Yielding));
        draining
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
