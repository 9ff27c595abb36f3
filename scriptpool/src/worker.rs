//! Worker scripts and the threads bound to them.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{ThreadHook, WorkerConfig, MODULE_WORKER_PREFIX};
use crate::context::RequestContext;
use crate::error::{AdmissionError, ConfigError};
use crate::runtime::RuntimeShared;
use crate::scheduler::{acquire_with_admission_control, Semaphore, ThreadPool};
use crate::thread::ExecutionThread;
use crate::{log_scheduler, log_worker};

/// Environment variable set for every worker script.
pub const WORKER_ENV_KEY: &str = "SCRIPTPOOL_WORKER";

/// Drops `.` components and folds `..` into their parent without touching
/// the filesystem. `..` never climbs above the root.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match cleaned.components().next_back() {
                Some(Component::Normal(_)) => {
                    cleaned.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => cleaned.push(".."),
            },
            other => cleaned.push(other),
        }
    }
    cleaned
}

/// Resolves `file_name` to a clean absolute path and checks that it exists.
pub(crate) fn resolve_script_path(file_name: &Path) -> Result<PathBuf, ConfigError> {
    let absolute = std::path::absolute(file_name)
        .map(|path| clean_path(&path))
        .map_err(|err| ConfigError::InvalidWorkerFile {
            path: file_name.to_path_buf(),
            reason: err.to_string(),
        })?;
    if !absolute.exists() {
        return Err(ConfigError::WorkerFileNotFound(absolute));
    }
    Ok(absolute)
}

/// A script kept running on its own threads.
///
/// Identified by name; workers that are not module scoped also match
/// requests for their absolute script path. The admission semaphore always
/// holds one permit per attached thread.
pub struct Worker {
    name: String,
    file_name: PathBuf,
    num: usize,
    max_threads: Option<usize>,
    env: HashMap<String, String>,
    pool: Arc<ThreadPool>,
    semaphore: Semaphore,
    allow_path_matching: bool,
    max_consecutive_failures: Option<u32>,
    on_thread_ready: Option<ThreadHook>,
    on_thread_shutdown: Option<ThreadHook>,
    watch: Vec<String>,
    restarts: AtomicU64,
    failures: AtomicU64,
}

impl Worker {
    /// Validates `config` against the workers registered so far.
    pub fn new(config: &WorkerConfig, existing: &[Arc<Worker>]) -> Result<Self, ConfigError> {
        let file_name = resolve_script_path(&config.file_name)?;

        let mut name = config
            .name
            .clone()
            .unwrap_or_else(|| file_name.to_string_lossy().into_owned());
        if config.module_scoped && !name.starts_with(MODULE_WORKER_PREFIX) {
            name = format!("{MODULE_WORKER_PREFIX}{name}");
        }
        let allow_path_matching = !name.starts_with(MODULE_WORKER_PREFIX);

        if allow_path_matching && existing.iter().any(|w| w.matches_path(&file_name)) {
            return Err(ConfigError::DuplicateWorkerFile(file_name));
        }
        if existing.iter().any(|w| w.name == name) {
            return Err(ConfigError::DuplicateWorkerName(name));
        }

        let mut env = config.env.clone();
        env.insert(WORKER_ENV_KEY.to_string(), "1".to_string());

        Ok(Self {
            name,
            file_name,
            num: config.effective_num(),
            max_threads: config.max_threads,
            env,
            pool: Arc::new(ThreadPool::new()),
            semaphore: Semaphore::new(0),
            allow_path_matching,
            max_consecutive_failures: config.max_consecutive_failures,
            on_thread_ready: config.on_thread_ready.clone(),
            on_thread_shutdown: config.on_thread_shutdown.clone(),
            watch: config.watch.clone(),
            restarts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
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

    pub fn max_threads(&self) -> Option<usize> {
        self.max_threads
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn watch_patterns(&self) -> &[String] {
        &self.watch
    }

    pub fn allows_path_matching(&self) -> bool {
        self.allow_path_matching
    }

    /// `path` is compared after cleaning, so `/srv/app/../app/worker.php`
    /// matches `/srv/app/worker.php`.
    pub fn matches_path(&self, path: &Path) -> bool {
        self.allow_path_matching && self.file_name == clean_path(path)
    }

    pub fn max_consecutive_failures(&self) -> Option<u32> {
        self.max_consecutive_failures
    }

    pub(crate) fn on_thread_ready(&self) -> Option<&ThreadHook> {
        self.on_thread_ready.as_ref()
    }

    pub(crate) fn on_thread_shutdown(&self) -> Option<&ThreadHook> {
        self.on_thread_shutdown.as_ref()
    }

    /// Completed restarts of this worker.
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Script exits with a non-zero status, including failed boots.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    // --- Threads ---

    pub(crate) fn attach_thread(&self, thread: &Arc<ExecutionThread>) {
        self.pool.attach(thread);
        self.sync_thread_count(thread);
    }

    pub(crate) fn detach_thread(&self, thread: &ExecutionThread) {
        self.pool.detach(thread);
        self.sync_thread_count(thread);
    }

    fn sync_thread_count(&self, thread: &ExecutionThread) {
        let count = self.pool.len();
        self.semaphore.set_capacity(count);
        thread.shared().metrics.total_workers(&self.name, count);
    }

    pub fn count_threads(&self) -> usize {
        self.pool.len()
    }

    pub fn threads(&self) -> Vec<Arc<ExecutionThread>> {
        self.pool.threads()
    }

    pub fn is_at_thread_limit(&self) -> bool {
        match self.max_threads {
            Some(max) => self.pool.len() >= max,
            None => false,
        }
    }

    // --- Requests ---

    /// Serves `ctx` on one of this worker's threads and blocks until it is done.
    pub(crate) fn handle_request(
        &self,
        ctx: &Arc<RequestContext>,
        shared: &RuntimeShared,
    ) -> Result<(), AdmissionError> {
        let metrics = &shared.metrics;
        metrics.start_worker_request(&self.name);
        metrics.queued_worker_request(&self.name);

        let scale = if self.is_at_thread_limit() {
            None
        } else {
            shared.scale_sender()
        };

        let permit =
            match acquire_with_admission_control(&self.semaphore, scale, ctx, &shared.admission) {
                Ok(permit) => permit,
                Err(err) => {
                    metrics.dequeued_worker_request(&self.name);
                    ctx.reject(http::StatusCode::GATEWAY_TIMEOUT, &err.to_string());
                    metrics.stop_worker_request(&self.name, ctx.elapsed());
                    log_worker!(self.name.as_str(), "request rejected", request = %ctx.id());
                    return Err(err);
                }
            };

        let is_fast = !shared.latency.is_high_latency_request(ctx);
        ctx.set_high_latency(!is_fast);

        if !self.pool.dispatch_request(ctx, is_fast) {
            log_scheduler!("worker", "queued", worker = self.name.as_str(), request = %ctx.id());
            // a permit guarantees a thread, so this waits without a deadline
            self.pool.queue_request(ctx, is_fast, None, None)?;
        }
        metrics.dequeued_worker_request(&self.name);

        ctx.wait();
        drop(permit);

        let elapsed = ctx.elapsed();
        metrics.stop_worker_request(&self.name, elapsed);
        shared
            .latency
            .track_request_latency(ctx, elapsed, !is_fast, shared.scale_receiver());
        Ok(())
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("file_name", &self.file_name)
            .field("num", &self.num)
            .field("max_threads", &self.max_threads)
            .field("threads", &self.count_threads())
            .field("allow_path_matching", &self.allow_path_matching)
            .field("restarts", &self.restart_count())
            .finish()
    }
}
