use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{DEFAULT_MAX_BACKOFF, DEFAULT_MIN_BACKOFF};
use crate::error::ConfigError;

pub const DEFAULT_MIN_STALL_TIME: Duration = Duration::from_millis(5);
pub const DEFAULT_SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(1);
pub const DEFAULT_SLOW_THREAD_PERCENTILE: u8 = 80;
pub const DEFAULT_LATENCY_TABLE_CAPACITY: usize = 1000;
pub const DEFAULT_DOWNSCALE_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_TERMINATIONS_PER_CHECK: usize = 10;
pub const DEFAULT_TASK_QUEUE_LEN: usize = 1500;

/// Prefix that keeps module-scoped worker names apart from global ones.
pub const MODULE_WORKER_PREFIX: &str = "m#";

/// Called with the thread index when a worker thread becomes ready or stops.
pub type ThreadHook = Arc<dyn Fn(usize) + Send + Sync>;

// --- Thread Limits ---

/// Upper bound on the number of execution threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaxThreads {
    /// Let the runtime pick a limit (twice the number of started threads).
    Auto,
    Fixed(usize),
}

/// Thread counts after validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadCounts {
    /// Threads booted at startup.
    pub num_threads: usize,
    /// Total capacity, including threads reserved for autoscaling.
    pub max_threads: usize,
}

// --- Runtime Configuration ---

/// Configuration for a [`Runtime`](crate::Runtime).
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Threads started at boot. `None` derives a value from the CPU count and the workers.
    pub num_threads: Option<usize>,

    /// Upper bound for autoscaling. `None` derives it from the workers' own limits.
    pub max_threads: Option<MaxThreads>,

    /// How long a request may wait for a thread before it is rejected. `None` waits forever.
    pub max_wait_time: Option<Duration>,

    /// How long a request must stall before it may trigger autoscaling.
    pub min_stall_time: Duration,

    /// Requests slower than this are recorded by the latency tracker.
    pub slow_request_threshold: Duration,

    /// Latency tracking engages once autoscaled threads reach this percentage of the scaling budget.
    pub slow_thread_percentile: u8,

    /// Number of normalized paths tracked before the latency table is cleared.
    pub latency_table_capacity: usize,

    /// Interval between two downscaling passes.
    pub downscale_check_interval: Duration,

    /// Autoscaled threads idle longer than this are deactivated.
    pub max_idle_time: Duration,

    /// Maximum number of threads deactivated in one downscaling pass.
    pub max_terminations_per_check: usize,

    /// Lower bound of the worker crash backoff.
    pub worker_min_backoff: Duration,

    /// Upper bound of the worker crash backoff.
    pub worker_max_backoff: Duration,

    /// Root used to resolve script paths of regular requests.
    pub document_root: PathBuf,

    pub workers: Vec<WorkerConfig>,

    pub task_workers: Vec<TaskWorkerConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            max_threads: None,
            max_wait_time: None,
            min_stall_time: DEFAULT_MIN_STALL_TIME,
            slow_request_threshold: DEFAULT_SLOW_REQUEST_THRESHOLD,
            slow_thread_percentile: DEFAULT_SLOW_THREAD_PERCENTILE,
            latency_table_capacity: DEFAULT_LATENCY_TABLE_CAPACITY,
            downscale_check_interval: DEFAULT_DOWNSCALE_CHECK_INTERVAL,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            max_terminations_per_check: DEFAULT_MAX_TERMINATIONS_PER_CHECK,
            worker_min_backoff: DEFAULT_MIN_BACKOFF,
            worker_max_backoff: DEFAULT_MAX_BACKOFF,
            document_root: PathBuf::from("."),
            workers: Vec::new(),
            task_workers: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn with_max_threads(mut self, max_threads: MaxThreads) -> Self {
        self.max_threads = Some(max_threads);
        self
    }

    pub fn with_max_wait_time(mut self, max_wait_time: Duration) -> Self {
        self.max_wait_time = Some(max_wait_time);
        self
    }

    pub fn with_document_root(mut self, document_root: impl Into<PathBuf>) -> Self {
        self.document_root = document_root.into();
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn with_task_worker(mut self, task_worker: TaskWorkerConfig) -> Self {
        self.task_workers.push(task_worker);
        self
    }

    /// True when any worker has watch patterns, which makes worker boot failures non-fatal.
    pub fn watcher_enabled(&self) -> bool {
        self.workers.iter().any(|w| !w.watch.is_empty())
    }

    /// Validates the thread settings and derives the effective thread counts.
    pub fn resolve_thread_counts(&self) -> Result<ThreadCounts, ConfigError> {
        let worker_threads: usize = self.workers.iter().map(|w| w.effective_num()).sum::<usize>()
            + self.task_workers.iter().map(|w| w.effective_num()).sum::<usize>();
        let explicit_max = match self.max_threads {
            Some(MaxThreads::Fixed(max)) => Some(max),
            _ => None,
        };

        for worker in &self.workers {
            let Some(worker_max) = worker.max_threads else {
                continue;
            };
            if worker_max < worker.effective_num() {
                return Err(ConfigError::WorkerMaxThreadsBelowNum {
                    worker: worker.display_name(),
                    worker_max,
                    num: worker.effective_num(),
                });
            }
            if let Some(max_threads) = explicit_max {
                if worker_max > max_threads {
                    return Err(ConfigError::WorkerMaxThreadsTooHigh {
                        worker: worker.display_name(),
                        worker_max,
                        max_threads,
                    });
                }
            }
        }

        let num_threads = match self.num_threads {
            Some(num_threads) => {
                if num_threads <= worker_threads {
                    return Err(ConfigError::NotEnoughThreads {
                        num_threads,
                        worker_threads,
                    });
                }
                num_threads
            }
            None => {
                let limits_configured = self.max_threads.is_some()
                    || self.workers.iter().any(|w| w.max_threads.is_some());
                if limits_configured {
                    worker_threads + 1
                } else {
                    (num_cpus::get() * 2).max(worker_threads + 1)
                }
            }
        };

        let max_threads = match self.max_threads {
            Some(MaxThreads::Fixed(max_threads)) => {
                if max_threads < num_threads {
                    return Err(ConfigError::MaxThreadsBelowNumThreads {
                        num_threads,
                        max_threads,
                    });
                }
                max_threads
            }
            Some(MaxThreads::Auto) => num_threads * 2,
            None => {
                num_threads
                    + self
                        .workers
                        .iter()
                        .filter_map(|w| w.max_threads.map(|max| max - w.effective_num()))
                        .sum::<usize>()
            }
        };

        Ok(ThreadCounts {
            num_threads,
            max_threads,
        })
    }
}

// --- Worker Configuration ---

/// A script kept alive on its own threads, serving requests in a loop.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Explicit name. Defaults to the absolute script path.
    pub name: Option<String>,

    pub file_name: PathBuf,

    /// Threads started for this worker. 0 means twice the CPU count.
    pub num: usize,

    /// Upper bound for autoscaling this worker.
    pub max_threads: Option<usize>,

    pub env: HashMap<String, String>,

    /// File patterns watched for hot reload.
    pub watch: Vec<String>,

    /// Consecutive boot failures tolerated before the worker fails hard.
    pub max_consecutive_failures: Option<u32>,

    /// Module-scoped workers are reachable only by name, never by path.
    pub module_scoped: bool,

    pub on_thread_ready: Option<ThreadHook>,

    pub on_thread_shutdown: Option<ThreadHook>,
}

impl WorkerConfig {
    pub fn new(file_name: impl Into<PathBuf>, num: usize) -> Self {
        Self {
            name: None,
            file_name: file_name.into(),
            num,
            max_threads: None,
            env: HashMap::new(),
            watch: Vec::new(),
            max_consecutive_failures: None,
            module_scoped: false,
            on_thread_ready: None,
            on_thread_shutdown: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = Some(max_threads);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_watch(mut self, pattern: impl Into<String>) -> Self {
        self.watch.push(pattern.into());
        self
    }

    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = Some(max);
        self
    }

    pub fn module_scoped(mut self) -> Self {
        self.module_scoped = true;
        self
    }

    pub fn on_thread_ready(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_thread_ready = Some(Arc::new(hook));
        self
    }

    pub fn on_thread_shutdown(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_thread_shutdown = Some(Arc::new(hook));
        self
    }

    pub fn effective_num(&self) -> usize {
        if self.num == 0 {
            num_cpus::get() * 2
        } else {
            self.num
        }
    }

    fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.file_name.display().to_string())
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("name", &self.name)
            .field("file_name", &self.file_name)
            .field("num", &self.num)
            .field("max_threads", &self.max_threads)
            .field("env", &self.env)
            .field("watch", &self.watch)
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .field("module_scoped", &self.module_scoped)
            .field("has_ready_hook", &self.on_thread_ready.is_some())
            .field("has_shutdown_hook", &self.on_thread_shutdown.is_some())
            .finish()
    }
}

// --- Task Worker Configuration ---

/// A script that pulls background tasks from a queue.
#[derive(Clone, Debug)]
pub struct TaskWorkerConfig {
    pub name: String,
    pub file_name: PathBuf,
    pub num: usize,
    pub env: HashMap<String, String>,
    /// Tasks buffered before `dispatch_task` starts failing.
    pub max_queue_len: usize,
}

impl TaskWorkerConfig {
    pub fn new(name: impl Into<String>, file_name: impl Into<PathBuf>, num: usize) -> Self {
        Self {
            name: name.into(),
            file_name: file_name.into(),
            num,
            env: HashMap::new(),
            max_queue_len: DEFAULT_TASK_QUEUE_LEN,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_max_queue_len(mut self, max_queue_len: usize) -> Self {
        self.max_queue_len = max_queue_len;
        self
    }

    pub fn effective_num(&self) -> usize {
        self.num.max(1)
    }
}
