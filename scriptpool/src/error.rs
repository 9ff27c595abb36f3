use std::path::PathBuf;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Errors raised while waiting for capacity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("maximum request handling time exceeded (waited {0:?})")]
    MaxWaitTimeExceeded(Duration),
}

/// Errors detected while validating the runtime configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("two workers cannot have the same name: {0}")]
    DuplicateWorkerName(String),
    #[error("two workers cannot have the same filename: {}", .0.display())]
    DuplicateWorkerFile(PathBuf),
    #[error("two task workers cannot have the same name: {0}")]
    DuplicateTaskWorkerName(String),
    #[error("invalid worker script path {}: {reason}", .path.display())]
    InvalidWorkerFile { path: PathBuf, reason: String },
    #[error("invalid document root {}: {reason}", .path.display())]
    InvalidDocumentRoot { path: PathBuf, reason: String },
    #[error("worker script not found: {}", .0.display())]
    WorkerFileNotFound(PathBuf),
    #[error("num_threads ({num_threads}) must be greater than the number of worker threads ({worker_threads})")]
    NotEnoughThreads {
        num_threads: usize,
        worker_threads: usize,
    },
    #[error("max_threads ({max_threads}) must be greater than or equal to num_threads ({num_threads})")]
    MaxThreadsBelowNumThreads {
        num_threads: usize,
        max_threads: usize,
    },
    #[error("max_threads ({worker_max}) of worker {worker} exceeds the overall max_threads ({max_threads})")]
    WorkerMaxThreadsTooHigh {
        worker: String,
        worker_max: usize,
        max_threads: usize,
    },
    #[error("max_threads ({worker_max}) of worker {worker} must be greater than or equal to its num ({num})")]
    WorkerMaxThreadsBelowNum {
        worker: String,
        worker_max: usize,
        num: usize,
    },
}

/// Errors contained to a single request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("invalid request path")]
    InvalidPath,
    #[error("invalid Content-Length header")]
    InvalidContentLength,
    #[error("no worker named {0}")]
    UnknownWorker(String),
}

/// Top level error returned by the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("runtime is not running")]
    NotRunning,
    #[error("failed to spawn execution thread {index}: {source}")]
    ThreadSpawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("thread {index} cannot be booted from state {state}")]
    ThreadNotReserved { index: usize, state: String },
    #[error("no execution thread with index {0}")]
    UnknownThread(usize),
    #[error("thread {index} refused the transition from state {state}")]
    TransitionRefused { index: usize, state: String },
    #[error("max_threads reached")]
    MaxThreadsReached,
    #[error("worker {worker} failed to boot: {reason}")]
    WorkerBoot { worker: String, reason: String },
    #[error("no task worker found to handle this task: {0}")]
    TaskWorkerNotFound(String),
    #[error("task worker queue is full, cannot dispatch task to {0}")]
    TaskQueueFull(String),
    #[error("task did not complete within {0:?}")]
    TaskTimeout(Duration),
    #[error("this operation is only available on {0} threads")]
    WrongThreadRole(&'static str),
    #[error("internal runtime error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RuntimeError {
    /// HTTP status a front-end should answer with.
    pub fn status(&self) -> StatusCode {
        match self {
            RuntimeError::Admission(_) => StatusCode::GATEWAY_TIMEOUT,
            RuntimeError::Request(RequestError::UnknownWorker(_))
            | RuntimeError::TaskWorkerNotFound(_) => StatusCode::NOT_FOUND,
            RuntimeError::Request(_) => StatusCode::BAD_REQUEST,
            RuntimeError::NotRunning | RuntimeError::TaskQueueFull(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RuntimeError::Admission(_))
    }
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
