// Scriptpool
//
// A pool of native execution threads running scripts for an embedding
// server. Threads serve one-shot requests, keep worker scripts alive in a
// loop or pull background tasks, and the pool grows and shrinks with load.

pub mod backoff;
pub mod config;
pub mod context;
pub mod debug;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod thread;
pub mod worker;

// Re-export commonly used types
pub use backoff::ExponentialBackoff;
pub use config::{MaxThreads, RuntimeConfig, TaskWorkerConfig, ThreadCounts, WorkerConfig};
pub use context::RequestContext;
pub use debug::{DebugState, ThreadDebugState};
pub use error::{AdmissionError, ConfigError, RequestError, Result, RuntimeError};
pub use executor::ScriptExecutor;
pub use metrics::{Metrics, NullMetrics, RecorderMetrics, StopReason};
pub use runtime::Runtime;
pub use task::{PendingTask, TaskWorker};
pub use thread::{ExecutionThread, HandlerKind, ScriptScope, StateId};
pub use worker::Worker;
