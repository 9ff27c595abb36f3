//! # Scheduler
//!
//! Everything that decides which thread serves a request and how many
//! threads exist.
//!
//! ## Key Concepts
//! - Dispatch: [`ThreadPool`] offers a request to idle threads, then queues it.
//! - Admission: a [`Semaphore`] bounds concurrent worker requests and turns
//!   contention into scale requests or timeouts.
//! - Latency: [`LatencyTracker`] keeps per-path averages used to route fast
//!   requests to low-latency threads.
//! - Scaling: stalled requests convert inactive threads, idle autoscaled
//!   threads are deactivated again.

pub mod admission;
pub mod latency;
pub mod pool;
pub mod scaling;

pub use admission::{acquire_with_admission_control, AdmissionPolicy, Semaphore, SemaphorePermit};
pub use latency::{normalize_path, LatencyTracker};
pub use pool::ThreadPool;
pub use scaling::ScalingConfig;
