//! Observers for runtime events.
//!
//! The runtime calls these hooks and never reads anything back. [`NullMetrics`]
//! is used when nothing is configured; [`RecorderMetrics`] forwards every event
//! to whichever recorder is installed for the `metrics` facade.

use std::time::Duration;

/// Why a worker script stopped.
///
/// Every reason except `BootFailure` ends a run that was reported through
/// [`Metrics::ready_worker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Clean exit, the script is restarted.
    Restart,
    /// Non-zero exit after reaching the request loop.
    Crash,
    /// The script failed before reaching its request loop.
    BootFailure,
    /// The thread is shutting down or leaving its worker role.
    Shutdown,
}

impl StopReason {
    fn as_str(&self) -> &'static str {
        match self {
            StopReason::Restart => "restart",
            StopReason::Crash => "crash",
            StopReason::BootFailure => "boot_failure",
            StopReason::Shutdown => "shutdown",
        }
    }
}

pub trait Metrics: Send + Sync + 'static {
    fn start_request(&self) {}
    fn stop_request(&self) {}
    fn queued_request(&self) {}
    fn dequeued_request(&self) {}
    fn total_threads(&self, _count: usize) {}

    fn total_workers(&self, _worker: &str, _count: usize) {}
    fn start_worker(&self, _worker: &str) {}
    fn ready_worker(&self, _worker: &str) {}
    fn stop_worker(&self, _worker: &str, _reason: StopReason) {}
    fn start_worker_request(&self, _worker: &str) {}
    fn stop_worker_request(&self, _worker: &str, _duration: Duration) {}
    fn queued_worker_request(&self, _worker: &str) {}
    fn dequeued_worker_request(&self, _worker: &str) {}
    fn restart_workers(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl Metrics for NullMetrics {}

/// Forwards events to the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderMetrics;

impl Metrics for RecorderMetrics {
    fn start_request(&self) {
        metrics::gauge!("scriptpool_busy_threads").increment(1.0);
    }

    fn stop_request(&self) {
        metrics::gauge!("scriptpool_busy_threads").decrement(1.0);
    }

    fn queued_request(&self) {
        metrics::gauge!("scriptpool_queue_depth").increment(1.0);
    }

    fn dequeued_request(&self) {
        metrics::gauge!("scriptpool_queue_depth").decrement(1.0);
    }

    fn total_threads(&self, count: usize) {
        metrics::gauge!("scriptpool_total_threads").set(count as f64);
    }

    fn total_workers(&self, worker: &str, count: usize) {
        metrics::gauge!("scriptpool_total_workers", "worker" => worker.to_string())
            .set(count as f64);
    }

    fn start_worker(&self, worker: &str) {
        metrics::gauge!("scriptpool_busy_workers", "worker" => worker.to_string()).increment(1.0);
    }

    fn ready_worker(&self, worker: &str) {
        metrics::gauge!("scriptpool_ready_workers", "worker" => worker.to_string()).increment(1.0);
    }

    fn stop_worker(&self, worker: &str, reason: StopReason) {
        metrics::gauge!("scriptpool_busy_workers", "worker" => worker.to_string()).decrement(1.0);
        if reason != StopReason::BootFailure {
            metrics::gauge!("scriptpool_ready_workers", "worker" => worker.to_string())
                .decrement(1.0);
        }
        metrics::counter!(
            "scriptpool_worker_stops_total",
            "worker" => worker.to_string(),
            "reason" => reason.as_str()
        )
        .increment(1);
    }

    fn start_worker_request(&self, worker: &str) {
        metrics::gauge!("scriptpool_worker_busy_requests", "worker" => worker.to_string())
            .increment(1.0);
    }

    fn stop_worker_request(&self, worker: &str, duration: Duration) {
        metrics::gauge!("scriptpool_worker_busy_requests", "worker" => worker.to_string())
            .decrement(1.0);
        metrics::counter!("scriptpool_worker_requests_total", "worker" => worker.to_string())
            .increment(1);
        metrics::histogram!("scriptpool_worker_request_seconds", "worker" => worker.to_string())
            .record(duration.as_secs_f64());
    }

    fn queued_worker_request(&self, worker: &str) {
        metrics::gauge!("scriptpool_worker_queue_depth", "worker" => worker.to_string())
            .increment(1.0);
    }

    fn dequeued_worker_request(&self, worker: &str) {
        metrics::gauge!("scriptpool_worker_queue_depth", "worker" => worker.to_string())
            .decrement(1.0);
    }

    fn restart_workers(&self) {
        metrics::counter!("scriptpool_worker_restarts_total").increment(1);
    }
}
