//! Autoscaling.
//!
//! Requests that stall longer than `min_stall_time` are offered on the scale
//! channel. The upscaler answers each of them by converting one inactive or
//! reserved thread to the role the request needs. The downscaler
//! periodically deactivates autoscaled threads that idle for too long.
//!
//! Both directions, as well as worker restarts, run under the runtime's
//! scaling mutex, so a thread is never claimed by two of them at once.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{select, Receiver};
use tracing::{debug, error, warn};

use crate::config::RuntimeConfig;
use crate::context::RequestContext;
use crate::error::{Result, RuntimeError};
use crate::log_scheduler;
use crate::runtime::RuntimeInner;
use crate::thread::{ExecutionThread, Signal, StateId};
use crate::worker::Worker;

/// Timing of the autoscaler.
#[derive(Debug, Clone, Copy)]
pub struct ScalingConfig {
    pub min_stall_time: Duration,
    pub downscale_check_interval: Duration,
    pub max_idle_time: Duration,
    pub max_terminations_per_check: usize,
}

impl From<&RuntimeConfig> for ScalingConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            min_stall_time: config.min_stall_time,
            downscale_check_interval: config.downscale_check_interval,
            max_idle_time: config.max_idle_time,
            max_terminations_per_check: config.max_terminations_per_check,
        }
    }
}

/// Threads added by the upscaler, guarded by the scaling mutex.
///
/// Deactivated threads stay listed until they are shut down, but no longer
/// count against the scaling budget.
#[derive(Debug, Default)]
pub(crate) struct ScalingState {
    pub(crate) autoscaled: Vec<Arc<ExecutionThread>>,
}

impl ScalingState {
    /// Autoscaled threads that currently hold a role.
    pub(crate) fn active(&self) -> usize {
        self.autoscaled
            .iter()
            .filter(|t| !matches!(t.state().get(), StateId::Inactive | StateId::Reserved))
            .count()
    }
}

/// States a freshly converted thread may settle in.
const SETTLED: [StateId; 4] = [
    StateId::Ready,
    StateId::ShuttingDown,
    StateId::Reserved,
    StateId::Done,
];

impl RuntimeInner {
    /// Threads the upscaler may add on top of the booted ones.
    pub(crate) fn max_scaled_threads(&self) -> usize {
        self.counts.max_threads.saturating_sub(self.counts.num_threads)
    }

    pub(crate) fn autoscaled_thread_count(&self) -> usize {
        self.scaling.lock().active()
    }

    /// Spawns the upscaling and downscaling loops. No-op without scaling headroom.
    pub(crate) fn start_autoscaling(self: &Arc<Self>) -> Result<()> {
        let Some(scale) = self.shared.scale_receiver().cloned() else {
            return Ok(());
        };

        let upscaler = {
            let runtime = Arc::downgrade(self);
            let done = Arc::clone(&self.done);
            let config = self.scaling_config;
            spawn_named("scriptpool-upscaler", move || {
                run_upscaling(runtime, done, scale, config)
            })?
        };
        let downscaler = {
            let runtime = Arc::downgrade(self);
            let done = Arc::clone(&self.done);
            let interval = self.scaling_config.downscale_check_interval;
            spawn_named("scriptpool-downscaler", move || {
                run_downscaling(runtime, done, interval)
            })?
        };

        self.background.lock().extend([upscaler, downscaler]);
        debug!(max_scaled = self.max_scaled_threads(), "autoscaling started");
        Ok(())
    }

    /// Adds one regular thread.
    pub(crate) fn scale_regular_thread(&self) -> Result<Arc<ExecutionThread>> {
        self.scale_thread(None)
    }

    /// Adds one thread to `worker`, unless the worker is at its own limit.
    pub(crate) fn scale_worker_thread(&self, worker: &Arc<Worker>) -> Result<Arc<ExecutionThread>> {
        self.scale_thread(Some(worker))
    }

    fn scale_thread(&self, worker: Option<&Arc<Worker>>) -> Result<Arc<ExecutionThread>> {
        let mut scaling = self.scaling.lock();
        if !self.shared.main_state.is(StateId::Ready) {
            return Err(RuntimeError::NotRunning);
        }
        let max_scaled = self.max_scaled_threads();
        let scaled = scaling.active();
        if scaled >= max_scaled {
            return Err(RuntimeError::MaxThreadsReached);
        }
        if worker.is_some_and(|w| w.is_at_thread_limit()) {
            return Err(RuntimeError::MaxThreadsReached);
        }

        let low_latency = self
            .shared
            .latency
            .trigger_latency_tracking(scaled, max_scaled);
        let thread = self
            .get_inactive_thread()
            .ok_or(RuntimeError::MaxThreadsReached)?;
        thread.set_low_latency(low_latency);

        let converted = match worker {
            Some(worker) => self.convert_to_worker(&thread, worker),
            None => self.convert_to_regular(&thread),
        };
        if !converted {
            return Err(RuntimeError::TransitionRefused {
                index: thread.index(),
                state: thread.state().name().to_string(),
            });
        }
        thread.state().wait_for(&SETTLED);

        if !scaling.autoscaled.iter().any(|t| t.index() == thread.index()) {
            scaling.autoscaled.push(Arc::clone(&thread));
        }
        log_scheduler!(
            "scaling",
            "thread added",
            thread = thread.index(),
            worker = worker.map(|w| w.name()).unwrap_or("regular"),
            low_latency
        );
        Ok(thread)
    }

    /// Deactivates autoscaled threads idle for longer than `max_idle_time`.
    ///
    /// Idle `Ready` threads become inactive, threads that stay inactive for
    /// another idle period are shut down. Returns the number of threads
    /// stopped in this pass.
    pub(crate) fn deactivate_threads(&self) -> usize {
        let mut scaling = self.scaling.lock();
        let max_idle = self.scaling_config.max_idle_time.as_millis() as u64;
        let max_terminations = self.scaling_config.max_terminations_per_check;
        let mut stopped = 0;

        let mut i = scaling.autoscaled.len();
        while i > 0 {
            i -= 1;
            let thread = Arc::clone(&scaling.autoscaled[i]);

            // stopped by someone else
            if thread.state().is(StateId::Reserved) {
                scaling.autoscaled.remove(i);
                continue;
            }

            let wait_time = thread.state().wait_time();
            if stopped >= max_terminations || wait_time <= max_idle {
                continue;
            }

            if thread.state().is(StateId::Ready) {
                if self.convert_to_inactive(&thread) {
                    thread.set_low_latency(false);
                    stopped += 1;
                    log_scheduler!("scaling", "thread deactivated", thread = thread.index(), wait_time);
                }
                continue;
            }

            if thread.state().is(StateId::Inactive) {
                thread.shutdown();
                stopped += 1;
                scaling.autoscaled.remove(i);
                log_scheduler!("scaling", "thread stopped", thread = thread.index(), wait_time);
            }
        }

        self.shared
            .latency
            .stop_latency_tracking(scaling.active(), self.max_scaled_threads());
        stopped
    }
}

fn spawn_named(name: &str, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|err| RuntimeError::Other(anyhow::Error::new(err).context(format!("spawning {name}"))))
}

fn run_upscaling(
    runtime: Weak<RuntimeInner>,
    done: Arc<Signal>,
    scale: Receiver<Arc<RequestContext>>,
    config: ScalingConfig,
) {
    loop {
        let at_limit = match runtime.upgrade() {
            Some(inner) => inner.autoscaled_thread_count() >= inner.max_scaled_threads(),
            None => return,
        };
        if at_limit {
            // check again later, the downscaler may free capacity
            if done.wait_timeout(config.downscale_check_interval) {
                return;
            }
            continue;
        }

        let ctx = select! {
            recv(done.receiver()) -> _ => return,
            recv(scale) -> ctx => match ctx {
                Ok(ctx) => ctx,
                Err(_) => return,
            },
        };
        if ctx.elapsed() < config.min_stall_time {
            continue;
        }

        let Some(inner) = runtime.upgrade() else {
            return;
        };
        let result = match ctx.worker() {
            Some(worker) => inner.scale_worker_thread(worker),
            None => inner.scale_regular_thread(),
        };
        match result {
            Ok(_) | Err(RuntimeError::NotRunning) => {}
            Err(RuntimeError::MaxThreadsReached) => {
                warn!("could not increase the number of threads, consider raising max_threads");
            }
            Err(err) => error!(error = %err, "autoscaling failed"),
        }
    }
}

fn run_downscaling(runtime: Weak<RuntimeInner>, done: Arc<Signal>, interval: Duration) {
    loop {
        if done.wait_timeout(interval) {
            return;
        }
        let Some(inner) = runtime.upgrade() else {
            return;
        };
        let stopped = inner.deactivate_threads();
        if stopped > 0 {
            debug!(stopped, "idle threads deactivated");
        }
    }
}
