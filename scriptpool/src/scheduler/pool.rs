use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Select, Sender};
use http::StatusCode;
use parking_lot::RwLock;

use crate::context::RequestContext;
use crate::error::AdmissionError;
use crate::log_scheduler;
use crate::thread::ExecutionThread;

/// Minimum delay between two scale requests sent for the same queued request.
pub const SCALE_SIGNAL_INTERVAL: Duration = Duration::from_millis(5);

/// Threads currently playing one role, plus the shared queues they listen on.
///
/// Requests are first offered to each thread's own channel in attachment
/// order, so light load stays concentrated on the first threads. When nobody
/// is free the request waits on the shared channels. Low-latency threads
/// only listen on the fast channel.
pub struct ThreadPool {
    threads: RwLock<Vec<Arc<ExecutionThread>>>,
    normal_tx: Sender<Arc<RequestContext>>,
    normal_rx: Receiver<Arc<RequestContext>>,
    fast_tx: Sender<Arc<RequestContext>>,
    fast_rx: Receiver<Arc<RequestContext>>,
    queued: AtomicUsize,
}

impl ThreadPool {
    pub fn new() -> Self {
        let (normal_tx, normal_rx) = bounded(0);
        let (fast_tx, fast_rx) = bounded(0);
        Self {
            threads: RwLock::new(Vec::new()),
            normal_tx,
            normal_rx,
            fast_tx,
            fast_rx,
            queued: AtomicUsize::new(0),
        }
    }

    /// Adds `thread` at the end of the pool. Attaching twice is a no-op.
    pub fn attach(&self, thread: &Arc<ExecutionThread>) {
        let mut threads = self.threads.write();
        if threads.iter().any(|t| t.index() == thread.index()) {
            return;
        }
        threads.push(Arc::clone(thread));
    }

    pub fn detach(&self, thread: &ExecutionThread) {
        self.threads.write().retain(|t| t.index() != thread.index());
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }

    pub fn threads(&self) -> Vec<Arc<ExecutionThread>> {
        self.threads.read().clone()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.threads.read().iter().any(|t| t.index() == index)
    }

    /// Shared channel a thread of this pool waits on.
    pub fn receiver(&self, low_latency: bool) -> &Receiver<Arc<RequestContext>> {
        if low_latency {
            &self.fast_rx
        } else {
            &self.normal_rx
        }
    }

    /// Requests currently blocked in [`queue_request`](Self::queue_request).
    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Hands `ctx` to the first idle thread. Slow requests skip low-latency threads.
    pub fn dispatch_request(&self, ctx: &Arc<RequestContext>, is_fast: bool) -> bool {
        let threads = self.threads.read();
        for thread in threads.iter() {
            if thread.is_low_latency() && !is_fast {
                continue;
            }
            if thread.request_sender().try_send(Arc::clone(ctx)).is_ok() {
                log_scheduler!("pool", "dispatched", thread = thread.index(), request = %ctx.id());
                return true;
            }
        }
        false
    }

    /// Waits until a thread of the pool takes `ctx`.
    ///
    /// Fast requests are also offered on the fast channel. While waiting,
    /// `ctx` is repeatedly offered to the autoscaler through `scale`. Once
    /// `max_wait` elapses the request is rejected with 504.
    pub fn queue_request(
        &self,
        ctx: &Arc<RequestContext>,
        is_fast: bool,
        scale: Option<&Sender<Arc<RequestContext>>>,
        max_wait: Option<Duration>,
    ) -> Result<(), AdmissionError> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let result = self.wait_for_thread(ctx, is_fast, scale, max_wait);
        self.queued.fetch_sub(1, Ordering::SeqCst);

        if let Err(err) = &result {
            log_scheduler!("pool", "queue timeout", request = %ctx.id());
            ctx.reject(StatusCode::GATEWAY_TIMEOUT, &err.to_string());
        }
        result
    }

    fn wait_for_thread(
        &self,
        ctx: &Arc<RequestContext>,
        is_fast: bool,
        scale: Option<&Sender<Arc<RequestContext>>>,
        max_wait: Option<Duration>,
    ) -> Result<(), AdmissionError> {
        let started = Instant::now();
        let deadline = max_wait.map(|wait| started + wait);
        let mut next_scale = started;

        loop {
            let now = Instant::now();
            let scale_armed = scale.filter(|_| now >= next_scale);

            let mut select = Select::new();
            let normal = select.send(&self.normal_tx);
            let fast = is_fast.then(|| select.send(&self.fast_tx));
            let scale_op = scale_armed.map(|tx| select.send(tx));

            let rearm_at = match (scale, scale_armed) {
                (Some(_), None) => Some(next_scale),
                _ => None,
            };
            let wake_at = match (deadline, rearm_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            let oper = match wake_at {
                Some(at) => match select.select_deadline(at) {
                    Ok(oper) => oper,
                    Err(_) => {
                        if deadline.is_some_and(|d| Instant::now() >= d) {
                            return Err(AdmissionError::MaxWaitTimeExceeded(started.elapsed()));
                        }
                        continue;
                    }
                },
                None => select.select(),
            };

            let index = oper.index();
            if index == normal {
                // the pool owns both ends, so the send cannot fail
                let _ = oper.send(&self.normal_tx, Arc::clone(ctx));
                return Ok(());
            }
            if Some(index) == fast {
                let _ = oper.send(&self.fast_tx, Arc::clone(ctx));
                return Ok(());
            }
            if let (Some(op), Some(tx)) = (scale_op, scale_armed) {
                if index == op {
                    // a closed scale channel only means autoscaling stopped
                    let _ = oper.send(tx, Arc::clone(ctx));
                    log_scheduler!("pool", "scale requested", request = %ctx.id());
                    next_scale = Instant::now() + SCALE_SIGNAL_INTERVAL;
                }
            }
        }
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let threads: Vec<usize> = self.threads.read().iter().map(|t| t.index()).collect();
        f.debug_struct("ThreadPool")
            .field("threads", &threads)
            .field("queued", &self.queued_count())
            .finish()
    }
}
