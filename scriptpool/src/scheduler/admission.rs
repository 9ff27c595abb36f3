//! Admission control.
//!
//! A counting semaphore bounds how many requests a worker serves at once.
//! Contention is turned into a scale request for the autoscaler and, past the
//! configured deadline, into a timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};

use crate::context::RequestContext;
use crate::error::AdmissionError;
use crate::log_scheduler;

#[derive(Debug)]
struct Permits {
    capacity: usize,
    in_use: usize,
}

/// Counting semaphore whose capacity can change while permits are held.
///
/// Shrinking below the number of held permits is allowed; new permits are
/// handed out again once enough of them are released.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<Permits>,
    released: Condvar,
}

/// Returns its permit when dropped.
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Mutex::new(Permits {
                capacity,
                in_use: 0,
            }),
            released: Condvar::new(),
        }
    }

    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        let mut permits = self.permits.lock();
        self.take(&mut permits)
    }

    /// Blocks until a permit is available.
    pub fn acquire(&self) -> SemaphorePermit<'_> {
        let mut permits = self.permits.lock();
        loop {
            if let Some(permit) = self.take(&mut permits) {
                return permit;
            }
            self.released.wait(&mut permits);
        }
    }

    /// Blocks for at most `timeout`. `None` if no permit became available.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<SemaphorePermit<'_>> {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        loop {
            if let Some(permit) = self.take(&mut permits) {
                return Some(permit);
            }
            if self.released.wait_until(&mut permits, deadline).timed_out() {
                return self.take(&mut permits);
            }
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.permits.lock().capacity = capacity;
        self.released.notify_all();
    }

    pub fn capacity(&self) -> usize {
        self.permits.lock().capacity
    }

    pub fn available_permits(&self) -> usize {
        let permits = self.permits.lock();
        permits.capacity.saturating_sub(permits.in_use)
    }

    fn take(&self, permits: &mut Permits) -> Option<SemaphorePermit<'_>> {
        if permits.in_use < permits.capacity {
            permits.in_use += 1;
            Some(SemaphorePermit { semaphore: self })
        } else {
            None
        }
    }

    fn release(&self) {
        self.permits.lock().in_use -= 1;
        self.released.notify_one();
    }
}

/// Deadlines applied while waiting for a permit.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy {
    /// `None` waits forever.
    pub max_wait_time: Option<Duration>,
    /// How long to wait before asking the autoscaler for help.
    pub min_stall_time: Duration,
}

/// Acquires a permit from `semaphore`, escalating under contention.
///
/// A free permit is taken right away. Otherwise, with a scale channel, the
/// caller waits `min_stall_time` and then offers `ctx` to the autoscaler
/// without blocking. The remaining wait is bounded by `max_wait_time` when
/// set and unbounded otherwise.
pub fn acquire_with_admission_control<'a>(
    semaphore: &'a Semaphore,
    scale: Option<&Sender<Arc<RequestContext>>>,
    ctx: &Arc<RequestContext>,
    policy: &AdmissionPolicy,
) -> Result<SemaphorePermit<'a>, AdmissionError> {
    if let Some(permit) = semaphore.try_acquire() {
        return Ok(permit);
    }

    let started = Instant::now();
    if let Some(scale) = scale {
        if let Some(permit) = semaphore.acquire_timeout(policy.min_stall_time) {
            return Ok(permit);
        }
        // best effort, the autoscaler may be busy
        if scale.try_send(Arc::clone(ctx)).is_ok() {
            log_scheduler!("admission", "scale requested", request = %ctx.id());
        }
    }

    match policy.max_wait_time {
        Some(max_wait_time) => semaphore
            .acquire_timeout(max_wait_time)
            .ok_or_else(|| AdmissionError::MaxWaitTimeExceeded(started.elapsed())),
        None => Ok(semaphore.acquire()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn policy(max_wait_time: Option<Duration>) -> AdmissionPolicy {
        AdmissionPolicy {
            max_wait_time,
            min_stall_time: Duration::from_millis(5),
        }
    }

    #[test]
    fn permits_are_returned_on_drop() {
        let semaphore = Semaphore::new(1);
        let permit = semaphore.try_acquire();
        assert!(permit.is_some());
        assert!(semaphore.try_acquire().is_none());
        drop(permit);
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[test]
    fn growing_capacity_wakes_waiters() {
        let semaphore = Arc::new(Semaphore::new(0));
        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            std::thread::spawn(move || semaphore.acquire_timeout(Duration::from_secs(5)).is_some())
        };
        std::thread::sleep(Duration::from_millis(20));
        semaphore.set_capacity(1);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn shrinking_below_held_permits_blocks_new_ones() {
        let semaphore = Semaphore::new(2);
        let first = semaphore.try_acquire();
        let _second = semaphore.try_acquire();
        semaphore.set_capacity(1);
        drop(first);
        assert!(semaphore.try_acquire().is_none());
    }

    #[test]
    fn times_out_when_saturated() {
        let semaphore = Semaphore::new(1);
        let _held = semaphore.acquire();
        let ctx = Arc::new(RequestContext::for_worker("w"));

        let result = acquire_with_admission_control(
            &semaphore,
            None,
            &ctx,
            &policy(Some(Duration::from_millis(10))),
        );
        assert!(matches!(
            result,
            Err(AdmissionError::MaxWaitTimeExceeded(_))
        ));
    }

    #[test]
    fn stalled_request_is_offered_to_the_autoscaler() {
        let semaphore = Semaphore::new(1);
        let held = semaphore.acquire();
        let ctx = Arc::new(RequestContext::for_worker("w"));
        let (scale_tx, scale_rx) = bounded::<Arc<RequestContext>>(1);

        std::thread::scope(|s| {
            s.spawn(|| {
                let offered = scale_rx.recv_timeout(Duration::from_secs(5)).unwrap();
                assert_eq!(offered.id(), ctx.id());
                drop(held);
            });
            let permit = acquire_with_admission_control(
                &semaphore,
                Some(&scale_tx),
                &ctx,
                &policy(Some(Duration::from_secs(5))),
            );
            assert!(permit.is_ok());
        });
    }

    #[test]
    fn full_scale_channel_does_not_block() {
        let semaphore = Semaphore::new(1);
        let _held = semaphore.acquire();
        let ctx = Arc::new(RequestContext::for_worker("w"));
        let (scale_tx, _scale_rx) = bounded::<Arc<RequestContext>>(0);

        let started = Instant::now();
        let result = acquire_with_admission_control(
            &semaphore,
            Some(&scale_tx),
            &ctx,
            &policy(Some(Duration::from_millis(20))),
        );
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
