use std::time::Duration;

use parking_lot::RwLock;

pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct BackoffState {
    backoff: Duration,
    failure_count: u32,
}

/// Doubling retry delay bounded by `min_backoff`/`max_backoff`.
///
/// A success resets the delay and the failure counter. When
/// `max_consecutive_failures` is `Some(n)`, the n-th failure in a row trips
/// the breaker; `None` never trips.
#[derive(Debug)]
pub struct ExponentialBackoff {
    min_backoff: Duration,
    max_backoff: Duration,
    max_consecutive_failures: Option<u32>,
    state: RwLock<BackoffState>,
}

impl ExponentialBackoff {
    pub fn new(
        min_backoff: Duration,
        max_backoff: Duration,
        max_consecutive_failures: Option<u32>,
    ) -> Self {
        Self {
            min_backoff,
            max_backoff,
            max_consecutive_failures,
            state: RwLock::new(BackoffState {
                backoff: min_backoff,
                failure_count: 0,
            }),
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.write();
        state.failure_count = 0;
        state.backoff = self.min_backoff;
    }

    /// Returns `true` once the consecutive failure threshold is reached.
    pub fn record_failure(&self) -> bool {
        let failure_count = {
            let mut state = self.state.write();
            state.failure_count += 1;
            if state.backoff < self.min_backoff {
                state.backoff = self.min_backoff;
            }
            state.backoff = (state.backoff * 2).min(self.max_backoff);
            state.failure_count
        };

        matches!(self.max_consecutive_failures, Some(max) if failure_count >= max)
    }

    /// Sleeps for the current delay, but only after at least one failure.
    pub fn wait(&self) {
        let delay = {
            let state = self.state.read();
            if state.failure_count == 0 {
                return;
            }
            state.backoff
        };
        std::thread::sleep(delay);
    }

    pub fn failure_count(&self) -> u32 {
        self.state.read().failure_count
    }

    pub fn current_backoff(&self) -> Duration {
        self.state.read().backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn success_resets_failures_and_delay() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(500),
            Duration::from_secs(5),
            Some(3),
        );
        backoff.record_failure();
        backoff.record_failure();
        assert_eq!(backoff.current_backoff(), Duration::from_secs(2));

        backoff.record_success();
        assert_eq!(backoff.failure_count(), 0);
        assert_eq!(backoff.current_backoff(), Duration::from_millis(500));
    }

    #[test]
    fn trips_on_the_configured_failure() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            Some(3),
        );
        assert!(!backoff.record_failure());
        assert!(!backoff.record_failure());
        assert!(backoff.record_failure());
    }

    #[test]
    fn never_trips_without_threshold() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(5), None);
        for _ in 0..50 {
            assert!(!backoff.record_failure());
        }
        assert_eq!(backoff.current_backoff(), Duration::from_millis(5));
    }

    #[test]
    fn wait_is_free_without_failures() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(20), None);
        let start = Instant::now();
        backoff.wait();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
