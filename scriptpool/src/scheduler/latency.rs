//! Latency tracking.
//!
//! Request durations are aggregated per normalized path as an exponential
//! moving average. The averages classify incoming requests as fast or slow,
//! which decides whether they may use the fast lane served by low-latency
//! threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, info};

use crate::context::RequestContext;

/// Path segments longer than this are replaced by `:slug`.
pub const MAX_SEGMENT_LEN: usize = 50;

/// Scale requests dropped when a path newly turns slow.
pub const MAX_DRAINED_SCALE_REQUESTS: usize = 10;

lazy_static! {
    static ref NUMERIC_SEGMENT: Regex = Regex::new(r"^\d+$").expect("numeric segment pattern");
    static ref UUID_SEGMENT: Regex =
        Regex::new(r"^[a-f0-9-]{36}$").expect("uuid segment pattern");
}

/// Collapses identifier-like segments so that `/user/1` and `/user/2` share
/// one entry. Empty segments are dropped.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if NUMERIC_SEGMENT.is_match(segment) {
                ":id"
            } else if UUID_SEGMENT.is_match(segment) {
                ":uuid"
            } else if segment.len() > MAX_SEGMENT_LEN {
                ":slug"
            } else {
                segment
            }
        })
        .collect();

    if segments.is_empty() {
        return "/".to_string();
    }
    let joined = segments.join("/");
    if path.starts_with('/') {
        format!("/{joined}")
    } else {
        joined
    }
}

pub struct LatencyTracker {
    enabled: AtomicBool,
    threshold: Duration,
    percentile: u8,
    capacity: usize,
    table: RwLock<HashMap<String, Duration>>,
}

impl LatencyTracker {
    pub fn new(threshold: Duration, percentile: u8, capacity: usize) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            threshold,
            percentile,
            capacity,
            table: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    fn in_band(&self, scaled: usize, max_scaled: usize) -> bool {
        max_scaled > 0 && scaled * 100 >= max_scaled * usize::from(self.percentile)
    }

    /// Engages tracking once `scaled` autoscaled threads reach the configured
    /// percentile of `max_scaled`. Returns whether tracking is engaged.
    pub fn trigger_latency_tracking(&self, scaled: usize, max_scaled: usize) -> bool {
        if self.in_band(scaled, max_scaled) && !self.enabled.swap(true, Ordering::SeqCst) {
            info!(scaled, max_scaled, "latency tracking enabled");
        }
        self.is_enabled()
    }

    /// Disengages tracking once the autoscaled thread count drops below the band.
    pub fn stop_latency_tracking(&self, scaled: usize, max_scaled: usize) {
        if !self.in_band(scaled, max_scaled) && self.enabled.swap(false, Ordering::SeqCst) {
            info!(scaled, max_scaled, "latency tracking disabled");
        }
    }

    /// Folds `duration` into the average of `path`. Returns `true` if the
    /// path crossed the slow threshold with this sample.
    pub fn record(&self, path: &str, duration: Duration) -> bool {
        let key = normalize_path(path);
        let mut table = self.table.write();
        if !table.contains_key(&key) && table.len() >= self.capacity {
            debug!(capacity = self.capacity, "latency table full, clearing");
            table.clear();
        }

        let average = table.entry(key).or_insert(Duration::ZERO);
        let was_slow = self.is_slow(*average);
        *average = *average / 2 + duration / 2;
        !was_slow && self.is_slow(*average)
    }

    pub fn average(&self, path: &str) -> Option<Duration> {
        self.table.read().get(&normalize_path(path)).copied()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    fn is_slow(&self, average: Duration) -> bool {
        average > Duration::ZERO && average >= self.threshold
    }

    /// Records a finished request. Durations under the threshold are ignored
    /// unless `force` is set, so a slow path can recover.
    ///
    /// When a path newly turns slow while tracking is engaged, up to
    /// [`MAX_DRAINED_SCALE_REQUESTS`] pending scale requests are dropped.
    pub fn track_request_latency(
        &self,
        ctx: &RequestContext,
        duration: Duration,
        force: bool,
        scale: Option<&Receiver<Arc<RequestContext>>>,
    ) {
        let Some(path) = ctx.path() else {
            return;
        };
        if duration < self.threshold && !force {
            return;
        }

        let newly_slow = self.record(path, duration);
        if !newly_slow {
            return;
        }
        debug!(path, ?duration, "slow request path detected");

        if let (true, Some(scale)) = (self.is_enabled(), scale) {
            let drained = scale.try_iter().take(MAX_DRAINED_SCALE_REQUESTS).count();
            if drained > 0 {
                debug!(drained, "dropped pending scale requests");
            }
        }
    }

    /// `true` if the average for the request's path is at or above the threshold.
    /// Paths without history are fast.
    pub fn is_high_latency_request(&self, ctx: &RequestContext) -> bool {
        ctx.path()
            .and_then(|path| self.average(path))
            .is_some_and(|average| self.is_slow(average))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn ctx(path: &str) -> RequestContext {
        RequestContext::new(http::Request::builder().uri(path).body(Bytes::new()).unwrap())
    }

    #[test]
    fn identifiers_are_collapsed() {
        assert_eq!(normalize_path("/user/123/profile"), "/user/:id/profile");
        assert_eq!(
            normalize_path("/item/3fa85f64-5717-4562-b3fc-2c963f66afa6"),
            "/item/:uuid"
        );
        let token = "a".repeat(60);
        assert_eq!(normalize_path(&format!("/reset/{token}")), "/reset/:slug");
        assert_eq!(normalize_path("/static//app.js"), "/static/app.js");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(path in "(/[a-z0-9-]{0,70}){0,6}") {
            let once = normalize_path(&path);
            prop_assert_eq!(normalize_path(&once), once);
        }
    }

    #[test]
    fn average_converges() {
        let tracker = LatencyTracker::new(Duration::from_millis(100), 80, 1000);
        let target = Duration::from_millis(400);
        for _ in 0..20 {
            tracker.record("/slow", target);
        }
        let average = tracker.average("/slow").unwrap();
        assert!(target - average < Duration::from_millis(1));
    }

    #[test]
    fn fast_requests_are_not_recorded_unless_forced() {
        let tracker = LatencyTracker::new(Duration::from_millis(100), 80, 1000);
        let request = ctx("/fast");
        tracker.track_request_latency(&request, Duration::from_millis(10), false, None);
        assert!(tracker.is_empty());

        tracker.track_request_latency(&request, Duration::from_millis(10), true, None);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn slow_paths_are_classified_high_latency() {
        let tracker = LatencyTracker::new(Duration::from_millis(100), 80, 1000);
        let request = ctx("/report/42");
        assert!(!tracker.is_high_latency_request(&request));

        for _ in 0..5 {
            tracker.track_request_latency(&request, Duration::from_millis(500), false, None);
        }
        assert!(tracker.is_high_latency_request(&ctx("/report/7")));
        assert!(!tracker.is_high_latency_request(&ctx("/report/7/edit")));
    }

    #[test]
    fn table_is_cleared_when_full() {
        let tracker = LatencyTracker::new(Duration::from_millis(1), 80, 2);
        tracker.record("/a", Duration::from_millis(5));
        tracker.record("/b", Duration::from_millis(5));
        tracker.record("/c", Duration::from_millis(5));
        assert_eq!(tracker.len(), 1);
        assert!(tracker.average("/c").is_some());
    }

    #[test]
    fn tracking_follows_the_percentile_band() {
        let tracker = LatencyTracker::new(Duration::from_millis(1), 80, 10);
        assert!(!tracker.trigger_latency_tracking(7, 10));
        assert!(tracker.trigger_latency_tracking(8, 10));
        tracker.stop_latency_tracking(9, 10);
        assert!(tracker.is_enabled());
        tracker.stop_latency_tracking(3, 10);
        assert!(!tracker.is_enabled());
        assert!(!tracker.trigger_latency_tracking(0, 0));
    }
}
