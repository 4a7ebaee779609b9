//! Call metrics with cached snapshots.
//!
//! The tracker keeps plain counters plus a running latency aggregate and
//! publishes immutable [`MetricsSnapshot`] values. Snapshots are rebuilt
//! only when a mutator ran since the last read; unchanged reads return the
//! same `Arc`, so hot health endpoints never pay for re-aggregation.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use serde::Serialize;

/// Immutable view of the tracker at one point in time.
///
/// `min_latency_ms` is 0 until the first successful call has been recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Calls started, independent of their outcome or retry count.
    pub total_calls: u64,
    /// Calls that returned a response.
    pub successful_calls: u64,
    /// Calls that terminated with an error (a stale cache hit still counts here).
    pub failed_calls: u64,
    /// Retry attempts across all calls.
    pub total_retries: u64,
    /// Circuit-breaker trips reported by the embedding application.
    pub circuit_breaker_trips: u64,
    /// Fallback-cache hits.
    pub cache_hits: u64,
    /// Fallback-cache misses.
    pub cache_misses: u64,
    /// Mean latency of successful calls, rounded to whole milliseconds.
    pub avg_latency_ms: u64,
    /// Slowest successful call.
    pub max_latency_ms: u64,
    /// Fastest successful call, 0 when no samples exist.
    pub min_latency_ms: u64,
    /// When the counters were last reset (or created).
    pub last_reset_at: SystemTime,
}

#[derive(Debug)]
struct MetricsInner {
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    total_retries: u64,
    circuit_breaker_trips: u64,
    cache_hits: u64,
    cache_misses: u64,
    latency_sum_ms: f64,
    min_latency_ms: f64,
    max_latency_ms: f64,
    last_reset_at: SystemTime,
    dirty: bool,
    snapshot: Arc<MetricsSnapshot>,
}

impl MetricsInner {
    fn new() -> Self {
        let now = SystemTime::now();
        Self {
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            total_retries: 0,
            circuit_breaker_trips: 0,
            cache_hits: 0,
            cache_misses: 0,
            latency_sum_ms: 0.0,
            min_latency_ms: f64::INFINITY,
            max_latency_ms: 0.0,
            last_reset_at: now,
            dirty: false,
            snapshot: Arc::new(MetricsSnapshot {
                total_calls: 0,
                successful_calls: 0,
                failed_calls: 0,
                total_retries: 0,
                circuit_breaker_trips: 0,
                cache_hits: 0,
                cache_misses: 0,
                avg_latency_ms: 0,
                max_latency_ms: 0,
                min_latency_ms: 0,
                last_reset_at: now,
            }),
        }
    }

    fn rebuild_snapshot(&self) -> MetricsSnapshot {
        let avg_latency_ms = if self.successful_calls == 0 {
            0
        } else {
            (self.latency_sum_ms / self.successful_calls as f64).round() as u64
        };
        let min_latency_ms = if self.min_latency_ms.is_finite() {
            self.min_latency_ms.round() as u64
        } else {
            0
        };

        MetricsSnapshot {
            total_calls: self.total_calls,
            successful_calls: self.successful_calls,
            failed_calls: self.failed_calls,
            total_retries: self.total_retries,
            circuit_breaker_trips: self.circuit_breaker_trips,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            avg_latency_ms,
            max_latency_ms: self.max_latency_ms.round() as u64,
            min_latency_ms,
            last_reset_at: self.last_reset_at,
        }
    }
}

/// Shared metrics accumulator.
///
/// Cloning is cheap; all clones observe the same counters. Every operation
/// is infallible.
#[derive(Debug, Clone)]
pub struct MetricsTracker {
    inner: Arc<Mutex<MetricsInner>>,
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsTracker {
    /// Creates a tracker with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(MetricsInner::new())) }
    }

    /// Records that a user call started. Called once per call, not per attempt.
    pub fn record_call_start(&self) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.dirty = true;
    }

    /// Records a successful call and its latency.
    pub fn record_success(&self, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1_000.0;
        let mut inner = self.inner.lock();
        inner.successful_calls += 1;
        inner.latency_sum_ms += latency_ms;
        inner.min_latency_ms = inner.min_latency_ms.min(latency_ms);
        inner.max_latency_ms = inner.max_latency_ms.max(latency_ms);
        inner.dirty = true;
    }

    /// Records a call that terminated with an error.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failed_calls += 1;
        inner.dirty = true;
    }

    /// Records one retry attempt.
    pub fn record_retry(&self) {
        let mut inner = self.inner.lock();
        inner.total_retries += 1;
        inner.dirty = true;
    }

    /// Records a circuit-breaker trip reported by the embedding application.
    pub fn record_circuit_breaker_trip(&self) {
        let mut inner = self.inner.lock();
        inner.circuit_breaker_trips += 1;
        inner.dirty = true;
    }

    /// Records a fallback-cache hit.
    pub fn record_cache_hit(&self) {
        let mut inner = self.inner.lock();
        inner.cache_hits += 1;
        inner.dirty = true;
    }

    /// Records a fallback-cache miss.
    pub fn record_cache_miss(&self) {
        let mut inner = self.inner.lock();
        inner.cache_misses += 1;
        inner.dirty = true;
    }

    /// Zeroes all counters and stamps a new reset time.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = MetricsInner::new();
        inner.dirty = true;
    }

    /// Returns the current snapshot, rebuilding it only if a mutator ran
    /// since the last read.
    #[must_use]
    pub fn snapshot(&self) -> Arc<MetricsSnapshot> {
        let mut inner = self.inner.lock();
        if inner.dirty {
            let rebuilt = inner.rebuild_snapshot();
            inner.snapshot = Arc::new(rebuilt);
            inner.dirty = false;
        }
        Arc::clone(&inner.snapshot)
    }

    /// Percentage of started calls that succeeded, rounded; 100 when no
    /// calls have been made.
    #[must_use]
    pub fn success_rate(&self) -> u32 {
        let inner = self.inner.lock();
        if inner.total_calls == 0 {
            100
        } else {
            (inner.successful_calls as f64 / inner.total_calls as f64 * 100.0).round() as u32
        }
    }

    /// Percentage of cache lookups that hit, rounded; 0 when the cache has
    /// never been consulted.
    #[must_use]
    pub fn cache_hit_rate(&self) -> u32 {
        let inner = self.inner.lock();
        let lookups = inner.cache_hits + inner.cache_misses;
        if lookups == 0 {
            0
        } else {
            (inner.cache_hits as f64 / lookups as f64 * 100.0).round() as u32
        }
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod proptest_tests {
    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        Success(u16),
        Failure,
    }

    fn outcome() -> impl Strategy<Value = Outcome> {
        prop_oneof![any::<u16>().prop_map(Outcome::Success), Just(Outcome::Failure)]
    }

    proptest! {
        /// Conservation: once every started call has terminated,
        /// successes + failures == total.
        #[test]
        fn prop_call_conservation(outcomes in proptest::collection::vec(outcome(), 0..64)) {
            let metrics = MetricsTracker::new();
            for o in &outcomes {
                metrics.record_call_start();
                match o {
                    Outcome::Success(ms) => {
                        metrics.record_success(Duration::from_millis(u64::from(*ms)));
                    }
                    Outcome::Failure => metrics.record_failure(),
                }
            }

            let snapshot = metrics.snapshot();
            prop_assert_eq!(snapshot.total_calls, outcomes.len() as u64);
            prop_assert_eq!(
                snapshot.successful_calls + snapshot.failed_calls,
                snapshot.total_calls
            );
        }

        /// Monotonicity: counters never decrease while recording.
        #[test]
        fn prop_counters_monotonic(outcomes in proptest::collection::vec(outcome(), 1..32)) {
            let metrics = MetricsTracker::new();
            let mut previous = metrics.snapshot();
            for o in &outcomes {
                metrics.record_call_start();
                match o {
                    Outcome::Success(ms) => {
                        metrics.record_success(Duration::from_millis(u64::from(*ms)));
                    }
                    Outcome::Failure => metrics.record_failure(),
                }
                let current = metrics.snapshot();
                prop_assert!(current.total_calls >= previous.total_calls);
                prop_assert!(current.successful_calls >= previous.successful_calls);
                prop_assert!(current.failed_calls >= previous.failed_calls);
                prop_assert!(current.total_retries >= previous.total_retries);
                previous = current;
            }
        }

        /// Min never exceeds max once a sample exists, and the average sits
        /// between them.
        #[test]
        fn prop_latency_ordering(samples in proptest::collection::vec(1u16..10_000, 1..32)) {
            let metrics = MetricsTracker::new();
            for ms in &samples {
                metrics.record_call_start();
                metrics.record_success(Duration::from_millis(u64::from(*ms)));
            }

            let snapshot = metrics.snapshot();
            prop_assert!(snapshot.min_latency_ms <= snapshot.max_latency_ms);
            prop_assert!(snapshot.avg_latency_ms >= snapshot.min_latency_ms);
            prop_assert!(snapshot.avg_latency_ms <= snapshot.max_latency_ms);
        }
    }
}
