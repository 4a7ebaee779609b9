//! Backoff schedules for the retry and reconnect paths.
//!
//! The two paths intentionally differ:
//! - **Retry** (per-call attempts): pure exponential, no cap and no jitter,
//!   matching the observable timing of existing deployments.
//! - **Reconnect** (connection manager): exponential with up to one second of
//!   uniform jitter, capped at the configured maximum.

use std::time::Duration;

use rand::Rng;

/// Upper bound of the uniform jitter added to reconnect delays.
const RECONNECT_JITTER_MS: u64 = 1_000;

/// Delay before the next call retry: `base * 2^attempt`.
///
/// `attempt` is the zero-based index of the attempt that just failed.
/// Saturates instead of overflowing for absurd attempt counts.
#[must_use]
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// Delay before the next reconnect attempt:
/// `min(initial * 2^attempts + U(0, 1s), max)`.
///
/// `attempts` is the number of reconnect attempts already made. Jitter
/// spreads simultaneous reconnects from many client instances.
#[must_use]
pub fn reconnect_delay(initial: Duration, max: Duration, attempts: u32) -> Duration {
    let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
    let base = initial.saturating_mul(factor);
    let jitter = Duration::from_millis(rand::rng().random_range(0..RECONNECT_JITTER_MS));
    base.saturating_add(jitter).min(max)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_per_attempt() {
        let base = Duration::from_millis(1_000);
        assert_eq!(retry_delay(base, 0), Duration::from_millis(1_000));
        assert_eq!(retry_delay(base, 1), Duration::from_millis(2_000));
        assert_eq!(retry_delay(base, 2), Duration::from_millis(4_000));
        assert_eq!(retry_delay(base, 3), Duration::from_millis(8_000));
    }

    #[test]
    fn retry_delay_has_no_cap() {
        // 1s * 2^20 = ~12 days. Deliberately uncapped.
        let base = Duration::from_secs(1);
        assert_eq!(retry_delay(base, 20), Duration::from_secs(1 << 20));
    }

    #[test]
    fn retry_delay_saturates_on_huge_attempts() {
        let base = Duration::from_secs(1);
        let delay = retry_delay(base, 64);
        assert_eq!(delay, base.saturating_mul(u32::MAX));
    }

    #[test]
    fn reconnect_delay_within_jitter_window() {
        let initial = Duration::from_millis(1_000);
        let max = Duration::from_millis(30_000);

        for _ in 0..100 {
            let delay = reconnect_delay(initial, max, 0);
            assert!(delay >= Duration::from_millis(1_000), "delay {delay:?} below base");
            assert!(delay < Duration::from_millis(2_000), "delay {delay:?} above base + jitter");
        }
    }

    #[test]
    fn reconnect_delay_caps_at_max() {
        let initial = Duration::from_millis(1_000);
        let max = Duration::from_millis(30_000);

        // 1s * 2^10 = 1024s, far past the cap.
        for _ in 0..20 {
            assert_eq!(reconnect_delay(initial, max, 10), max);
        }
    }

    #[test]
    fn reconnect_delay_grows_before_cap() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(600);

        // With jitter < 1s and bases 100ms * 2^attempts, consecutive windows
        // are disjoint once the base step exceeds the jitter span.
        let late = reconnect_delay(initial, max, 6); // base 6.4s
        let early = reconnect_delay(initial, max, 2); // base 400ms, < 1.4s with jitter
        assert!(late > early);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod proptest_tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Reconnect delay never exceeds the configured maximum.
        #[test]
        fn prop_reconnect_delay_bounded(
            initial_ms in 1u64..10_000,
            max_ms in 1u64..120_000,
            attempts in 0u32..40
        ) {
            let delay = reconnect_delay(
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
                attempts,
            );
            prop_assert!(delay <= Duration::from_millis(max_ms));
        }

        /// Retry delay is exact exponential growth within the non-saturating range.
        #[test]
        fn prop_retry_delay_exact(base_ms in 1u64..10_000, attempt in 0u32..20) {
            let delay = retry_delay(Duration::from_millis(base_ms), attempt);
            prop_assert_eq!(delay, Duration::from_millis(base_ms * (1u64 << attempt)));
        }

        /// Retry delays are monotonically non-decreasing in the attempt index.
        #[test]
        fn prop_retry_delay_monotonic(base_ms in 1u64..10_000, attempt in 0u32..30) {
            let a = retry_delay(Duration::from_millis(base_ms), attempt);
            let b = retry_delay(Duration::from_millis(base_ms), attempt + 1);
            prop_assert!(b >= a);
        }
    }
}
