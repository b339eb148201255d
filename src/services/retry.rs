//! Retry policy with exponential backoff and jitter
//!
//! Drives the per-attempt delay for provider adapters. Upstream-advised
//! delays (parsed from error messages) take precedence over computed
//! backoff.

use std::time::Duration;

/// Retry configuration shared by the provider adapters
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry budget on top of the initial attempt
    pub max_retries: u32,
    /// Base delay time (milliseconds)
    pub base_delay_ms: u64,
    /// Maximum delay time (milliseconds)
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0) randomizing the delay around its center
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 1000,
            max_delay_ms: 10000,
            jitter_factor: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff delay for a retry attempt (0-indexed).
    ///
    /// Exponential: base * 2^attempt, capped at the maximum, then
    /// jittered by +/-(factor * delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16));
        let capped = base.min(self.max_delay_ms);

        let jittered = if self.jitter_factor > 0.0 {
            let range = (capped as f64 * self.jitter_factor) as u64;
            if range == 0 {
                capped
            } else {
                let offset = random_u64() % (range * 2 + 1);
                capped.saturating_sub(range).saturating_add(offset)
            }
        } else {
            capped
        };

        Duration::from_millis(jittered)
    }
}

/// Cheap thread-local xorshift generator for jitter.
///
/// Jitter only needs to decorrelate concurrent retry loops, not be
/// unpredictable.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9E3779B97F4A7C15)
                | 1
        );
    }

    STATE.with(|state| {
        let mut x = state.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        state.set(x);
        x
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 10000);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
        // Capped at max_delay_ms
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(10000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for attempt in 0..4 {
            let base = (policy.base_delay_ms << attempt).min(policy.max_delay_ms);
            let range = (base as f64 * policy.jitter_factor) as u64;
            for _ in 0..50 {
                let delay = policy.delay_for_attempt(attempt).as_millis() as u64;
                assert!(delay >= base - range && delay <= base + range);
            }
        }
    }
}
