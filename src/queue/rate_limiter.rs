//! Per-item retry rate limiting.

use std::time::Duration;

use dashmap::DashMap;

/// Decides how long an item waits before it is re-added after a failure.
pub trait RateLimiter: Send + Sync {
    /// Delay for the next retry of `key`; records one more failure.
    fn when(&self, key: &str) -> Duration;

    /// Clear the failure history of `key`.
    fn forget(&self, key: &str);

    /// Number of failures recorded for `key` since it was last forgotten.
    fn num_requeues(&self, key: &str) -> u32;
}

/// Exponential per-item backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: DashMap<String, u32>,
}

impl ItemExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: DashMap::new(),
        }
    }
}

impl Default for ItemExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

impl RateLimiter for ItemExponentialBackoff {
    fn when(&self, key: &str) -> Duration {
        let exp = {
            let mut entry = self.failures.entry(key.to_string()).or_insert(0);
            let exp = *entry;
            *entry = exp.saturating_add(1);
            exp
        };

        // 2^exp overflows long before the cap is interesting
        let factor = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    fn forget(&self, key: &str) {
        self.failures.remove(key);
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).map_or(0, |n| *n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_failure() {
        let limiter = ItemExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(60));

        assert_eq!(limiter.when("a"), Duration::from_millis(100));
        assert_eq!(limiter.when("a"), Duration::from_millis(200));
        assert_eq!(limiter.when("a"), Duration::from_millis(400));
        assert_eq!(limiter.num_requeues("a"), 3);
    }

    #[test]
    fn test_backoff_is_capped() {
        let limiter = ItemExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5));

        let delays: Vec<_> = (0..6).map(|_| limiter.when("a")).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
    }

    #[test]
    fn test_backoff_survives_many_failures() {
        let limiter = ItemExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300));
        for _ in 0..100 {
            assert!(limiter.when("a") <= Duration::from_secs(300));
        }
        assert_eq!(limiter.when("a"), Duration::from_secs(300));
    }

    #[test]
    fn test_forget_resets_to_base() {
        let limiter = ItemExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        limiter.when("a");
        limiter.when("a");
        limiter.forget("a");

        assert_eq!(limiter.num_requeues("a"), 0);
        assert_eq!(limiter.when("a"), Duration::from_secs(1));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = ItemExponentialBackoff::default();
        limiter.when("a");
        limiter.when("a");

        assert_eq!(limiter.when("b"), Duration::from_secs(1));
        assert_eq!(limiter.num_requeues("a"), 2);
        assert_eq!(limiter.num_requeues("b"), 1);
    }
}
