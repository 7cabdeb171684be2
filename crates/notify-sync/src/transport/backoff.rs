//! Bounded exponential backoff for reconnection.

use std::time::Duration;

/// Reconnection policy: `delay(k) = min(base * 2^(k-1), ceiling)` for the
/// k-th consecutive retry, giving up after `max_attempts` consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before the k-th retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide what follows the `failures`-th consecutive failure.
    ///
    /// Returns the delay before the next retry, or `None` when the retry
    /// budget is exhausted.
    pub fn next_retry(&self, failures: u32) -> Option<Duration> {
        if failures >= self.max_attempts {
            None
        } else {
            Some(self.delay_for(failures))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(10, Duration::from_secs(1), Duration::from_secs(30))
    }

    #[test]
    fn test_delays_double_until_ceiling() {
        let p = policy();
        let delays: Vec<u64> = (1..=7).map(|k| p.delay_for(k).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_huge_retry_index_saturates() {
        assert_eq!(policy().delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_budget_exhaustion() {
        let p = ReconnectPolicy::new(3, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(p.next_retry(1), Some(Duration::from_secs(1)));
        assert_eq!(p.next_retry(2), Some(Duration::from_secs(2)));
        assert_eq!(p.next_retry(3), None);
    }

    #[test]
    fn test_zero_budget_never_retries() {
        let p = ReconnectPolicy::new(0, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(p.next_retry(1), None);
    }
}
