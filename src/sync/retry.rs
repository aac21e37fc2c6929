// sync/retry.rs - Exponential backoff policy

use std::time::Duration;

/// Upper bound on a single backoff delay
const MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Retry accounting shared by the queue and the transport
///
/// `max_retries` is the dead-letter threshold; `delay_for` yields the
/// classic doubling schedule, capped at 30 seconds.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self
            .base_delay
            .as_millis()
            .saturating_mul(multiplier as u128);
        Duration::from_millis(delay.min(MAX_DELAY.as_millis()) as u64)
    }

    /// Whether an item with this retry count is dead
    pub fn is_exhausted(&self, retry_count: i64) -> bool {
        retry_count >= self.max_retries as i64
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(5), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(63), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(30_000));
    }

    #[test]
    fn test_exhaustion_threshold() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(10));
    }
}
