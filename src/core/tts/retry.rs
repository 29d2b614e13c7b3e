//! Exponential backoff policy for retryable provider failures.

use std::time::Duration;

use crate::config::RetrySettings;

/// Backoff never grows past this, whatever the attempt count.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Fixed retry budget with base-delay doubling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Backoff before retrying after `attempt` (zero-based) failed:
    /// `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(MAX_DELAY)
            .min(MAX_DELAY)
    }

    /// Whether another attempt remains after `attempt` (zero-based) failed.
    pub fn has_budget_after(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(settings.max_attempts, settings.base_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(250));
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1));
        assert_eq!(policy.delay_for(20), MAX_DELAY);
        assert_eq!(policy.delay_for(63), MAX_DELAY);
    }

    #[test]
    fn test_budget_counts_the_first_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        assert!(policy.has_budget_after(0));
        assert!(policy.has_budget_after(1));
        assert!(!policy.has_budget_after(2));
    }

    #[test]
    fn test_at_least_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_budget_after(0));
    }
}
