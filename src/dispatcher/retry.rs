use std::time::Duration;

use crate::config::DispatcherConfig;

/// How often and how patiently a job is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: config.backoff_base.as_duration(),
            backoff_max: config.backoff_max.as_duration(),
        }
    }

    /// First attempt plus every retry
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether another attempt is allowed after `attempts` have run
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts()
    }

    /// Delay before retry `retry` (1-based): `base * 2^(retry - 1)`, capped
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(120),
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(3), Duration::from_secs(20));
        assert_eq!(policy.backoff(6), Duration::from_secs(120));
        assert_eq!(policy.backoff(64), Duration::from_secs(120));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = policy();
        assert_eq!(policy.max_attempts(), 4);
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from_config(&DispatcherConfig::default());
        assert_eq!(policy, self::policy());
    }
}
