//! Exponential backoff for provider calls

use std::time::Duration;

use crate::config::RetrySettings;
use crate::providers::ProviderError;

/// How many times to try a provider call and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }

    /// Delay before retry number `retry` (0 for the first retry)
    ///
    /// `min(base * 2^retry, max)`
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retrying after `error`
    ///
    /// A provider-side 429 waits at least as long as the provider asked.
    pub fn delay_for(&self, retry: u32, error: &ProviderError) -> Duration {
        let backoff = self.backoff(retry);
        match error {
            ProviderError::RateLimited {
                retry_after: Some(wait),
            } => backoff.max(*wait),
            _ => backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = policy();
        let delays: Vec<u64> = (0..6).map(|n| policy.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_backoff_survives_huge_exponents() {
        assert_eq!(policy().backoff(200), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_after_extends_delay() {
        let policy = policy();
        let limited = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(9)),
        };
        assert_eq!(policy.delay_for(0, &limited), Duration::from_secs(9));
        // A short retry-after never shortens the backoff
        assert_eq!(policy.delay_for(3, &limited), Duration::from_secs(16));
        assert_eq!(
            policy.delay_for(1, &ProviderError::Transient("reset".into())),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn test_defaults_follow_settings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }
}
