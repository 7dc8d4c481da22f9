//! Pure retry policy for device re-initialization

use crate::config::HealthSection;
use std::time::Duration;

/// Exponential backoff settings for failed devices
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// None retries forever
    pub max_retries: Option<u32>,
    pub health_check_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&HealthSection::default())
    }
}

impl From<&HealthSection> for RetryPolicy {
    fn from(section: &HealthSection) -> Self {
        Self {
            initial_delay: Duration::from_millis(section.initial_retry_delay_ms),
            max_delay: Duration::from_millis(section.max_retry_delay_ms),
            multiplier: section.retry_backoff_multiplier,
            max_retries: section.max_retries,
            health_check_interval: Duration::from_millis(section.health_check_interval_ms),
        }
    }
}

/// What a failure should lead to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// `min(max_delay, initial_delay * multiplier^(failure_count - 1))`
    pub fn backoff_delay(&self, failure_count: u32) -> Duration {
        let exponent = failure_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (initial_ms * self.multiplier.powi(exponent)).min(max_ms);

        if delay_ms.is_finite() && delay_ms >= 0.0 {
            Duration::from_millis(delay_ms as u64)
        } else {
            self.max_delay
        }
    }

    /// Decide after the `failure_count`-th consecutive failure
    pub fn decide(&self, failure_count: u32) -> RetryDecision {
        match self.max_retries {
            Some(max) if failure_count >= max => RetryDecision::GiveUp,
            _ => RetryDecision::RetryAfter(self.backoff_delay(failure_count)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_backoff_sequence() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=9)
            .map(|n| policy.backoff_delay(n).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300, 300]);
    }

    #[test]
    fn test_unlimited_retries_never_give_up() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(10_000),
            RetryDecision::RetryAfter(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_finite_retries_give_up_at_limit() {
        let policy = RetryPolicy {
            max_retries: Some(3),
            ..RetryPolicy::default()
        };
        assert_eq!(
            policy.decide(2),
            RetryDecision::RetryAfter(Duration::from_secs(10))
        );
        assert_eq!(policy.decide(3), RetryDecision::GiveUp);
    }

    proptest! {
        #[test]
        fn test_backoff_is_capped_and_monotonic(failures in 1u32..200) {
            let policy = RetryPolicy::default();
            let current = policy.backoff_delay(failures);
            let next = policy.backoff_delay(failures + 1);
            prop_assert!(current <= policy.max_delay);
            prop_assert!(next >= current);
        }
    }
}
