//! Retry policies for query functions.

use std::time::Duration;

use crate::policy::FetchError;

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// No delay between retries.
    None,
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff with base and max.
    Exponential {
        /// Initial delay.
        base: Duration,
        /// Maximum delay.
        max: Duration,
    },
}

impl BackoffStrategy {
    /// Calculate delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed(d) => *d,
            Self::Exponential { base, max } => {
                let multiplier = 2u32.saturating_pow(attempt);
                std::cmp::min(base.saturating_mul(multiplier), *max)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(50),
            max: Duration::from_millis(500),
        }
    }
}

/// Failures that trigger a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCondition {
    /// The query function returned an error.
    Failure,
    /// A single attempt ran past its timeout.
    Timeout,
}

impl RetryCondition {
    /// Check if an attempt's error matches this condition.
    pub fn matches(&self, error: &FetchError) -> bool {
        matches!(
            (self, error),
            (Self::Failure, FetchError::Failed(_)) | (Self::Timeout, FetchError::AttemptTimeout(_))
        )
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Conditions that trigger retry.
    pub retry_on: Vec<RetryCondition>,
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: BackoffStrategy::default(),
            retry_on: vec![RetryCondition::Failure, RetryCondition::Timeout],
        }
    }

    /// Create a policy with no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffStrategy::None,
            retry_on: Vec::new(),
        }
    }

    /// Set backoff strategy.
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Set retry conditions.
    pub fn with_conditions(mut self, conditions: Vec<RetryCondition>) -> Self {
        self.retry_on = conditions;
        self
    }

    /// Check if a failed attempt (0-indexed) should be retried.
    pub fn should_retry(&self, error: &FetchError, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        self.retry_on.iter().any(|c| c.matches(error))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn test_fixed_and_none() {
        assert_eq!(BackoffStrategy::None.delay_for_attempt(3), Duration::ZERO);
        let fixed = BackoffStrategy::Fixed(Duration::from_millis(20));
        assert_eq!(fixed.delay_for_attempt(0), fixed.delay_for_attempt(5));
    }

    #[test]
    fn test_should_retry_respects_limit() {
        let policy = RetryPolicy::new(2);
        let failed = FetchError::Failed("boom".into());

        assert!(policy.should_retry(&failed, 0));
        assert!(policy.should_retry(&failed, 1));
        assert!(!policy.should_retry(&failed, 2));
        assert!(!RetryPolicy::none().should_retry(&failed, 0));
    }

    #[test]
    fn test_should_retry_respects_conditions() {
        let policy = RetryPolicy::new(3).with_conditions(vec![RetryCondition::Timeout]);

        assert!(!policy.should_retry(&FetchError::Failed("boom".into()), 0));
        assert!(policy.should_retry(&FetchError::AttemptTimeout(Duration::from_secs(1)), 0));
        assert!(!policy.should_retry(&FetchError::TotalTimeout(Duration::from_secs(1)), 0));
    }
}
