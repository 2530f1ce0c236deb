//! Retry/backoff gate for failed requests.
//!
//! Evaluated per request before each try:
//!
//! - `effective = attempt - 1` (attempts already made)
//! - `effective < 1`: retry immediately
//! - `effective >= max_retries`: never again (until an operator resets it)
//! - otherwise wait `delay(effective)` after the request's `updated_at`

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Linear backoff: step * effective_attempt
    #[default]
    Linear,
    /// Exponential backoff: step * 2^(effective_attempt - 1)
    Exponential,
}

/// Outcome of the retry gate for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// May run now
    Ready,
    /// Blocked until the given instant
    WaitUntil(DateTime<Utc>),
    /// Retry ceiling reached; needs manual intervention
    Exhausted,
}

impl RetryDecision {
    pub fn is_ready(&self) -> bool {
        matches!(self, RetryDecision::Ready)
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Effective attempts at which a request becomes permanently ineligible
    pub max_retries: u32,
    /// Base delay unit
    pub step: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            step: Duration::from_secs(2 * 60 * 60),
            strategy: BackoffStrategy::Linear,
        }
    }
}

impl RetryPolicy {
    /// Linear policy with the given ceiling and step.
    pub fn linear(max_retries: u32, step: Duration) -> Self {
        Self {
            max_retries,
            step,
            strategy: BackoffStrategy::Linear,
        }
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Delay required after `effective_attempt` prior attempts.
    pub fn delay_for(&self, effective_attempt: u32) -> Duration {
        if effective_attempt == 0 {
            return Duration::ZERO;
        }
        match self.strategy {
            BackoffStrategy::Fixed => self.step,
            BackoffStrategy::Linear => self.step.saturating_mul(effective_attempt),
            BackoffStrategy::Exponential => self
                .step
                .saturating_mul(2u32.saturating_pow(effective_attempt - 1)),
        }
    }

    /// Whether `effective_attempt` is at or past the ceiling.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        i64::from(attempt) - 1 >= i64::from(self.max_retries)
    }

    /// Evaluate the gate for a request with `attempt` tries, last touched at `updated_at`.
    pub fn decide(&self, attempt: u32, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> RetryDecision {
        let effective = i64::from(attempt) - 1;
        if effective < 1 {
            return RetryDecision::Ready;
        }
        if effective >= i64::from(self.max_retries) {
            return RetryDecision::Exhausted;
        }

        // effective is in 1..max_retries here, so it fits in u32.
        let delay = self.delay_for(effective as u32);
        let due = updated_at + chrono::Duration::from_std(delay).unwrap_or_default();
        if now >= due {
            RetryDecision::Ready
        } else {
            RetryDecision::WaitUntil(due)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hours(h: i64) -> chrono::Duration {
        chrono::Duration::hours(h)
    }

    #[test]
    fn first_tries_are_immediate() {
        let policy = RetryPolicy::default();
        let t = Utc::now();
        assert_eq!(policy.decide(0, t, t), RetryDecision::Ready);
        assert_eq!(policy.decide(1, t, t), RetryDecision::Ready);
    }

    #[test]
    fn linear_schedule_matches_two_hour_steps() {
        let policy = RetryPolicy::default();
        let updated = Utc::now();

        // attempt=3 -> effective 2 -> 4h
        assert_eq!(
            policy.decide(3, updated, updated + hours(4) - chrono::Duration::seconds(1)),
            RetryDecision::WaitUntil(updated + hours(4))
        );
        assert_eq!(policy.decide(3, updated, updated + hours(4)), RetryDecision::Ready);

        // attempt=8 -> effective 7 -> 14h
        assert!(!policy.decide(8, updated, updated + hours(13)).is_ready());
        assert!(policy.decide(8, updated, updated + hours(14)).is_ready());
    }

    #[test]
    fn ceiling_is_permanent() {
        let policy = RetryPolicy::default();
        let updated = Utc::now();
        assert_eq!(
            policy.decide(9, updated, updated + hours(24 * 365)),
            RetryDecision::Exhausted
        );
        assert!(policy.is_exhausted(9));
        assert!(!policy.is_exhausted(8));
    }

    #[test]
    fn other_strategies() {
        let step = Duration::from_secs(60);
        let fixed = RetryPolicy::linear(5, step).with_strategy(BackoffStrategy::Fixed);
        assert_eq!(fixed.delay_for(1), step);
        assert_eq!(fixed.delay_for(4), step);

        let exp = RetryPolicy::linear(5, step).with_strategy(BackoffStrategy::Exponential);
        assert_eq!(exp.delay_for(1), step);
        assert_eq!(exp.delay_for(2), step * 2);
        assert_eq!(exp.delay_for(3), step * 4);
    }

    proptest! {
        #[test]
        fn never_ready_before_delay(attempt in 2u32..9, early_secs in 1i64..3600) {
            let policy = RetryPolicy::default();
            let updated = Utc::now();
            let delay = chrono::Duration::from_std(policy.delay_for(attempt - 1)).unwrap();
            let now = updated + delay - chrono::Duration::seconds(early_secs);
            prop_assert!(!policy.decide(attempt, updated, now).is_ready());
            prop_assert!(policy.decide(attempt, updated, updated + delay).is_ready());
        }

        #[test]
        fn exhausted_regardless_of_time(attempt in 9u32..1000, elapsed_h in 0i64..100_000) {
            let policy = RetryPolicy::default();
            let updated = Utc::now();
            prop_assert_eq!(
                policy.decide(attempt, updated, updated + hours(elapsed_h)),
                RetryDecision::Exhausted
            );
        }
    }
}
