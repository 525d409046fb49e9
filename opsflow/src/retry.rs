//! Retry policy and deterministic exponential backoff.
//!
//! Delays follow `delay(attempt) = min(initial * coefficient^attempt,
//! max_interval)` with no jitter: backoff progress is persisted in the
//! event history and replayed, so the schedule must be a pure function
//! of the attempt number.

use crate::errors::ErrorKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rules governing how failed activity attempts are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Multiplier applied per attempt.
    pub backoff_coefficient: f64,
    /// Ceiling on any single delay.
    pub max_interval: Duration,
    /// Maximum number of retries after the initial attempt.
    pub max_attempts: u32,
    /// Error kinds this policy never retries, in addition to the kinds
    /// that are intrinsically terminal.
    pub non_retriable: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(30),
            max_attempts: 3,
            non_retriable: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retries() -> Self {
        Self::default().with_max_attempts(0)
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub const fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Sets the backoff coefficient.
    #[must_use]
    pub const fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Sets the ceiling on any single delay.
    #[must_use]
    pub const fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Sets the maximum number of retries after the initial attempt.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Adds an error kind this policy never retries.
    #[must_use]
    pub fn with_non_retriable(mut self, kind: ErrorKind) -> Self {
        self.non_retriable.push(kind);
        self
    }

    /// The delay after the failure of the given 0-indexed attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_coefficient.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = (self.initial_interval.as_millis() as f64) * factor;
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Decides what happens after the 0-indexed `attempt` fails with `kind`.
    #[must_use]
    pub fn decide(&self, kind: ErrorKind, attempt: u32) -> RetryDecision {
        if kind.is_intrinsically_terminal() || self.non_retriable.contains(&kind) {
            return RetryDecision::NotRetriable;
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(attempt))
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry(Duration),
    /// Retries are exhausted.
    GiveUp,
    /// The error kind is not retriable under this policy.
    NotRetriable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.max_interval, Duration::from_secs(30));
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.non_retriable.is_empty());
    }

    #[test]
    fn test_backoff_sequence_capped() {
        // initial=1s, coefficient=2, max_interval=30s, max_attempts=5:
        // delays 1, 2, 4, 8, 16, then the cap.
        let policy = RetryPolicy::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_backoff_coefficient(2.0)
            .with_max_interval(Duration::from_secs(30))
            .with_max_attempts(5);

        let delays: Vec<u64> = (0..5).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(20), Duration::from_secs(30));
    }

    #[test]
    fn test_sixth_failure_is_terminal() {
        let policy = RetryPolicy::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_backoff_coefficient(2.0)
            .with_max_interval(Duration::from_secs(30))
            .with_max_attempts(5);

        for attempt in 0..5 {
            assert!(
                matches!(policy.decide(ErrorKind::Transient, attempt), RetryDecision::Retry(_)),
                "attempt {attempt} should retry"
            );
        }
        assert_eq!(policy.decide(ErrorKind::Transient, 5), RetryDecision::GiveUp);
    }

    #[test]
    fn test_intrinsically_terminal_kinds_never_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(ErrorKind::Deterministic, 0),
            RetryDecision::NotRetriable
        );
        assert_eq!(policy.decide(ErrorKind::Fatal, 0), RetryDecision::NotRetriable);
    }

    #[test]
    fn test_timeout_retriable_unless_listed() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            policy.decide(ErrorKind::Timeout, 0),
            RetryDecision::Retry(_)
        ));

        let strict = RetryPolicy::default().with_non_retriable(ErrorKind::Timeout);
        assert_eq!(strict.decide(ErrorKind::Timeout, 0), RetryDecision::NotRetriable);
    }

    #[test]
    fn test_no_retries_policy() {
        let policy = RetryPolicy::no_retries();
        assert_eq!(policy.decide(ErrorKind::Transient, 0), RetryDecision::GiveUp);
    }

    #[test]
    fn test_policy_serde_roundtrip() {
        let policy = RetryPolicy::new()
            .with_max_attempts(5)
            .with_non_retriable(ErrorKind::Timeout);
        let json = serde_json::to_string(&policy).unwrap();
        let back: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
