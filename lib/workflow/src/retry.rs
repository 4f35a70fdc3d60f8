//! Retry policy for activities and infrastructure operations.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How an activity is retried.
///
/// Attempts are 1-based. The delay after attempt `n` is
/// `initial_backoff * backoff_multiplier^(n-1)`, capped at `max_backoff`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Growth factor between consecutive delays. Values below 1.0 are treated as 1.0.
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Failure kinds that are never retried.
    #[serde(default)]
    pub non_retryable_kinds: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
            non_retryable_kinds: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy with a different attempt limit.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retries() -> Self {
        Self::new(1)
    }

    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Marks a failure kind as terminal.
    #[must_use]
    pub fn with_non_retryable_kind(mut self, kind: impl Into<String>) -> Self {
        self.non_retryable_kinds.push(kind.into());
        self
    }

    /// Returns the delay to wait after `attempt` failed.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.initial_backoff.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Returns true if another attempt may follow `attempt`.
    #[must_use]
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Returns true if failures of this kind may be retried.
    #[must_use]
    pub fn is_retryable(&self, kind: &str) -> bool {
        !self.non_retryable_kinds.iter().any(|k| k == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let policy = RetryPolicy::new(10)
            .with_initial_backoff(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_max_backoff(Duration::from_millis(500));

        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_for_attempt(60), Duration::from_millis(500));
    }

    #[test]
    fn backoff_never_decreases() {
        let policy = RetryPolicy::new(20).with_backoff_multiplier(0.5);
        let delays: Vec<_> = (1..20).map(|n| policy.backoff_for_attempt(n)).collect();
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn initial_above_max_is_capped() {
        let policy = RetryPolicy::default()
            .with_initial_backoff(Duration::from_secs(120))
            .with_max_backoff(Duration::from_secs(60));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(60));
    }

    #[test]
    fn attempts_remaining() {
        let policy = RetryPolicy::new(3);
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
        assert!(!RetryPolicy::no_retries().has_attempts_remaining(1));
    }

    #[test]
    fn non_retryable_kinds() {
        let policy = RetryPolicy::default().with_non_retryable_kind("card_declined");
        assert!(!policy.is_retryable("card_declined"));
        assert!(policy.is_retryable("timeout"));
    }

    #[test]
    fn policy_defaults_missing_kinds_on_deserialize() {
        let json = serde_json::json!({
            "max_attempts": 5,
            "initial_backoff": {"secs": 1, "nanos": 0},
            "backoff_multiplier": 1.5,
            "max_backoff": {"secs": 30, "nanos": 0},
        });
        let policy: RetryPolicy = serde_json::from_value(json).expect("deserialize");
        assert_eq!(policy.max_attempts, 5);
        assert!(policy.non_retryable_kinds.is_empty());
    }
}
