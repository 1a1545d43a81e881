//! Retry policy: bounded attempts with exponential backoff, capped by the
//! invocation deadline.

use std::time::Duration;

use crate::ErrantError;

/// Configuration for automatic retry of transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retries after the first attempt: a policy allowing N retries
    /// yields at most N+1 attempts.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Ceiling for the backoff growth.
    pub max_backoff: Duration,
    /// Backoff multiplier per attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate the backoff duration for a given attempt number.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let backoff = self.initial_backoff.mul_f64(multiplier);
        backoff.min(self.max_backoff)
    }

    /// Decide whether attempt number `attempt` (1-based, just failed with
    /// `error`) may be retried, and with what delay.
    ///
    /// Returns `None` when the error is not transient, the retry budget is
    /// spent, or the backoff would not fit in the remaining deadline; the
    /// caller then surfaces `error` as-is.
    pub fn next_delay(
        &self,
        error: &ErrantError,
        attempt: u32,
        remaining: Option<Duration>,
    ) -> Option<Duration> {
        if !error.is_retryable() {
            return None;
        }
        if attempt > self.max_retries {
            return None;
        }
        let delay = self.backoff_for_attempt(attempt);
        match remaining {
            Some(remaining) if delay >= remaining => None,
            _ => Some(delay),
        }
    }
}
