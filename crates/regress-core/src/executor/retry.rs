//! Retry policy for failed scenarios.
//!
//! Only `Failed` outcomes are retried. Timeouts and cancellations are final.
//!
//! # Example
//!
//! ```
//! use regress_core::executor::{RetryDecision, RetryPolicy};
//! use regress_proto::TaskStatus;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy {
//!     max_attempts: 3,
//!     backoff_ms: 100,
//!     ..RetryPolicy::default()
//! };
//!
//! assert_eq!(
//!     policy.decide(TaskStatus::Failed, 1),
//!     RetryDecision::Retry { next_attempt: 2, delay: Duration::from_millis(100) }
//! );
//! assert_eq!(policy.decide(TaskStatus::Failed, 3), RetryDecision::Finish);
//! assert_eq!(policy.decide(TaskStatus::TimedOut, 1), RetryDecision::Finish);
//! ```

use regress_proto::TaskStatus;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How many times a failed scenario runs and how long to wait between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retries.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub backoff_ms: u64,

    /// Factor applied to the delay for each further attempt.
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

/// What to do after an attempt ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue at the original priority after `delay`.
    Retry { next_attempt: u32, delay: Duration },

    /// Report the outcome as final.
    Finish,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Decides the next step for a task that just finished `attempt` with `status`.
    pub fn decide(&self, status: TaskStatus, attempt: u32) -> RetryDecision {
        if status != TaskStatus::Failed || attempt >= self.max_attempts {
            return RetryDecision::Finish;
        }
        RetryDecision::Retry {
            next_attempt: attempt + 1,
            delay: self.backoff_for(attempt),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if self.backoff_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)]
        let scaled = self.backoff_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let capped = scaled.min(self.max_backoff_ms as f64).round() as u64;
        Duration::from_millis(capped)
    }
}
