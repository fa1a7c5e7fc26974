// SPDX-License-Identifier: MIT OR Apache-2.0
//! Failure classification and retry policy.
//!
//! Transient primitive failures are classified by a pattern table:
//! the first rule whose pattern appears in the error text decides the
//! error kind, retryability, and backoff. Backoff sleeps are
//! interruptible by cancellation.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strand_error::ErrorCode;
use strand_harness::CancelFlag;

/// One classification rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRule {
    /// Substring matched case-insensitively against the error text.
    pub pattern: String,
    /// The error code this failure classifies as.
    pub code: ErrorCode,
    /// Whether a retry may help.
    pub retryable: bool,
    /// Maximum attempts (including the first).
    pub max_attempts: u32,
    /// Base backoff in milliseconds; doubles per attempt.
    pub backoff_ms: u64,
}

/// Ordered classification table with a default fallthrough.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Rules checked in order.
    pub rules: Vec<RetryRule>,
}

/// Outcome of classifying one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Classified error code.
    pub code: ErrorCode,
    /// Whether another attempt is allowed.
    pub retryable: bool,
    /// Attempts allowed in total.
    pub max_attempts: u32,
    /// Backoff before the next attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rules: vec![
                RetryRule {
                    pattern: "timed out".into(),
                    code: ErrorCode::Timeout,
                    retryable: true,
                    max_attempts: 3,
                    backoff_ms: 500,
                },
                RetryRule {
                    pattern: "connection refused".into(),
                    code: ErrorCode::PrimitiveFailure,
                    retryable: true,
                    max_attempts: 3,
                    backoff_ms: 1_000,
                },
                RetryRule {
                    pattern: "temporarily unavailable".into(),
                    code: ErrorCode::PrimitiveFailure,
                    retryable: true,
                    max_attempts: 2,
                    backoff_ms: 2_000,
                },
                RetryRule {
                    pattern: "permission denied".into(),
                    code: ErrorCode::PermissionDenied,
                    retryable: false,
                    max_attempts: 1,
                    backoff_ms: 0,
                },
            ],
        }
    }
}

impl RetryPolicy {
    /// Classify an error text. Unmatched text is a non-retryable
    /// `PRIMITIVE_FAILURE`.
    #[must_use]
    pub fn classify(&self, error_text: &str) -> Classification {
        let lowered = error_text.to_ascii_lowercase();
        for rule in &self.rules {
            if lowered.contains(&rule.pattern.to_ascii_lowercase()) {
                return Classification {
                    code: rule.code,
                    retryable: rule.retryable,
                    max_attempts: rule.max_attempts,
                    backoff: Duration::from_millis(rule.backoff_ms),
                };
            }
        }
        Classification {
            code: ErrorCode::PrimitiveFailure,
            retryable: false,
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Backoff for attempt `n` (1-based): base doubled per prior attempt.
    #[must_use]
    pub fn backoff_for(classification: &Classification, attempt: u32) -> Duration {
        classification.backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Sleep for `duration`, returning early (with `false`) when `cancel`
/// fires. Returns `true` when the full backoff elapsed.
pub async fn interruptible_backoff(duration: Duration, cancel: &CancelFlag) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = cancel.cancelled() => false,
    }
}
