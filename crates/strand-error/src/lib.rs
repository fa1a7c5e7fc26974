// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for Strand.
//!
//! Every failure that crosses a public boundary carries an [`ErrorCode`]
//! (a machine-readable, stable string tag), a human-readable message,
//! optional structured details, a `retryable` flag, and an optional
//! user-facing suggestion. Use the builder methods on [`StrandError`] to
//! construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Item lookup across the three spaces failed.
    Resolution,
    /// Signature verification failed or was missing.
    Integrity,
    /// Executor chain construction or validation failed.
    Chain,
    /// A tool, primitive, or thread failed during execution.
    Execution,
    /// Cross-thread coordination (join / wait / cancel) failed.
    Coordination,
    /// Filesystem, parsing, configuration, or unexpected internal errors.
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Resolution => "resolution",
            Self::Integrity => "integrity",
            Self::Chain => "chain",
            Self::Execution => "execution",
            Self::Coordination => "coordination",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Resolution --
    /// No space holds the requested item.
    ItemNotFound,
    /// No metadata schema is installed for the item type.
    SchemaNotFound,
    /// Two files in the same space differ only by suffix.
    AmbiguousSuffix,

    // -- Integrity --
    /// The item carries no signature line.
    Unsigned,
    /// The signature's fingerprint is not in the trust store.
    Untrusted,
    /// The content hash or signature does not verify.
    Tampered,

    // -- Chain construction --
    /// Executor chain exceeded the maximum depth.
    ChainTooDeep,
    /// The executor chain references itself.
    CircularDependency,
    /// A chain element names an executor that cannot be resolved.
    ExecutorNotFound,
    /// A declared version constraint was not satisfied.
    VersionMismatch,
    /// A chain element depends on a higher-precedence space.
    SpaceViolation,
    /// Adjacent chain elements have incompatible I/O contracts.
    IoIncompatibility,

    // -- Execution --
    /// The chain-terminal primitive reported failure.
    PrimitiveFailure,
    /// An operation exceeded its deadline.
    Timeout,
    /// The capability token does not cover the requested operation.
    PermissionDenied,
    /// The thread's own budget is exhausted.
    BudgetExceeded,
    /// A child reservation exceeds the parent's remaining budget.
    ChildBudgetInsufficient,
    /// Spawning would make the thread tree deeper than allowed.
    SpawnDepthExceeded,
    /// The parent has already spawned its maximum number of children.
    SpawnCountExceeded,
    /// Config templating failed to resolve to a fixed point.
    TemplateError,

    // -- Coordination --
    /// The referenced thread id is unknown.
    ThreadNotFound,
    /// `wait_threads` timed out before completion.
    WaitTimeout,
    /// The operation was cancelled.
    Cancelled,
    /// The thread is suspended awaiting external approval.
    SuspendedAwaitingApproval,

    // -- System --
    /// Filesystem operation failed.
    FileSystem,
    /// Content failed to parse.
    Parsing,
    /// Configuration file or value is invalid.
    Config,
    /// Catch-all for unexpected internal errors.
    Unknown,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ItemNotFound | Self::SchemaNotFound | Self::AmbiguousSuffix => {
                ErrorCategory::Resolution
            }

            Self::Unsigned | Self::Untrusted | Self::Tampered => ErrorCategory::Integrity,

            Self::ChainTooDeep
            | Self::CircularDependency
            | Self::ExecutorNotFound
            | Self::VersionMismatch
            | Self::SpaceViolation
            | Self::IoIncompatibility => ErrorCategory::Chain,

            Self::PrimitiveFailure
            | Self::Timeout
            | Self::PermissionDenied
            | Self::BudgetExceeded
            | Self::ChildBudgetInsufficient
            | Self::SpawnDepthExceeded
            | Self::SpawnCountExceeded
            | Self::TemplateError => ErrorCategory::Execution,

            Self::ThreadNotFound
            | Self::WaitTimeout
            | Self::Cancelled
            | Self::SuspendedAwaitingApproval => ErrorCategory::Coordination,

            Self::FileSystem | Self::Parsing | Self::Config | Self::Unknown => {
                ErrorCategory::System
            }
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"ITEM_NOT_FOUND"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ItemNotFound => "ITEM_NOT_FOUND",
            Self::SchemaNotFound => "SCHEMA_NOT_FOUND",
            Self::AmbiguousSuffix => "AMBIGUOUS_SUFFIX",
            Self::Unsigned => "UNSIGNED",
            Self::Untrusted => "UNTRUSTED",
            Self::Tampered => "TAMPERED",
            Self::ChainTooDeep => "CHAIN_TOO_DEEP",
            Self::CircularDependency => "CIRCULAR_DEPENDENCY",
            Self::ExecutorNotFound => "EXECUTOR_NOT_FOUND",
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::SpaceViolation => "SPACE_VIOLATION",
            Self::IoIncompatibility => "IO_INCOMPATIBILITY",
            Self::PrimitiveFailure => "PRIMITIVE_FAILURE",
            Self::Timeout => "TIMEOUT",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::ChildBudgetInsufficient => "CHILD_BUDGET_INSUFFICIENT",
            Self::SpawnDepthExceeded => "SPAWN_DEPTH_EXCEEDED",
            Self::SpawnCountExceeded => "SPAWN_COUNT_EXCEEDED",
            Self::TemplateError => "TEMPLATE_ERROR",
            Self::ThreadNotFound => "THREAD_NOT_FOUND",
            Self::WaitTimeout => "WAIT_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::SuspendedAwaitingApproval => "SUSPENDED_AWAITING_APPROVAL",
            Self::FileSystem => "FILE_SYSTEM",
            Self::Parsing => "PARSING",
            Self::Config => "CONFIG",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether a failure with this code is worth retrying as-is.
    ///
    /// Integrity and chain-construction failures are deterministic, so
    /// retrying without changing inputs cannot succeed. Timeouts and
    /// primitive failures may be transient.
    #[must_use]
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::PrimitiveFailure | Self::FileSystem | Self::WaitTimeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StrandError
// ---------------------------------------------------------------------------

/// Unified Strand error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, optional
/// structured details (e.g. the offending chain or the missing capability),
/// a `retryable` flag, and an optional user-facing suggestion.
///
/// # Builder usage
///
/// ```
/// use strand_error::{ErrorCode, StrandError};
///
/// let err = StrandError::new(ErrorCode::PermissionDenied, "token does not cover fs.write")
///     .with_detail("required", "strand.execute.tool.fs.write")
///     .with_suggestion("declare the capability in the directive's permissions block");
/// assert!(!err.retryable);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrandError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Structured diagnostic details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Whether retrying the same operation may succeed.
    pub retryable: bool,
    /// Optional user-facing hint for fixing the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl StrandError {
    /// Create a new error with the given code and message.
    ///
    /// `retryable` is initialised from [`ErrorCode::default_retryable`].
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retryable: code.default_retryable(),
            suggestion: None,
        }
    }

    /// Attach a key-value pair to the structured details object.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            let map = self
                .details
                .get_or_insert_with(|| serde_json::Value::Object(Default::default()));
            if let serde_json::Value::Object(obj) = map {
                obj.insert(key.into(), v);
            }
        }
        self
    }

    /// Replace the details object wholesale.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach a user-facing suggestion.
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Override the `retryable` flag.
    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Render as the public wire envelope `{success: false, error: {...}}`.
    #[must_use]
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code.as_str(),
                "message": self.message,
                "details": self.details,
                "retryable": self.retryable,
                "suggestion": self.suggestion,
            }
        })
    }
}

impl fmt::Display for StrandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for StrandError {}

impl From<std::io::Error> for StrandError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorCode::FileSystem, err.to_string())
    }
}

impl From<serde_json::Error> for StrandError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::Parsing, err.to_string())
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StrandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(ErrorCode::ItemNotFound.as_str(), "ITEM_NOT_FOUND");
        assert_eq!(ErrorCode::PermissionDenied.as_str(), "PERMISSION_DENIED");
        assert_eq!(ErrorCode::Tampered.as_str(), "TAMPERED");
        assert_eq!(
            ErrorCode::SuspendedAwaitingApproval.as_str(),
            "SUSPENDED_AWAITING_APPROVAL"
        );
    }

    #[test]
    fn serde_matches_as_str() {
        let all = [
            ErrorCode::ItemNotFound,
            ErrorCode::SchemaNotFound,
            ErrorCode::AmbiguousSuffix,
            ErrorCode::Unsigned,
            ErrorCode::Untrusted,
            ErrorCode::Tampered,
            ErrorCode::ChainTooDeep,
            ErrorCode::CircularDependency,
            ErrorCode::ExecutorNotFound,
            ErrorCode::VersionMismatch,
            ErrorCode::SpaceViolation,
            ErrorCode::IoIncompatibility,
            ErrorCode::PrimitiveFailure,
            ErrorCode::Timeout,
            ErrorCode::PermissionDenied,
            ErrorCode::BudgetExceeded,
            ErrorCode::ChildBudgetInsufficient,
            ErrorCode::SpawnDepthExceeded,
            ErrorCode::SpawnCountExceeded,
            ErrorCode::TemplateError,
            ErrorCode::ThreadNotFound,
            ErrorCode::WaitTimeout,
            ErrorCode::Cancelled,
            ErrorCode::SuspendedAwaitingApproval,
            ErrorCode::FileSystem,
            ErrorCode::Parsing,
            ErrorCode::Config,
            ErrorCode::Unknown,
        ];
        for code in all {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
            let back: ErrorCode = serde_json::from_str(&json).unwrap();
            assert_eq!(back, code);
        }
    }

    #[test]
    fn every_code_has_a_category() {
        assert_eq!(ErrorCode::Unsigned.category(), ErrorCategory::Integrity);
        assert_eq!(ErrorCode::ChainTooDeep.category(), ErrorCategory::Chain);
        assert_eq!(
            ErrorCode::PermissionDenied.category(),
            ErrorCategory::Execution
        );
        assert_eq!(
            ErrorCode::ThreadNotFound.category(),
            ErrorCategory::Coordination
        );
        assert_eq!(ErrorCode::Unknown.category(), ErrorCategory::System);
    }

    #[test]
    fn retryable_defaults() {
        assert!(ErrorCode::Timeout.default_retryable());
        assert!(ErrorCode::PrimitiveFailure.default_retryable());
        assert!(!ErrorCode::Tampered.default_retryable());
        assert!(!ErrorCode::PermissionDenied.default_retryable());
    }

    #[test]
    fn builder_accumulates_details() {
        let err = StrandError::new(ErrorCode::SpaceViolation, "bad chain")
            .with_detail("parent_space", "project")
            .with_detail("child_space", "project")
            .with_suggestion("move the dependency to the user or system space");
        let details = err.details.as_ref().unwrap();
        assert_eq!(details["parent_space"], "project");
        assert!(err.suggestion.is_some());
        assert!(!err.retryable);
    }

    #[test]
    fn envelope_shape() {
        let err = StrandError::new(ErrorCode::ItemNotFound, "no such directive");
        let env = err.to_envelope();
        assert_eq!(env["success"], false);
        assert_eq!(env["error"]["code"], "ITEM_NOT_FOUND");
        assert_eq!(env["error"]["retryable"], false);
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = StrandError::new(ErrorCode::WaitTimeout, "no completion within 30s");
        let s = err.to_string();
        assert!(s.contains("WAIT_TIMEOUT"));
        assert!(s.contains("30s"));
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = StrandError::new(ErrorCode::Tampered, "hash mismatch")
            .with_detail("expected_hash", "abc")
            .with_detail("actual_hash", "def");
        let json = serde_json::to_string(&err).unwrap();
        let back: StrandError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, ErrorCode::Tampered);
        assert_eq!(back.details.unwrap()["expected_hash"], "abc");
    }
}
