// SPDX-License-Identifier: MIT OR Apache-2.0
//! Thread identity, status, and cost accounting.

use crate::{ItemId, Limits};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ThreadId
// ---------------------------------------------------------------------------

/// Human-readable thread identifier: `"{directive-slug}-{epoch_seconds}"`.
///
/// The registry appends a `-{n}` disambiguator when two threads of the same
/// directive start within one second.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    schemars::JsonSchema,
)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    /// Generate an id for a directive started at `epoch_seconds`.
    #[must_use]
    pub fn generate(directive: &ItemId, epoch_seconds: i64) -> Self {
        Self(format!("{}-{epoch_seconds}", directive.slug()))
    }

    /// Wrap an already-formatted id (e.g. read back from the registry).
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Append the registry's collision disambiguator.
    #[must_use]
    pub fn with_disambiguator(&self, n: u32) -> Self {
        Self(format!("{}-{n}", self.0))
    }

    /// The raw string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a thread.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    /// The turn loop is active.
    Running,
    /// The model emitted a terminal text response.
    Completed,
    /// The thread terminated with an error.
    Error,
    /// The thread is parked and may be resumed.
    Suspended,
    /// Cancellation was requested and observed.
    Cancelled,
}

impl ThreadStatus {
    /// `true` for statuses that end the turn loop.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a thread is suspended rather than terminated.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    /// A declared limit (turns, tokens, duration, spawns) was hit.
    Limit,
    /// An error policy chose suspension over termination.
    Error,
    /// The budget ledger reported no remaining spend.
    Budget,
}

impl fmt::Display for SuspendReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Limit => "limit",
            Self::Error => "error",
            Self::Budget => "budget",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Cost
// ---------------------------------------------------------------------------

/// Accumulated resource consumption of one thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Cost {
    /// LLM turns consumed.
    pub turns: u32,
    /// Input tokens across all turns.
    pub input_tokens: u64,
    /// Output tokens across all turns.
    pub output_tokens: u64,
    /// Spend in USD.
    pub spend_usd: f64,
    /// Direct children spawned.
    pub spawns: u32,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl Cost {
    /// Fold another cost into this one (used when settling children).
    pub fn absorb(&mut self, other: &Cost) {
        self.turns += other.turns;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.spend_usd += other.spend_usd;
        self.spawns += other.spawns;
        self.duration_ms = self.duration_ms.max(other.duration_ms);
    }
}

// ---------------------------------------------------------------------------
// ThreadState
// ---------------------------------------------------------------------------

/// Snapshot of a thread's orchestration state.
///
/// Persisted as `state.json` under the thread's state directory and in the
/// registry database.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ThreadState {
    /// The thread's identifier.
    pub thread_id: ThreadId,
    /// The spawning thread, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_thread_id: Option<ThreadId>,
    /// The directive this thread executes.
    pub directive_id: ItemId,
    /// Current lifecycle status.
    pub status: ThreadStatus,
    /// Suspension reason, set only when `status == Suspended`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_reason: Option<SuspendReason>,
    /// Remaining spawn-tree depth (parent depth minus one).
    pub depth: u32,
    /// Effective limits after parent capping.
    pub limits: Limits,
    /// Accumulated cost.
    pub cost: Cost,
    /// When the thread was registered.
    pub created_at: DateTime<Utc>,
    /// Last state transition.
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive() -> ItemId {
        ItemId::new("ops/deploy/plan").unwrap()
    }

    #[test]
    fn thread_id_format() {
        let id = ThreadId::generate(&directive(), 1_700_000_000);
        assert_eq!(id.as_str(), "ops-deploy-plan-1700000000");
    }

    #[test]
    fn thread_id_disambiguator() {
        let id = ThreadId::generate(&directive(), 42).with_disambiguator(2);
        assert_eq!(id.as_str(), "ops-deploy-plan-42-2");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ThreadStatus::Running.is_terminal());
        for s in [
            ThreadStatus::Completed,
            ThreadStatus::Error,
            ThreadStatus::Suspended,
            ThreadStatus::Cancelled,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn cost_absorb_sums_counters_and_maxes_duration() {
        let mut a = Cost {
            turns: 2,
            input_tokens: 100,
            output_tokens: 50,
            spend_usd: 0.25,
            spawns: 1,
            duration_ms: 900,
        };
        let b = Cost {
            turns: 1,
            input_tokens: 40,
            output_tokens: 10,
            spend_usd: 0.05,
            spawns: 0,
            duration_ms: 1_500,
        };
        a.absorb(&b);
        assert_eq!(a.turns, 3);
        assert_eq!(a.input_tokens, 140);
        assert!((a.spend_usd - 0.30).abs() < f64::EPSILON);
        assert_eq!(a.duration_ms, 1_500);
    }

    #[test]
    fn state_serde_roundtrip() {
        let state = ThreadState {
            thread_id: ThreadId::generate(&directive(), 7),
            parent_thread_id: None,
            directive_id: directive(),
            status: ThreadStatus::Suspended,
            suspend_reason: Some(SuspendReason::Budget),
            depth: 3,
            limits: Limits::default(),
            cost: Cost::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: ThreadState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, ThreadStatus::Suspended);
        assert_eq!(back.suspend_reason, Some(SuspendReason::Budget));
    }
}
