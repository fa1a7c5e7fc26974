// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only transcript event vocabulary.
//!
//! Each transcript line is `{ts, thread_id, type, payload}`. The event
//! kinds form a closed set; coordination never flows through the
//! transcript — it exists for audit and post-hoc replay only.

use crate::ThreadId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of transcript event kinds.
///
/// Kinds marked *droppable* are fire-and-forget and may be lost under
/// write pressure; everything else is written synchronously.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptEventKind {
    /// Thread registered and the turn loop is about to start.
    ThreadStarted,
    /// An LLM turn began.
    StepStart,
    /// An LLM turn finished.
    StepFinish,
    /// A tool dispatch began.
    ToolCallStart,
    /// A tool dispatch produced its result (success or typed error).
    ToolCallResult,
    /// Intermediate progress from a long-running tool. Droppable.
    ToolCallProgress,
    /// A complete assistant text block.
    CognitionOut,
    /// A streaming assistant text fragment. Droppable.
    CognitionOutDelta,
    /// A failure was classified against the retry policy table.
    ErrorClassified,
    /// A retried operation succeeded.
    RetrySucceeded,
    /// A limit hook requested escalation.
    LimitEscalationRequested,
    /// A child thread was spawned.
    ChildThreadStarted,
    /// A child thread terminated in error.
    ChildThreadFailed,
    /// Terminal: the model emitted its final text.
    ThreadCompleted,
    /// Terminal: the thread parked (limit / budget / approval).
    ThreadSuspended,
    /// Terminal: cancellation observed.
    ThreadCancelled,
    /// Terminal: unrecoverable error.
    ThreadError,
    /// Context compaction began.
    ContextCompactionStart,
    /// Context compaction finished.
    ContextCompactionEnd,
}

impl TranscriptEventKind {
    /// `true` for events that may be dropped under write pressure.
    #[must_use]
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::ToolCallProgress | Self::CognitionOutDelta)
    }

    /// `true` for the four terminal events.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ThreadCompleted | Self::ThreadSuspended | Self::ThreadCancelled | Self::ThreadError
        )
    }
}

impl fmt::Display for TranscriptEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Reuse the serde snake_case names so log lines match the wire form.
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

/// One line of a thread's transcript JSONL file.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct TranscriptEvent {
    /// When the event was recorded.
    pub ts: DateTime<Utc>,
    /// The owning thread.
    pub thread_id: ThreadId,
    /// Event discriminator.
    #[serde(rename = "type")]
    pub kind: TranscriptEventKind,
    /// Event-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TranscriptEvent {
    /// Construct an event stamped `now`.
    #[must_use]
    pub fn now(thread_id: ThreadId, kind: TranscriptEventKind, payload: serde_json::Value) -> Self {
        Self {
            ts: Utc::now(),
            thread_id,
            kind,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ItemId;

    fn tid() -> ThreadId {
        ThreadId::generate(&ItemId::new("a/b").unwrap(), 1)
    }

    #[test]
    fn droppable_set_is_exactly_two() {
        let all = [
            TranscriptEventKind::ThreadStarted,
            TranscriptEventKind::StepStart,
            TranscriptEventKind::StepFinish,
            TranscriptEventKind::ToolCallStart,
            TranscriptEventKind::ToolCallResult,
            TranscriptEventKind::ToolCallProgress,
            TranscriptEventKind::CognitionOut,
            TranscriptEventKind::CognitionOutDelta,
            TranscriptEventKind::ErrorClassified,
            TranscriptEventKind::RetrySucceeded,
            TranscriptEventKind::LimitEscalationRequested,
            TranscriptEventKind::ChildThreadStarted,
            TranscriptEventKind::ChildThreadFailed,
            TranscriptEventKind::ThreadCompleted,
            TranscriptEventKind::ThreadSuspended,
            TranscriptEventKind::ThreadCancelled,
            TranscriptEventKind::ThreadError,
            TranscriptEventKind::ContextCompactionStart,
            TranscriptEventKind::ContextCompactionEnd,
        ];
        let droppable: Vec<_> = all.iter().filter(|k| k.is_droppable()).collect();
        assert_eq!(droppable.len(), 2);
    }

    #[test]
    fn terminal_kinds() {
        assert!(TranscriptEventKind::ThreadCompleted.is_terminal());
        assert!(TranscriptEventKind::ThreadError.is_terminal());
        assert!(!TranscriptEventKind::StepFinish.is_terminal());
    }

    #[test]
    fn wire_shape_uses_type_field() {
        let ev = TranscriptEvent::now(
            tid(),
            TranscriptEventKind::ToolCallResult,
            serde_json::json!({"call_id": "c1"}),
        );
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "tool_call_result");
        assert_eq!(v["payload"]["call_id"], "c1");
        assert!(v["ts"].is_string());
    }

    #[test]
    fn event_serde_roundtrip() {
        let ev = TranscriptEvent::now(
            tid(),
            TranscriptEventKind::ThreadSuspended,
            serde_json::json!({"reason": "budget"}),
        );
        let line = serde_json::to_string(&ev).unwrap();
        let back: TranscriptEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back.kind, TranscriptEventKind::ThreadSuspended);
    }

    #[test]
    fn display_matches_wire_name() {
        assert_eq!(
            TranscriptEventKind::ContextCompactionStart.to_string(),
            "context_compaction_start"
        );
    }
}
