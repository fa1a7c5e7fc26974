// SPDX-License-Identifier: MIT OR Apache-2.0
//! Resuming suspended threads.
//!
//! A suspended thread parked with its transcript intact. Resume rebuilds
//! the message list from the transcript (the transcript is the source of
//! truth — the in-memory view died with the original task), restores the
//! cost accumulator from the recorded checkpoints, applies a budget bump
//! or approval, and re-enters the turn loop under the same thread id.

use crate::RunnerContext;
use crate::coordination::ThreadOutcome;
use crate::runner::prepare_resume;
use crate::transcript::{TRANSCRIPT_FILE, read_transcript};
use strand_core::{Cost, Limits, ThreadId, ThreadStatus, TranscriptEvent, TranscriptEventKind};
use strand_error::{ErrorCode, StrandError};
use strand_provider::ChatMessage;

/// What a resume may change about a suspended thread.
#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    /// Raise the spend cap to accumulated spend plus this much.
    pub budget_bump: Option<f64>,
    /// Raise the turn cap to accumulated turns plus this much.
    pub extra_turns: Option<u32>,
    /// Consume a pending approval (clears `escalation.json`).
    pub approve: bool,
}

/// Resume a suspended thread and run it to a terminal state.
///
/// # Errors
///
/// `THREAD_NOT_FOUND` for an unknown id, `CONFIG` when the thread is not
/// suspended, plus anything thread startup can raise.
pub async fn resume_thread(
    ctx: &RunnerContext,
    thread_id: &ThreadId,
    options: ResumeOptions,
) -> strand_error::Result<ThreadOutcome> {
    let row = ctx.ledger.get_thread(thread_id)?.ok_or_else(|| {
        StrandError::new(
            ErrorCode::ThreadNotFound,
            format!("thread {thread_id} is not registered"),
        )
    })?;
    if row.status != ThreadStatus::Suspended {
        return Err(StrandError::new(
            ErrorCode::Config,
            format!(
                "thread {thread_id} is {} — only suspended threads resume",
                row.status
            ),
        ));
    }

    let thread_dir = ctx.layout.thread_dir(thread_id);
    let events = read_transcript(&thread_dir.join(TRANSCRIPT_FILE))?;
    let messages = replay_messages(&events);
    if messages.is_empty() {
        return Err(StrandError::new(
            ErrorCode::Config,
            format!("thread {thread_id} has no replayable transcript"),
        ));
    }
    let cost = last_cost(&events);

    if options.approve {
        let escalation = thread_dir.join("escalation.json");
        if escalation.exists() {
            let _ = std::fs::remove_file(&escalation);
        }
    }
    // A stale cancel marker would immediately re-cancel the resumed run.
    let marker = thread_dir.join(strand_harness::CANCEL_MARKER);
    if marker.exists() {
        let _ = std::fs::remove_file(&marker);
    }

    let overrides = Limits {
        max_spend_usd: options.budget_bump.map(|bump| cost.spend_usd + bump),
        max_turns: options.extra_turns.map(|extra| cost.turns + extra),
        ..Limits::default()
    };

    tracing::info!(
        target: "strand.runner",
        thread_id = %thread_id,
        budget_bump = ?options.budget_bump,
        extra_turns = ?options.extra_turns,
        "resuming suspended thread"
    );

    let prepared = prepare_resume(
        ctx,
        thread_id.clone(),
        row.directive_id,
        messages,
        overrides,
        cost,
        row.depth,
    )
    .await?;
    Ok(prepared.run().await)
}

/// Reconstruct the conversation view from transcript events: the first
/// message, then assistant outputs and tool results in order.
fn replay_messages(events: &[TranscriptEvent]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    for event in events {
        match event.kind {
            TranscriptEventKind::ThreadStarted => {
                if messages.is_empty()
                    && let Some(first) = event.payload["first_message"].as_str()
                {
                    messages.push(ChatMessage::user(first));
                }
            }
            TranscriptEventKind::CognitionOut => {
                if let Some(text) = event.payload["text"].as_str() {
                    messages.push(ChatMessage::assistant(text));
                }
            }
            TranscriptEventKind::ToolCallResult => {
                let call_id = event.payload["call_id"].as_str().unwrap_or_default();
                messages.push(ChatMessage::tool_result(
                    call_id,
                    event.payload["content"].to_string(),
                ));
            }
            _ => {}
        }
    }
    messages
}

/// Cost as of the most recent checkpoint in the transcript.
fn last_cost(events: &[TranscriptEvent]) -> Cost {
    events
        .iter()
        .rev()
        .find_map(|e| serde_json::from_value::<Cost>(e.payload["cost"].clone()).ok())
        .unwrap_or_default()
}
