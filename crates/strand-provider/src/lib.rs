// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! LLM provider interface.
//!
//! The HTTP/SSE client is an external collaborator; the core consumes
//! this seam. A provider streams [`StreamEvent`]s through a channel
//! while `complete` runs, then returns the turn's usage. Tool calls
//! arrive incrementally (start / fragment / end) so the runner can act
//! on each call as soon as it is fully parsed, not when the stream
//! closes.
//!
//! [`MockProvider`] plays back scripted turns for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// System framing.
    System,
    /// User / orchestrator input.
    User,
    /// Model output.
    Assistant,
    /// Tool result fed back to the model.
    Tool,
}

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role.
    pub role: Role,
    /// Message text, or serialized tool result for `Role::Tool`.
    pub content: String,
    /// Correlates a `Tool` message to the call that produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// A user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
        }
    }

    /// An assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
        }
    }

    /// A tool-result message correlated to `call_id`.
    #[must_use]
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Schema of one tool exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// The tool's invocation name (the item id).
    pub name: String,
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// JSON schema of the parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// One completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier or tier; `None` uses the provider default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    /// Tools the model may call this turn.
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// Incremental events emitted during one completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A fragment of assistant text.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// The model opened a tool call.
    ToolCallStart {
        /// Correlation id for this call.
        call_id: String,
        /// Tool name (item id) being invoked.
        tool: String,
    },
    /// A fragment of the call's JSON arguments.
    ToolCallDelta {
        /// Correlation id.
        call_id: String,
        /// Argument JSON fragment.
        fragment: String,
    },
    /// The call's arguments are complete.
    ToolCallEnd {
        /// Correlation id.
        call_id: String,
    },
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    /// Terminal text-only turn.
    EndTurn,
    /// The model is waiting on tool results.
    ToolUse,
}

/// Token and spend accounting for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
    /// Provider-reported spend in USD.
    pub spend_usd: f64,
}

/// What a finished turn reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    /// Token / spend accounting.
    pub usage: Usage,
    /// Why the stream ended.
    pub stop: StopKind,
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// A streaming LLM provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Run one completion, emitting [`StreamEvent`]s through `events` as
    /// they arrive, and return the turn outcome once the stream closes.
    ///
    /// # Errors
    ///
    /// Implementations surface transport and provider errors as
    /// [`strand_error::StrandError`].
    async fn complete(
        &self,
        request: CompletionRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> strand_error::Result<TurnOutcome>;

    /// The context window, in tokens, of `model` (or the default model).
    fn context_window(&self, model: Option<&str>) -> u64;

    /// Provider name for logs.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Mock provider
// ---------------------------------------------------------------------------

/// One scripted tool call.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    /// Correlation id to emit.
    pub call_id: String,
    /// Tool name to emit.
    pub tool: String,
    /// Arguments, streamed as two JSON fragments.
    pub params: serde_json::Value,
}

/// One scripted turn.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    /// Text deltas to emit before any tool calls.
    pub text: Option<String>,
    /// Tool calls to emit, in order.
    pub calls: Vec<ScriptedCall>,
    /// Usage to report.
    pub usage: Usage,
}

impl ScriptedTurn {
    /// A terminal text-only turn.
    #[must_use]
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// A turn issuing the given calls.
    #[must_use]
    pub fn calling(calls: Vec<ScriptedCall>) -> Self {
        Self {
            calls,
            ..Self::default()
        }
    }

    /// Set the reported usage.
    #[must_use]
    pub fn with_usage(mut self, input: u64, output: u64, spend: f64) -> Self {
        self.usage = Usage {
            input_tokens: input,
            output_tokens: output,
            spend_usd: spend,
        };
        self
    }
}

/// Plays back scripted turns, one per `complete` call.
///
/// Turns past the end of the script replay the final turn, so loops that
/// overshoot their script terminate deterministically.
pub struct MockProvider {
    turns: Vec<ScriptedTurn>,
    cursor: Arc<AtomicUsize>,
    window: u64,
}

impl MockProvider {
    /// Create a mock with the given script.
    #[must_use]
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns,
            cursor: Arc::new(AtomicUsize::new(0)),
            window: 200_000,
        }
    }

    /// Override the advertised context window.
    #[must_use]
    pub fn with_window(mut self, window: u64) -> Self {
        self.window = window;
        self
    }

    /// How many turns have been played.
    #[must_use]
    pub fn turns_played(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(
        &self,
        _request: CompletionRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> strand_error::Result<TurnOutcome> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let turn = self
            .turns
            .get(index)
            .or_else(|| self.turns.last())
            .cloned()
            .unwrap_or_else(|| ScriptedTurn::text_only("done"));

        if let Some(text) = &turn.text {
            // Split into two deltas to exercise accumulation.
            let mid = text.len() / 2;
            let (a, b) = text.split_at(mid);
            for chunk in [a, b] {
                if !chunk.is_empty() {
                    let _ = events
                        .send(StreamEvent::TextDelta {
                            text: chunk.to_string(),
                        })
                        .await;
                }
            }
        }

        for call in &turn.calls {
            let _ = events
                .send(StreamEvent::ToolCallStart {
                    call_id: call.call_id.clone(),
                    tool: call.tool.clone(),
                })
                .await;
            let json = call.params.to_string();
            let mid = json.len() / 2;
            let (a, b) = json.split_at(mid);
            for fragment in [a, b] {
                if !fragment.is_empty() {
                    let _ = events
                        .send(StreamEvent::ToolCallDelta {
                            call_id: call.call_id.clone(),
                            fragment: fragment.to_string(),
                        })
                        .await;
                }
            }
            let _ = events
                .send(StreamEvent::ToolCallEnd {
                    call_id: call.call_id.clone(),
                })
                .await;
        }

        let stop = if turn.calls.is_empty() {
            StopKind::EndTurn
        } else {
            StopKind::ToolUse
        };
        Ok(TurnOutcome {
            usage: turn.usage,
            stop,
        })
    }

    fn context_window(&self, _model: Option<&str>) -> u64 {
        self.window
    }

    fn name(&self) -> &str {
        "mock"
    }
}
