// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! strand-runner
//!
//! The thread runner and coordination layer.
//!
//! Responsibilities:
//! - run a directive as a cooperative LLM turn loop
//! - dispatch streamed tool calls with capability checks (same-item
//!   calls in order, different items concurrently)
//! - spawn child directives as in-process tasks with injected parent
//!   context
//! - coordinate completion through pre-created events and the
//!   `wait_threads` built-in
//! - keep the append-only transcript and settle the budget on every
//!   exit path

/// Task registry and completion events.
pub mod coordination;
/// Resuming suspended threads.
pub mod resume;
/// Thread startup, the turn loop, and dispatch.
pub mod runner;
/// Append-only transcript writer and reader.
pub mod transcript;

use std::sync::Arc;
use std::time::Duration;
use strand_core::Limits;
use strand_executor::Executor;
use strand_harness::HookDef;
use strand_integrity::{KeyPair, TrustStore, VerifyCache};
use strand_ledger::Ledger;
use strand_provider::Provider;
use strand_resolve::SpaceLayout;

pub use coordination::{
    CompletionEvent, Coordinator, LiveThread, ThreadOutcome, WaitOptions, WaitReport,
};
pub use resume::{ResumeOptions, resume_thread};
pub use runner::{
    PARENT_THREAD_ENV, ParentContext, PreparedThread, SpawnRequest, WAIT_TOOL, run_thread,
    spawn_thread, start_thread,
};
pub use transcript::{TRANSCRIPT_FILE, TranscriptWriter, read_transcript};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Orchestrator-wide defaults the runner consults.
#[derive(Debug, Clone)]
pub struct RunnerDefaults {
    /// Baseline limits before directive and caller overlays.
    pub limits: Limits,
    /// Project-layer hooks.
    pub project_hooks: Vec<HookDef>,
    /// Infrastructure-layer hooks.
    pub infrastructure_hooks: Vec<HookDef>,
    /// Hard cap on concurrent tool dispatches per turn.
    pub max_parallel_dispatch: usize,
    /// Context-pressure trigger as a fraction of the model window.
    pub pressure_ratio: f64,
    /// Hysteresis re-arm threshold.
    pub pressure_rearm: f64,
    /// Timeout for a single provider call.
    pub llm_timeout: Duration,
}

impl Default for RunnerDefaults {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            project_hooks: Vec::new(),
            infrastructure_hooks: Vec::new(),
            max_parallel_dispatch: 25,
            pressure_ratio: 0.8,
            pressure_rearm: 0.7,
            llm_timeout: Duration::from_secs(300),
        }
    }
}

/// Shared handles every thread needs. Clone freely — all clones share
/// the same caches, ledger, and coordinator.
#[derive(Clone)]
pub struct RunnerContext {
    /// The three-space layout.
    pub layout: SpaceLayout,
    /// Thread registry and budget ledger.
    pub ledger: Ledger,
    /// The chain executor.
    pub executor: Executor,
    /// The LLM provider.
    pub provider: Arc<dyn Provider>,
    /// In-process coordination.
    pub coordinator: Coordinator,
    /// Trust store for item verification.
    pub store: Arc<TrustStore>,
    /// Verification cache shared with the executor.
    pub verify_cache: VerifyCache,
    /// Key used to sign state snapshots, when configured.
    pub signing_key: Option<Arc<KeyPair>>,
    /// Orchestrator defaults.
    pub defaults: RunnerDefaults,
}

impl std::fmt::Debug for RunnerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerContext")
            .field("provider", &self.provider.name())
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Input interpolation
// ---------------------------------------------------------------------------

/// Interpolate `{param}` references in a directive body against its
/// input parameters. Unknown references pass through untouched — the
/// body is prose for the model, not a strict template.
#[must_use]
pub fn interpolate_inputs(
    body: &str,
    params: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            break;
        };
        let name = &after[..end];
        let is_identifier = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        match (is_identifier, params.get(name)) {
            (true, Some(value)) => {
                out.push_str(&rest[..start]);
                match value {
                    serde_json::Value::String(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str(&rest[..=start]);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn interpolates_known_params() {
        let out = interpolate_inputs(
            "Deploy {service} to {env}.",
            &params(json!({"service": "api", "env": "staging"})),
        );
        assert_eq!(out, "Deploy api to staging.");
    }

    #[test]
    fn unknown_references_pass_through() {
        let out = interpolate_inputs("Keep {this} as-is.", &params(json!({})));
        assert_eq!(out, "Keep {this} as-is.");
    }

    #[test]
    fn non_string_values_serialize() {
        let out = interpolate_inputs("retries={count}", &params(json!({"count": 3})));
        assert_eq!(out, "retries=3");
    }

    #[test]
    fn literal_braces_survive() {
        let out = interpolate_inputs("json looks like {\"k\": 1}", &params(json!({})));
        assert_eq!(out, "json looks like {\"k\": 1}");
    }

    #[test]
    fn defaults_are_sane() {
        let d = RunnerDefaults::default();
        assert_eq!(d.max_parallel_dispatch, 25);
        assert!(d.pressure_rearm < d.pressure_ratio);
    }
}
