// SPDX-License-Identifier: MIT OR Apache-2.0
//! Data-declared lifecycle hooks.
//!
//! A hook is an `(event, when, action)` triple. The `when` predicate is a
//! [`WhenExpr`](crate::expr::WhenExpr) evaluated against pre-computed
//! event fields; actions are declarations the runner interprets — never
//! arbitrary code. Hooks compose from three layers merged in order:
//! directive-declared, project defaults, infrastructure defaults.

use crate::expr::WhenExpr;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strand_core::ItemId;
use strand_error::{ErrorCode, StrandError};

// ---------------------------------------------------------------------------
// Events and actions
// ---------------------------------------------------------------------------

/// The closed set of hook events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    /// Before each LLM turn; outputs may contribute to the first message.
    BeforeStep,
    /// After each LLM turn.
    AfterStep,
    /// When an error is classified.
    Error,
    /// When a limit breach is detected.
    Limit,
    /// After the thread reaches a terminal state.
    AfterComplete,
    /// When accumulated input tokens approach the model window.
    ContextWindowPressure,
}

/// What a hook does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HookAction {
    /// Execute a directive (compaction, escalation, policy behaviors).
    RunDirective {
        /// The directive to execute.
        directive: ItemId,
        /// Static parameters merged with the event fields.
        #[serde(default)]
        params: Map<String, Value>,
    },
    /// Load a knowledge item into the prompt (persona, rules, context).
    LoadKnowledge {
        /// The knowledge item to load.
        item: ItemId,
    },
    /// Emit a structured log line.
    Log {
        /// Message template.
        message: String,
    },
}

/// Which layer contributed a hook. Layers merge in declaration order:
/// directive first, then project, then infrastructure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookLayer {
    /// Declared in the directive's metadata.
    Directive,
    /// Project-level defaults.
    Project,
    /// Orchestrator-wide defaults.
    Infrastructure,
}

/// One declared hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookDef {
    /// The event this hook fires on.
    pub event: HookEvent,
    /// Optional `when` predicate source; absent means always fire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// The declared action.
    #[serde(flatten)]
    pub action: HookAction,
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// A compiled hook with its parsed predicate and originating layer.
#[derive(Debug, Clone)]
pub struct CompiledHook {
    /// The declaration.
    pub def: HookDef,
    /// Originating layer.
    pub layer: HookLayer,
    when: Option<WhenExpr>,
}

impl CompiledHook {
    /// `true` when this hook's predicate passes for `fields`.
    #[must_use]
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        self.when.as_ref().is_none_or(|w| w.eval(fields))
    }
}

/// The merged, compiled hook table for one thread.
#[derive(Debug, Clone, Default)]
pub struct HookTable {
    hooks: Vec<CompiledHook>,
}

impl HookTable {
    /// Compile and merge the three layers in order.
    ///
    /// # Errors
    ///
    /// Returns a `CONFIG` error naming the hook whose `when` expression
    /// does not parse.
    pub fn build(
        directive: &[HookDef],
        project: &[HookDef],
        infrastructure: &[HookDef],
    ) -> strand_error::Result<Self> {
        let mut hooks = Vec::new();
        for (layer, defs) in [
            (HookLayer::Directive, directive),
            (HookLayer::Project, project),
            (HookLayer::Infrastructure, infrastructure),
        ] {
            for def in defs {
                let when = match &def.when {
                    None => None,
                    Some(src) => Some(WhenExpr::parse(src).map_err(|e| {
                        StrandError::new(
                            ErrorCode::Config,
                            format!("hook when-expression {src:?}: {e}"),
                        )
                    })?),
                };
                hooks.push(CompiledHook {
                    def: def.clone(),
                    layer,
                    when,
                });
            }
        }
        Ok(Self { hooks })
    }

    /// Hooks declared for `event` whose predicates pass for `fields`, in
    /// merge order.
    #[must_use]
    pub fn matching(&self, event: HookEvent, fields: &Map<String, Value>) -> Vec<&CompiledHook> {
        self.hooks
            .iter()
            .filter(|h| h.def.event == event && h.matches(fields))
            .collect()
    }

    /// Total number of compiled hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// `true` when no hooks are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}
