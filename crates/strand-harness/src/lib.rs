// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Per-thread safety harness.
//!
//! One [`Harness`] exists per thread. It owns the thread's effective
//! limits (after parent capping), its capability token, the compiled
//! hook table, the cost accumulator, and the cancellation flag, plus a
//! handle to the budget ledger. The runner consults it at every loop
//! checkpoint; the harness never drives execution itself.

/// Cancellation primitives (durable marker + in-process flag).
pub mod cancel;
/// Thread-safe cost accumulator.
pub mod cost;
/// The hook `when` expression language.
pub mod expr;
/// Data-declared lifecycle hooks.
pub mod hooks;

use serde_json::{Map, Value};
use strand_capability::CapabilityToken;
use strand_core::{Cost, Limits, SuspendReason, ThreadId, ThreadStatus};
use strand_error::{ErrorCode, StrandError};
use strand_ledger::Ledger;

pub use cancel::{CANCEL_MARKER, CancelFlag, CancelReason};
pub use cost::CostAccumulator;
pub use expr::{ExprError, WhenExpr};
pub use hooks::{CompiledHook, HookAction, HookDef, HookEvent, HookLayer, HookTable};

// ---------------------------------------------------------------------------
// Limit resolution
// ---------------------------------------------------------------------------

/// Resolve a thread's effective limits.
///
/// Defaults come from configuration, the directive's declaration overlays
/// them, explicit caller overrides overlay that, and finally each numeric
/// dimension is capped by the parent's effective limit — a child can
/// never exceed its parent.
#[must_use]
pub fn resolve_limits(
    defaults: &Limits,
    directive: &Limits,
    overrides: &Limits,
    parent: Option<&Limits>,
) -> Limits {
    let resolved = defaults.overlay(directive).overlay(overrides);
    match parent {
        Some(parent) => resolved.cap_by(parent),
        None => resolved,
    }
}

// ---------------------------------------------------------------------------
// Limit checks
// ---------------------------------------------------------------------------

/// A detected limit breach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitBreach {
    /// Turn cap reached.
    TurnsExceeded,
    /// Input-token cap reached.
    InputTokensExceeded,
    /// Output-token cap reached.
    OutputTokensExceeded,
    /// Spend cap reached.
    SpendExceeded,
    /// Duration cap reached.
    DurationExceeded,
    /// Spawn cap reached.
    SpawnsExceeded,
    /// The hierarchical ledger reports no remaining budget.
    BudgetExhausted,
}

impl LimitBreach {
    /// Stable code used in hook fields and transcript payloads.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::TurnsExceeded => "turns_exceeded",
            Self::InputTokensExceeded => "input_tokens_exceeded",
            Self::OutputTokensExceeded => "output_tokens_exceeded",
            Self::SpendExceeded => "spend_exceeded",
            Self::DurationExceeded => "duration_exceeded",
            Self::SpawnsExceeded => "spawns_exceeded",
            Self::BudgetExhausted => "budget_exhausted",
        }
    }

    /// The thread transition this breach causes when no hook intervenes.
    ///
    /// Limit and budget breaches are policy outcomes, so they suspend
    /// (resumable with a bump) rather than error.
    #[must_use]
    pub fn disposition(&self) -> (ThreadStatus, Option<SuspendReason>) {
        match self {
            Self::BudgetExhausted | Self::SpendExceeded => {
                (ThreadStatus::Suspended, Some(SuspendReason::Budget))
            }
            _ => (ThreadStatus::Suspended, Some(SuspendReason::Limit)),
        }
    }
}

/// Outcome of [`Harness::check_limits`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitCheck {
    /// All dimensions within bounds.
    Ok,
    /// At least one dimension exceeded; the first breach found.
    Breach(LimitBreach),
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Per-thread policy object enforcing limits, capabilities, hooks, and
/// cancellation.
pub struct Harness {
    thread_id: ThreadId,
    limits: Limits,
    token: CapabilityToken,
    hooks: HookTable,
    /// Cost accumulator, written by the runner at each checkpoint.
    pub cost: CostAccumulator,
    cancel: CancelFlag,
    ledger: Ledger,
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("thread_id", &self.thread_id)
            .field("limits", &self.limits)
            .field("token", &self.token.len())
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

impl Harness {
    /// Assemble a harness for one thread.
    #[must_use]
    pub fn new(
        thread_id: ThreadId,
        limits: Limits,
        token: CapabilityToken,
        hooks: HookTable,
        cancel: CancelFlag,
        ledger: Ledger,
    ) -> Self {
        Self {
            thread_id,
            limits,
            token,
            hooks,
            cost: CostAccumulator::new(),
            cancel,
            ledger,
        }
    }

    /// The thread this harness guards.
    #[must_use]
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Effective limits.
    #[must_use]
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Effective capability token.
    #[must_use]
    pub fn token(&self) -> &CapabilityToken {
        &self.token
    }

    /// Compiled hook table.
    #[must_use]
    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }

    /// The cancellation flag (clone to hand to primitives).
    #[must_use]
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// `true` once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Check every limit dimension against the current cost, then the
    /// hierarchical ledger. Returns the first breach found.
    #[must_use]
    pub fn check_limits(&self) -> LimitCheck {
        let cost = self.cost.snapshot();

        if let Some(max) = self.limits.max_turns
            && cost.turns >= max
        {
            return LimitCheck::Breach(LimitBreach::TurnsExceeded);
        }
        if let Some(max) = self.limits.max_input_tokens
            && cost.input_tokens >= max
        {
            return LimitCheck::Breach(LimitBreach::InputTokensExceeded);
        }
        if let Some(max) = self.limits.max_output_tokens
            && cost.output_tokens >= max
        {
            return LimitCheck::Breach(LimitBreach::OutputTokensExceeded);
        }
        if let Some(max) = self.limits.max_spend_usd
            && cost.spend_usd >= max
        {
            return LimitCheck::Breach(LimitBreach::SpendExceeded);
        }
        if let Some(max) = self.limits.max_duration()
            && cost.duration_ms >= max.as_millis() as u64
        {
            return LimitCheck::Breach(LimitBreach::DurationExceeded);
        }
        if let Some(max) = self.limits.max_spawns
            && cost.spawns >= max
        {
            return LimitCheck::Breach(LimitBreach::SpawnsExceeded);
        }

        match self.ledger.check_remaining(&self.thread_id) {
            Ok(Some(remaining)) if remaining <= 0.0 => {
                LimitCheck::Breach(LimitBreach::BudgetExhausted)
            }
            _ => LimitCheck::Ok,
        }
    }

    /// Fail-closed capability check for one operation path.
    ///
    /// # Errors
    ///
    /// `PERMISSION_DENIED` with the missing capability in the details.
    pub fn check_permission(&self, required: &str) -> strand_error::Result<()> {
        if self.token.check(required) {
            return Ok(());
        }
        Err(StrandError::new(
            ErrorCode::PermissionDenied,
            format!("capability {required} is not granted to thread {}", self.thread_id),
        )
        .with_detail("required", required)
        .with_detail("granted", self.token.patterns().collect::<Vec<_>>())
        .with_suggestion("declare the capability in the directive's permissions block"))
    }

    /// Hooks matching `event` under `fields`.
    #[must_use]
    pub fn matching_hooks(&self, event: HookEvent, fields: &Map<String, Value>) -> Vec<&CompiledHook> {
        self.hooks.matching(event, fields)
    }

    /// Event-field object for a limit breach, fed to `limit` hooks.
    #[must_use]
    pub fn breach_fields(&self, breach: &LimitBreach, cost: &Cost) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("code".into(), Value::String(breach.code().into()));
        fields.insert(
            "cost".into(),
            serde_json::to_value(cost).unwrap_or(Value::Null),
        );
        fields.insert(
            "thread_id".into(),
            Value::String(self.thread_id.to_string()),
        );
        fields
    }
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::ItemId;

    fn tid() -> ThreadId {
        ThreadId::from_raw("h-test-1")
    }

    fn harness(limits: Limits) -> Harness {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger
            .register_thread(&tid(), None, &ItemId::new("a/b").unwrap(), 3)
            .unwrap();
        ledger.register_budget(&tid(), None).unwrap();
        Harness::new(
            tid(),
            limits,
            CapabilityToken::mint(["strand.execute.tool.fs.read"], tid()).unwrap(),
            HookTable::default(),
            CancelFlag::detached(),
            ledger,
        )
    }

    // ---- limit resolution -------------------------------------------------

    #[test]
    fn resolution_overlays_then_caps() {
        let defaults = Limits {
            max_turns: Some(20),
            max_spend_usd: Some(5.0),
            ..Limits::default()
        };
        let directive = Limits {
            max_turns: Some(10),
            ..Limits::default()
        };
        let overrides = Limits {
            max_spend_usd: Some(2.0),
            ..Limits::default()
        };
        let parent = Limits {
            max_turns: Some(6),
            max_spend_usd: Some(3.0),
            ..Limits::default()
        };
        let effective = resolve_limits(&defaults, &directive, &overrides, Some(&parent));
        assert_eq!(effective.max_turns, Some(6));
        assert_eq!(effective.max_spend_usd, Some(2.0));
    }

    #[test]
    fn root_resolution_skips_capping() {
        let directive = Limits {
            max_turns: Some(50),
            ..Limits::default()
        };
        let effective = resolve_limits(&Limits::default(), &directive, &Limits::default(), None);
        assert_eq!(effective.max_turns, Some(50));
    }

    // ---- limit checks -----------------------------------------------------

    #[test]
    fn within_limits_is_ok() {
        let h = harness(Limits {
            max_turns: Some(5),
            ..Limits::default()
        });
        h.cost.record_turn();
        assert_eq!(h.check_limits(), LimitCheck::Ok);
    }

    #[test]
    fn turn_breach() {
        let h = harness(Limits {
            max_turns: Some(2),
            ..Limits::default()
        });
        h.cost.record_turn();
        h.cost.record_turn();
        assert_eq!(
            h.check_limits(),
            LimitCheck::Breach(LimitBreach::TurnsExceeded)
        );
    }

    #[test]
    fn spend_breach_suspends_with_budget_reason() {
        let h = harness(Limits {
            max_spend_usd: Some(0.5),
            ..Limits::default()
        });
        h.cost.record_spend(0.6);
        let LimitCheck::Breach(breach) = h.check_limits() else {
            panic!("expected breach");
        };
        assert_eq!(breach, LimitBreach::SpendExceeded);
        let (status, reason) = breach.disposition();
        assert_eq!(status, ThreadStatus::Suspended);
        assert_eq!(reason, Some(SuspendReason::Budget));
    }

    #[test]
    fn token_breach_codes() {
        let h = harness(Limits {
            max_input_tokens: Some(100),
            ..Limits::default()
        });
        h.cost.record_tokens(150, 0);
        let LimitCheck::Breach(breach) = h.check_limits() else {
            panic!("expected breach");
        };
        assert_eq!(breach.code(), "input_tokens_exceeded");
        assert_eq!(
            breach.disposition(),
            (ThreadStatus::Suspended, Some(SuspendReason::Limit))
        );
    }

    #[test]
    fn unlimited_harness_never_breaches() {
        let h = harness(Limits::default());
        h.cost.record_turn();
        h.cost.record_tokens(1_000_000, 1_000_000);
        h.cost.record_spend(100.0);
        assert_eq!(h.check_limits(), LimitCheck::Ok);
    }

    // ---- permissions ------------------------------------------------------

    #[test]
    fn permission_check_passes_and_fails() {
        let h = harness(Limits::default());
        assert!(h.check_permission("strand.execute.tool.fs.read").is_ok());
        let err = h
            .check_permission("strand.execute.tool.fs.write")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
        let details = err.details.unwrap();
        assert_eq!(details["required"], "strand.execute.tool.fs.write");
    }

    // ---- breach fields ----------------------------------------------------

    #[test]
    fn breach_fields_shape() {
        let h = harness(Limits::default());
        let fields = h.breach_fields(&LimitBreach::SpendExceeded, &Cost::default());
        assert_eq!(fields["code"], "spend_exceeded");
        assert!(fields.contains_key("cost"));
    }
}
