// SPDX-License-Identifier: MIT OR Apache-2.0
//! Item metadata structs: directives, tools, knowledge.
//!
//! These are the typed forms produced by the metadata extractor. The
//! extractor owns parsing; this module owns the shapes and the small
//! amount of arithmetic they carry (limit capping, I/O compatibility).

use crate::ItemId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Per-thread resource caps. `None` means unlimited in that dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Limits {
    /// Maximum number of LLM turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    /// Maximum input tokens accumulated across all turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_tokens: Option<u64>,
    /// Maximum output tokens accumulated across all turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    /// Maximum spend in USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_spend_usd: Option<f64>,
    /// Maximum wall-clock duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
    /// Maximum remaining spawn-tree depth. Decrements by one per child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    /// Maximum number of direct child threads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_spawns: Option<u32>,
}

impl Limits {
    /// Element-wise minimum of `self` and `other`.
    ///
    /// `None` is treated as unbounded, so a bound on either side survives.
    /// This is the "child can never exceed its parent" rule.
    #[must_use]
    pub fn cap_by(&self, other: &Limits) -> Limits {
        fn min_opt<T: Copy + PartialOrd>(a: Option<T>, b: Option<T>) -> Option<T> {
            match (a, b) {
                (Some(a), Some(b)) => Some(if a < b { a } else { b }),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            }
        }
        Limits {
            max_turns: min_opt(self.max_turns, other.max_turns),
            max_input_tokens: min_opt(self.max_input_tokens, other.max_input_tokens),
            max_output_tokens: min_opt(self.max_output_tokens, other.max_output_tokens),
            max_spend_usd: min_opt(self.max_spend_usd, other.max_spend_usd),
            max_duration_secs: min_opt(self.max_duration_secs, other.max_duration_secs),
            max_depth: min_opt(self.max_depth, other.max_depth),
            max_spawns: min_opt(self.max_spawns, other.max_spawns),
        }
    }

    /// Overlay `other` onto `self`: any dimension `other` declares wins.
    #[must_use]
    pub fn overlay(&self, other: &Limits) -> Limits {
        Limits {
            max_turns: other.max_turns.or(self.max_turns),
            max_input_tokens: other.max_input_tokens.or(self.max_input_tokens),
            max_output_tokens: other.max_output_tokens.or(self.max_output_tokens),
            max_spend_usd: other.max_spend_usd.or(self.max_spend_usd),
            max_duration_secs: other.max_duration_secs.or(self.max_duration_secs),
            max_depth: other.max_depth.or(self.max_depth),
            max_spawns: other.max_spawns.or(self.max_spawns),
        }
    }

    /// Duration cap as a [`Duration`], if set.
    #[must_use]
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// Directive metadata
// ---------------------------------------------------------------------------

/// Structured metadata block of a directive item.
///
/// Everything outside the metadata block is the prompt body, handed
/// verbatim (after input interpolation) to the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct DirectiveMeta {
    /// Human-readable name.
    pub name: String,
    /// Semantic version of the directive.
    #[serde(default)]
    pub version: String,
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// Declared model tier or concrete model identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Declared resource limits.
    #[serde(default)]
    pub limits: Limits,
    /// Declared capability patterns (dotted globs).
    #[serde(default)]
    pub permissions: Vec<String>,
    /// JSON schema for the directive's input parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<serde_json::Value>,
    /// JSON schema for the directive's declared outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<serde_json::Value>,
    /// Declared lifecycle hooks, as raw JSON. The harness compiles these
    /// against its hook schema; keeping them opaque here avoids coupling
    /// the contract crate to the hook engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Tool metadata
// ---------------------------------------------------------------------------

/// I/O contract between adjacent chain elements.
///
/// A parent element's `requires` must be a subset of its child's
/// `provides` for the chain to validate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct IoContract {
    /// Input names this element needs from its executor.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Output names this element makes available to dependents.
    #[serde(default)]
    pub provides: Vec<String>,
}

impl IoContract {
    /// `true` when every required input of `self` is provided by `child`.
    #[must_use]
    pub fn compatible_with(&self, child: &IoContract) -> bool {
        self.requires.iter().all(|r| child.provides.contains(r))
    }

    /// Required inputs of `self` that `child` does not provide.
    #[must_use]
    pub fn missing_from(&self, child: &IoContract) -> Vec<String> {
        self.requires
            .iter()
            .filter(|r| !child.provides.contains(*r))
            .cloned()
            .collect()
    }
}

/// When an anchor's load context activates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum AnchorMode {
    /// Activate on every execution.
    Always,
    /// Activate only when one of the declared marker files exists.
    #[default]
    Auto,
}

/// Declared import-resolution and verification scope for a multi-file tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct AnchorConfig {
    /// Activation mode.
    #[serde(default)]
    pub mode: AnchorMode,
    /// Marker filenames that activate `auto` mode when present in the
    /// tool's directory.
    #[serde(default)]
    pub markers: Vec<String>,
    /// Scope directory relative to the tool's directory. Defaults to the
    /// tool's own directory when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// File extensions included in the verification scope.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Environment variables to prepend scope paths onto
    /// (e.g. `PYTHONPATH` for a Python runtime).
    #[serde(default)]
    pub env_prepend: Vec<String>,
}

/// Static environment configuration declared by a chain element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct EnvConfig {
    /// Interpreter or binary path for runtime elements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    /// Static environment variables. Values may use `${VAR:-default}`.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Library / load paths appended to the language-specific path var.
    #[serde(default)]
    pub lib_paths: Vec<String>,
}

/// Structured metadata of a tool, runtime, or primitive item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ToolMeta {
    /// Short name of the tool.
    #[serde(default)]
    pub name: String,
    /// Semantic version.
    #[serde(default)]
    pub version: String,
    /// Free-form tool type tag (e.g. `script`, `http`, `config`).
    #[serde(default)]
    pub tool_type: String,
    /// The runtime that executes this element; `None` marks a primitive,
    /// which terminates the chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ItemId>,
    /// Semver constraint on the executor's version, if declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_version: Option<String>,
    /// Category used for search scoping.
    #[serde(default)]
    pub category: String,
    /// JSON schema for the tool's invocation parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    /// Execution config block, merged down the chain (tool overrides
    /// runtime).
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    /// Declared I/O contract.
    #[serde(default)]
    pub io: IoContract,
    /// Environment configuration.
    #[serde(default)]
    pub env: EnvConfig,
    /// Optional anchor (multi-file load context).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorConfig>,
}

impl ToolMeta {
    /// `true` when this element terminates a chain.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        self.executor_id.is_none()
    }
}

// ---------------------------------------------------------------------------
// Knowledge metadata
// ---------------------------------------------------------------------------

/// Frontmatter of a knowledge item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct KnowledgeMeta {
    /// Stable identifier declared in the frontmatter.
    #[serde(default)]
    pub id: String,
    /// Title, when distinct from the id.
    #[serde(default)]
    pub title: String,
    /// Search tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Category used for search scoping.
    #[serde(default)]
    pub category: String,
    /// Semantic version.
    #[serde(default)]
    pub version: String,
}
