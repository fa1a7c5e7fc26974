// SPDX-License-Identifier: MIT OR Apache-2.0
//! Orchestrator configuration.
//!
//! Loaded from `strand.toml` at the project root when present; every
//! field has a serde default so a missing or partial file degrades to
//! the built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use strand_core::Limits;
use strand_error::{ErrorCode, StrandError};
use strand_harness::HookDef;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Baseline limits applied before directive declarations.
    pub default_limits: Limits,
    /// Hard cap on concurrent tool dispatches per turn.
    pub max_parallel_dispatch: Option<usize>,
    /// Context-pressure trigger ratio.
    pub pressure_ratio: Option<f64>,
    /// Context-pressure re-arm ratio.
    pub pressure_rearm: Option<f64>,
    /// Provider call timeout in seconds.
    pub llm_timeout_secs: Option<u64>,
    /// Project-layer hooks.
    pub project_hooks: Vec<HookDef>,
    /// Infrastructure-layer hooks.
    pub infrastructure_hooks: Vec<HookDef>,
}

impl OrchestratorConfig {
    /// Load from `strand.toml` under `project_root`. A missing file is
    /// the default configuration.
    ///
    /// # Errors
    ///
    /// `CONFIG` when the file exists but does not parse.
    pub fn load(project_root: &Path) -> strand_error::Result<Self> {
        let path = project_root.join("strand.toml");
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&content).map_err(|e| {
            StrandError::new(
                ErrorCode::Config,
                format!("{}: {e}", path.display()),
            )
        })
    }

    /// Fold into runner defaults.
    #[must_use]
    pub fn runner_defaults(&self) -> strand_runner::RunnerDefaults {
        let base = strand_runner::RunnerDefaults::default();
        strand_runner::RunnerDefaults {
            limits: self.default_limits.clone(),
            project_hooks: self.project_hooks.clone(),
            infrastructure_hooks: self.infrastructure_hooks.clone(),
            max_parallel_dispatch: self.max_parallel_dispatch.unwrap_or(base.max_parallel_dispatch),
            pressure_ratio: self.pressure_ratio.unwrap_or(base.pressure_ratio),
            pressure_rearm: self.pressure_rearm.unwrap_or(base.pressure_rearm),
            llm_timeout: self
                .llm_timeout_secs
                .map_or(base.llm_timeout, std::time::Duration::from_secs),
        }
    }
}
