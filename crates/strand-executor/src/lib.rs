// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The executor chain.
//!
//! `execute` takes a tool item id and parameters, builds and validates
//! the `[tool, runtime…, primitive]` chain, computes any anchor context,
//! consults the lockfile fast-path, resolves environment and config, and
//! invokes the terminal primitive with retry classification. The
//! executor is stateless per invocation; the caches it consults are
//! addressed by content hash, so concurrent invocations are safe.

/// Anchor contexts for multi-file tools.
pub mod anchor;
/// Chain construction and the chain cache.
pub mod chain;
/// Environment resolution.
pub mod env;
/// Lockfile pinning.
pub mod lockfile;
/// The primitive seam.
pub mod primitive;
/// Managed subprocess records.
pub mod process;
/// Failure classification and retry policy.
pub mod retry;
/// Config assembly and templating.
pub mod template;
/// Adjacent-pair chain validation.
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use strand_core::ItemId;
use strand_error::{ErrorCode, StrandError};
use strand_harness::CancelFlag;
use strand_integrity::{TrustStore, VerifyCache};
use strand_resolve::SpaceLayout;

pub use anchor::{AnchorContext, anchor_active, compute_anchor, hash_scope};
pub use chain::{Chain, ChainCache, ChainElement, MAX_CHAIN_DEPTH, build_chain};
pub use env::{ResolvedEnv, resolve_env, substitute};
pub use lockfile::{LockedElement, Lockfile};
pub use primitive::{Primitive, PrimitiveRegistry, PrimitiveRequest, PrimitiveResult};
pub use process::{PROCESS_DIR, ProcessRecord, list_records, terminate_recorded};
pub use retry::{Classification, RetryPolicy, RetryRule, interruptible_backoff};
pub use template::{ExecContext, RESERVED_PARAMS, build_exec_config, shell_quote, strip_reserved};
pub use validate::validate_chain;

/// Default per-call timeout when neither config nor caller provide one.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Invocation / report
// ---------------------------------------------------------------------------

/// One tool invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Root tool item id.
    pub item_id: ItemId,
    /// Model- or caller-supplied parameters. Reserved parent-context
    /// keys are stripped before templating.
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Per-call timeout override.
    pub timeout: Option<Duration>,
    /// Validate and plan without invoking the primitive.
    pub dry_run: bool,
}

impl Invocation {
    /// Invocation with default timeout, not a dry run.
    #[must_use]
    pub fn new(item_id: ItemId, params: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            item_id,
            params,
            timeout: None,
            dry_run: false,
        }
    }
}

/// What an execution produced.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// The chain's element ids, root first.
    pub chain: Vec<ItemId>,
    /// The fully templated execution config.
    pub config: BTreeMap<String, serde_json::Value>,
    /// Whether the lockfile fast-path skipped anchor re-verification.
    pub lockfile_hit: bool,
    /// The primitive's result; `None` for a dry run.
    pub result: Option<PrimitiveResult>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// The chain executor. Clone freely; all clones share caches.
#[derive(Clone)]
pub struct Executor {
    layout: SpaceLayout,
    store: Arc<TrustStore>,
    verify_cache: VerifyCache,
    chain_cache: ChainCache,
    primitives: PrimitiveRegistry,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("primitives", &self.primitives)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Assemble an executor over a space layout and trust store.
    #[must_use]
    pub fn new(layout: SpaceLayout, store: Arc<TrustStore>, primitives: PrimitiveRegistry) -> Self {
        Self {
            layout,
            store,
            verify_cache: VerifyCache::new(),
            chain_cache: ChainCache::new(),
            primitives,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy table.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The verification cache handle (shared with callers that verify
    /// directives and knowledge through the same process).
    #[must_use]
    pub fn verify_cache(&self) -> &VerifyCache {
        &self.verify_cache
    }

    /// The space layout this executor resolves against.
    #[must_use]
    pub fn layout(&self) -> &SpaceLayout {
        &self.layout
    }

    /// Execute one invocation.
    ///
    /// # Errors
    ///
    /// Chain construction, validation, integrity, and template errors
    /// surface as typed [`StrandError`]s. A primitive that *runs* but
    /// fails is not an error — the failed [`PrimitiveResult`] is
    /// returned in the report for the caller (usually the model) to see.
    /// Cancellation mid-invocation is `CANCELLED`.
    pub async fn execute(
        &self,
        invocation: Invocation,
        cancel: CancelFlag,
    ) -> strand_error::Result<ExecutionReport> {
        // 1. Build (or reuse) the chain; construction verifies every
        //    element fail-closed.
        let chain = match self.chain_cache.get_if_fresh(&invocation.item_id) {
            Some(chain) => chain,
            None => {
                let chain = build_chain(
                    &self.layout,
                    &self.store,
                    &self.verify_cache,
                    &invocation.item_id,
                )?;
                self.chain_cache.insert(chain.clone());
                chain
            }
        };

        // 3. Adjacent-pair validation.
        validate_chain(&chain)?;

        // 4 + 5. Anchor context with lockfile fast-path.
        let root = chain.root();
        let lock_path = Lockfile::path_for(&self.layout, &chain);
        let lockfile = Lockfile::load(&lock_path);
        let mut lockfile_hit = false;

        let anchor_cfg = root.meta.anchor.clone();
        let anchor_ctx = match &anchor_cfg {
            Some(cfg) if anchor_active(cfg, &root.resolved.path) => {
                let current_hashes = hash_scope(cfg, &root.resolved.path)?;
                let pinned_ok = lockfile.as_ref().is_some_and(|lock| {
                    lock.combined_hash == chain.combined_hash
                        && lock.anchor_files == current_hashes
                });
                if pinned_ok {
                    // Hashes pinned by a prior successful run: skip the
                    // per-file signature pass.
                    lockfile_hit = true;
                    Some(AnchorContext {
                        root: anchor_scope_root(cfg, &root.resolved.path),
                        file_hashes: current_hashes,
                        env_prepend: cfg.env_prepend.clone(),
                    })
                } else {
                    Some(compute_anchor(
                        cfg,
                        &root.resolved.path,
                        &self.store,
                        &self.verify_cache,
                    )?)
                }
            }
            _ => {
                if let Some(lock) = &lockfile {
                    lockfile_hit = lock.matches(&chain, None);
                }
                None
            }
        };

        // 6. Environment.
        let env = resolve_env(&chain, anchor_ctx.as_ref(), &|name| std::env::var(name).ok());

        // 7. Config assembly and templating.
        let params = strip_reserved(invocation.params.clone());
        let context = ExecContext {
            tool_path: root.resolved.path.display().to_string(),
            project_path: self.layout.project.display().to_string(),
            params_json: serde_json::Value::Object(params.clone()).to_string(),
            anchor_path: anchor_ctx
                .as_ref()
                .map(|a| a.root.display().to_string()),
        };
        let config = build_exec_config(&chain, &env, &context, &params)?;

        let chain_ids: Vec<ItemId> = chain.elements.iter().map(|e| e.item_id.clone()).collect();

        if invocation.dry_run {
            return Ok(ExecutionReport {
                chain: chain_ids,
                config,
                lockfile_hit,
                result: None,
            });
        }

        // 8. Primitive dispatch with retry classification.
        let timeout = invocation
            .timeout
            .or_else(|| {
                config
                    .get("timeout_ms")
                    .and_then(serde_json::Value::as_u64)
                    .map(Duration::from_millis)
            })
            .unwrap_or(DEFAULT_TOOL_TIMEOUT);
        let primitive = self.primitives.get(&chain.primitive().item_id)?;
        let request = PrimitiveRequest {
            root_id: invocation.item_id.clone(),
            config: config.clone(),
            env,
            timeout,
        };
        let result = self
            .invoke_with_retry(primitive.as_ref(), &request, &cancel)
            .await?;

        // 9. Pin the lockfile on first success.
        if result.success && !lockfile_hit {
            let lock = Lockfile::pin(&chain, anchor_ctx.as_ref());
            if let Err(e) = lock.write(&lock_path) {
                tracing::warn!(
                    target: "strand.executor",
                    path = %lock_path.display(),
                    error = %e,
                    "could not write lockfile"
                );
            }
        }

        Ok(ExecutionReport {
            chain: chain_ids,
            config,
            lockfile_hit,
            result: Some(result),
        })
    }

    async fn invoke_with_retry(
        &self,
        primitive: &dyn Primitive,
        request: &PrimitiveRequest,
        cancel: &CancelFlag,
    ) -> strand_error::Result<PrimitiveResult> {
        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(StrandError::new(
                    ErrorCode::Cancelled,
                    format!("{} cancelled before dispatch", request.root_id),
                ));
            }

            let invoke = primitive.invoke(request.clone(), cancel.clone());
            let result = tokio::select! {
                outcome = tokio::time::timeout(request.timeout, invoke) => match outcome {
                    Ok(result) => result?,
                    Err(_elapsed) => PrimitiveResult::failed(format!(
                        "{} timed out after {:?}",
                        request.root_id, request.timeout
                    )),
                },
                () = cancel.cancelled() => {
                    return Err(StrandError::new(
                        ErrorCode::Cancelled,
                        format!("{} cancelled mid-invocation", request.root_id),
                    ));
                }
            };

            if result.success {
                if attempt > 1 {
                    tracing::info!(
                        target: "strand.executor",
                        tool = %request.root_id,
                        attempt,
                        "retry succeeded"
                    );
                }
                return Ok(result);
            }

            let classification = self
                .retry
                .classify(result.error.as_deref().unwrap_or(""));
            tracing::debug!(
                target: "strand.executor",
                tool = %request.root_id,
                code = %classification.code,
                attempt,
                "primitive failure classified"
            );
            if !classification.retryable || attempt >= classification.max_attempts {
                return Ok(result);
            }
            let backoff = RetryPolicy::backoff_for(&classification, attempt);
            if !interruptible_backoff(backoff, cancel).await {
                return Err(StrandError::new(
                    ErrorCode::Cancelled,
                    format!("{} cancelled during retry backoff", request.root_id),
                ));
            }
            attempt += 1;
        }
    }
}

fn anchor_scope_root(
    cfg: &strand_core::AnchorConfig,
    tool_path: &std::path::Path,
) -> std::path::PathBuf {
    let tool_dir = tool_path.parent().unwrap_or(std::path::Path::new("."));
    match &cfg.scope {
        Some(rel) => tool_dir.join(rel),
        None => tool_dir.to_path_buf(),
    }
}
