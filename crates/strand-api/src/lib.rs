// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The public operations facade.
//!
//! An agent client sees exactly four operations — `search`, `load`,
//! `execute`, `sign` — plus the thread-management verbs (`cancel`,
//! `resume`) that act on already-started work. Every failure is a
//! structured [`StrandError`]; there are no bare strings on the wire.

/// Orchestrator configuration (`strand.toml`).
pub mod config;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use strand_capability::pattern_matches;
use strand_core::{ItemId, ItemKind, Space, ThreadId, ThreadStatus};
use strand_error::{ErrorCode, StrandError};
use strand_executor::{Executor, Invocation, PrimitiveRegistry};
use strand_extract::{ItemMeta, extract};
use strand_harness::{CancelFlag, CancelReason};
use strand_integrity::{KeyPair, TrustStore, sign_file, verify_file};
use strand_ledger::Ledger;
use strand_provider::Provider;
use strand_resolve::{SpaceLayout, list_items, resolve};
use strand_runner::{
    Coordinator, ResumeOptions, RunnerContext, SpawnRequest, ThreadOutcome, resume_thread,
    run_thread, spawn_thread,
};

pub use config::OrchestratorConfig;

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

/// One search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// The item's id.
    pub item_id: ItemId,
    /// The item's kind.
    #[serde(rename = "type")]
    pub kind: ItemKind,
    /// Space of the winning occurrence.
    pub space: Space,
    /// Relevance score (higher is better).
    pub score: u32,
    /// One-line summary from the item's metadata.
    pub summary: String,
}

/// Response of the `load` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResponse {
    /// The item's id.
    pub item_id: ItemId,
    /// Space the item was loaded from.
    pub space: Space,
    /// Full file content, signature line included.
    pub content: String,
    /// Destination path when the item was copied between spaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copied_to: Option<String>,
}

/// Response of the `sign` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignResponse {
    /// The embedded signature line.
    pub signature_line: String,
    /// Signer fingerprint.
    pub fingerprint: String,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The orchestrator handle: all shared subsystems wired together.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: RunnerContext,
    signing_key: Option<Arc<KeyPair>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Wire an orchestrator from its collaborators.
    ///
    /// # Errors
    ///
    /// Database open errors from the registry/ledger.
    pub fn new(
        layout: SpaceLayout,
        store: TrustStore,
        provider: Arc<dyn Provider>,
        primitives: PrimitiveRegistry,
        config: &OrchestratorConfig,
        signing_key: Option<KeyPair>,
    ) -> strand_error::Result<Self> {
        let store = Arc::new(store);
        let ledger = Ledger::open(&layout.registry_db())?;
        let executor = Executor::new(layout.clone(), store.clone(), primitives);
        let verify_cache = executor.verify_cache().clone();
        let signing_key = signing_key.map(Arc::new);
        let ctx = RunnerContext {
            layout,
            ledger,
            executor,
            provider,
            coordinator: Coordinator::new(),
            store,
            verify_cache,
            signing_key: signing_key.clone(),
            defaults: config.runner_defaults(),
        };
        Ok(Self { ctx, signing_key })
    }

    /// The underlying runner context (tests, embedders).
    #[must_use]
    pub fn context(&self) -> &RunnerContext {
        &self.ctx
    }

    // -- search -------------------------------------------------------------

    /// Find items by dotted scope and text query.
    ///
    /// The scope's first segment selects the kind (`tool`, `directive`,
    /// `knowledge`); the remainder is a dotted glob over item ids, e.g.
    /// `tool.fs.*` or `directive.*`.
    ///
    /// # Errors
    ///
    /// `PARSING` for an unusable scope.
    pub fn search(
        &self,
        scope: &str,
        query: &str,
        space: Option<Space>,
        limit: Option<usize>,
    ) -> strand_error::Result<Vec<SearchHit>> {
        let (kind_str, id_pattern) = match scope.split_once('.') {
            Some((kind, rest)) => (kind, rest.to_string()),
            None => (scope, "*".to_string()),
        };
        let kind: ItemKind = kind_str.parse().map_err(|e: String| {
            StrandError::new(ErrorCode::Parsing, format!("search scope: {e}"))
                .with_suggestion("use tool.*, directive.*, or knowledge.* scopes")
        })?;

        let query_lower = query.to_ascii_lowercase();
        let mut hits = Vec::new();
        for item in list_items(&self.ctx.layout, kind, space) {
            if !pattern_matches(&id_pattern, &item.item_id.dotted()) {
                continue;
            }
            let (score, summary) = self.score_item(&item, &query_lower);
            if score == 0 && !query.is_empty() {
                continue;
            }
            hits.push(SearchHit {
                item_id: item.item_id,
                kind,
                space: item.space,
                score,
                summary,
            });
        }
        hits.sort_by(|a, b| b.score.cmp(&a.score).then(a.item_id.cmp(&b.item_id)));
        hits.truncate(limit.unwrap_or(25));
        Ok(hits)
    }

    fn score_item(&self, item: &strand_resolve::ListedItem, query: &str) -> (u32, String) {
        let mut score = 0;
        if query.is_empty() {
            score = 1;
        }
        if item.item_id.as_str().contains(query) && !query.is_empty() {
            score += 3;
        }
        let summary = std::fs::read_to_string(&item.path)
            .ok()
            .and_then(|content| {
                let suffix = item
                    .path
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or_default();
                match extract(item.kind, suffix, &content).ok()? {
                    ItemMeta::Directive(doc) => {
                        if !query.is_empty()
                            && (doc.meta.description.to_ascii_lowercase().contains(query)
                                || doc.prompt_body.to_ascii_lowercase().contains(query))
                        {
                            score += 2;
                        }
                        Some(doc.meta.description)
                    }
                    ItemMeta::Tool { meta, .. } => {
                        if !query.is_empty() && meta.category.contains(query) {
                            score += 2;
                        }
                        Some(format!("{} ({})", meta.name, meta.tool_type))
                    }
                    ItemMeta::Knowledge(doc) => {
                        if !query.is_empty()
                            && (doc.body.to_ascii_lowercase().contains(query)
                                || doc.meta.tags.iter().any(|t| t.contains(query)))
                        {
                            score += 2;
                        }
                        Some(doc.meta.title)
                    }
                }
            })
            .unwrap_or_default();
        (score, summary)
    }

    // -- load ---------------------------------------------------------------

    /// Read an item's full content, optionally copying it into another
    /// space.
    ///
    /// # Errors
    ///
    /// Resolution and filesystem errors.
    pub fn load(
        &self,
        kind: ItemKind,
        item_id: &ItemId,
        destination: Option<Space>,
    ) -> strand_error::Result<LoadResponse> {
        let resolved = resolve(&self.ctx.layout, kind, item_id)?;
        let content = std::fs::read_to_string(&resolved.path)?;

        let copied_to = match destination {
            Some(dest) if dest != resolved.space => {
                let target = self
                    .ctx
                    .layout
                    .item_dir(dest, kind)
                    .join(item_id.as_str())
                    .with_extension(&resolved.suffix);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, &content)?;
                Some(target.display().to_string())
            }
            _ => None,
        };

        Ok(LoadResponse {
            item_id: item_id.clone(),
            space: resolved.space,
            content,
            copied_to,
        })
    }

    // -- execute ------------------------------------------------------------

    /// Execute an item.
    ///
    /// Tools run through the executor chain. Directives start a thread:
    /// the result body on completion, or `{thread_id}` immediately when
    /// `params.fire_and_forget` is true. Knowledge returns its parsed
    /// body.
    ///
    /// # Errors
    ///
    /// The full execution taxonomy; every failure carries a stable code.
    pub async fn execute(
        &self,
        kind: ItemKind,
        item_id: &ItemId,
        params: Map<String, Value>,
        dry_run: bool,
    ) -> strand_error::Result<Value> {
        match kind {
            ItemKind::Tool => {
                let report = self
                    .ctx
                    .executor
                    .execute(
                        Invocation {
                            item_id: item_id.clone(),
                            params,
                            timeout: None,
                            dry_run,
                        },
                        CancelFlag::detached(),
                    )
                    .await?;
                Ok(json!({
                    "success": report.result.as_ref().is_none_or(|r| r.success),
                    "chain": report.chain.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "lockfile_hit": report.lockfile_hit,
                    "dry_run": dry_run,
                    "result": report.result,
                }))
            }
            ItemKind::Directive => {
                let mut params = params;
                let fire_and_forget = params
                    .remove("fire_and_forget")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if dry_run {
                    // Dry-running a directive validates resolution and
                    // metadata without starting a thread.
                    let resolved = resolve(&self.ctx.layout, kind, item_id)?;
                    let verdict =
                        verify_file(&resolved.path, &self.ctx.store, &self.ctx.verify_cache)?;
                    if let Some(err) = verdict.to_error(&resolved.path) {
                        return Err(err);
                    }
                    let content = std::fs::read_to_string(&resolved.path)?;
                    let doc = strand_extract::parse_directive(&content)?;
                    return Ok(json!({
                        "success": true,
                        "dry_run": true,
                        "directive": doc.meta,
                    }));
                }
                let request = SpawnRequest::root(item_id.clone(), params);
                if fire_and_forget {
                    let (thread_id, _event) = spawn_thread(&self.ctx, request).await?;
                    Ok(json!({"success": true, "thread_id": thread_id.to_string()}))
                } else {
                    let outcome = run_thread(&self.ctx, request).await?;
                    Ok(outcome_to_value(&outcome))
                }
            }
            ItemKind::Knowledge => {
                let resolved = resolve(&self.ctx.layout, kind, item_id)?;
                let verdict =
                    verify_file(&resolved.path, &self.ctx.store, &self.ctx.verify_cache)?;
                if let Some(err) = verdict.to_error(&resolved.path) {
                    return Err(err);
                }
                let content = std::fs::read_to_string(&resolved.path)?;
                let doc = strand_extract::parse_knowledge(&content)?;
                Ok(json!({
                    "success": true,
                    "meta": doc.meta,
                    "body": doc.body,
                }))
            }
        }
    }

    // -- sign ---------------------------------------------------------------

    /// Validate an item's metadata, then embed a signature line.
    ///
    /// # Errors
    ///
    /// `CONFIG` when no signing key is configured; `PARSING` when the
    /// item's metadata does not validate; resolution and filesystem
    /// errors otherwise.
    pub fn sign(&self, kind: ItemKind, item_id: &ItemId) -> strand_error::Result<SignResponse> {
        let key = self.signing_key.as_ref().ok_or_else(|| {
            StrandError::new(ErrorCode::Config, "no signing key configured")
                .with_suggestion("generate a key and register it in the trust store")
        })?;
        let resolved = resolve(&self.ctx.layout, kind, item_id)?;

        // Schema validation before signing: an item that does not parse
        // must not be signed into circulation.
        let content = std::fs::read_to_string(&resolved.path)?;
        extract(kind, &resolved.suffix, &content)?;

        let line = sign_file(&resolved.path, key)?;
        self.ctx.verify_cache.clear();
        Ok(SignResponse {
            signature_line: line.render(),
            fingerprint: key.fingerprint.clone(),
        })
    }

    // -- thread management ----------------------------------------------------

    /// Request cancellation of a running thread.
    ///
    /// Durable (marker file) and immediate (in-process flag); descendants
    /// receive markers as their parents observe the cancel.
    ///
    /// # Errors
    ///
    /// `THREAD_NOT_FOUND` for an unknown id.
    pub fn cancel(&self, thread_id: &ThreadId) -> strand_error::Result<()> {
        let row = self.ctx.ledger.get_thread(thread_id)?.ok_or_else(|| {
            StrandError::new(
                ErrorCode::ThreadNotFound,
                format!("thread {thread_id} is not registered"),
            )
        })?;
        if row.status.is_terminal() {
            return Ok(());
        }
        // Durable marker even when the thread is not live in this
        // process (picked up at the next checkpoint or on resume).
        let flag = CancelFlag::for_thread_dir(&self.ctx.layout.thread_dir(thread_id));
        flag.request(CancelReason::Requested);
        self.ctx
            .coordinator
            .cancel_thread(thread_id, CancelReason::Requested);
        Ok(())
    }

    /// Resume a suspended thread.
    ///
    /// # Errors
    ///
    /// See [`resume_thread`].
    pub async fn resume(
        &self,
        thread_id: &ThreadId,
        options: ResumeOptions,
    ) -> strand_error::Result<Value> {
        let outcome = resume_thread(&self.ctx, thread_id, options).await?;
        Ok(outcome_to_value(&outcome))
    }
}

fn outcome_to_value(outcome: &ThreadOutcome) -> Value {
    json!({
        "success": outcome.status == ThreadStatus::Completed,
        "thread_id": outcome.thread_id.to_string(),
        "status": outcome.status.to_string(),
        "result": outcome.result,
        "error": outcome.error.as_ref().map(|e| e.to_envelope()["error"].clone()),
    })
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use strand_integrity::sign_content;
    use strand_provider::{MockProvider, ScriptedTurn};

    struct Fixture {
        _dirs: Vec<tempfile::TempDir>,
        orchestrator: Orchestrator,
        key: KeyPair,
        layout: SpaceLayout,
    }

    fn fixture(turns: Vec<ScriptedTurn>) -> Fixture {
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let layout = SpaceLayout {
            project: dirs[0].path().to_path_buf(),
            user: dirs[1].path().to_path_buf(),
            system: dirs[2].path().to_path_buf(),
        };
        let key = KeyPair::generate();
        let mut store = TrustStore::new();
        store.insert(key.fingerprint.clone(), key.signing.verifying_key());
        let orchestrator = Orchestrator::new(
            layout.clone(),
            store,
            Arc::new(MockProvider::new(turns)),
            PrimitiveRegistry::new(),
            &OrchestratorConfig::default(),
            Some(key.clone()),
        )
        .unwrap();
        Fixture {
            _dirs: dirs,
            orchestrator,
            key,
            layout,
        }
    }

    fn put_signed(f: &Fixture, space: Space, kind: ItemKind, rel: &str, body: &str) {
        let path = f.layout.item_dir(space, kind).join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let suffix = rel.rsplit('.').next().unwrap();
        std::fs::write(path, sign_content(body, &f.key, suffix)).unwrap();
    }

    #[tokio::test]
    async fn search_scores_and_filters() {
        let f = fixture(vec![]);
        put_signed(
            &f,
            Space::Project,
            ItemKind::Tool,
            "fs/read.yaml",
            "name: read-file\nversion: 1.0.0\ntool_type: script\ncategory: fs\n",
        );
        put_signed(
            &f,
            Space::Project,
            ItemKind::Tool,
            "net/get.yaml",
            "name: http-get\nversion: 1.0.0\ntool_type: script\ncategory: net\n",
        );

        let hits = f.orchestrator.search("tool.*", "fs", None, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item_id.as_str(), "fs/read");
        assert!(hits[0].score >= 3);

        let scoped = f.orchestrator.search("tool.net.*", "", None, None).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].item_id.as_str(), "net/get");
    }

    #[tokio::test]
    async fn search_bad_scope_is_parsing_error() {
        let f = fixture(vec![]);
        let err = f.orchestrator.search("widget.*", "", None, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::Parsing);
    }

    #[tokio::test]
    async fn load_reads_and_copies() {
        let f = fixture(vec![]);
        put_signed(
            &f,
            Space::System,
            ItemKind::Knowledge,
            "rules.md",
            "---\nid: rules\n---\nBe careful.\n",
        );
        let id = ItemId::new("rules").unwrap();
        let loaded = f
            .orchestrator
            .load(ItemKind::Knowledge, &id, Some(Space::Project))
            .unwrap();
        assert_eq!(loaded.space, Space::System);
        assert!(loaded.content.contains("Be careful."));
        assert!(loaded.copied_to.is_some());
        // The copy now shadows the system item.
        let again = f.orchestrator.load(ItemKind::Knowledge, &id, None).unwrap();
        assert_eq!(again.space, Space::Project);
    }

    #[tokio::test]
    async fn execute_knowledge_returns_parsed_body() {
        let f = fixture(vec![]);
        put_signed(
            &f,
            Space::Project,
            ItemKind::Knowledge,
            "rules.md",
            "---\nid: rules\ntags: [style]\n---\nAlways verify.\n",
        );
        let out = f
            .orchestrator
            .execute(
                ItemKind::Knowledge,
                &ItemId::new("rules").unwrap(),
                Map::new(),
                false,
            )
            .await
            .unwrap();
        assert_eq!(out["success"], true);
        assert_eq!(out["body"].as_str().unwrap().trim(), "Always verify.");
    }

    #[tokio::test]
    async fn execute_unsigned_knowledge_fails_closed() {
        let f = fixture(vec![]);
        let path = f
            .layout
            .item_dir(Space::Project, ItemKind::Knowledge)
            .join("raw.md");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "no signature\n").unwrap();
        let err = f
            .orchestrator
            .execute(
                ItemKind::Knowledge,
                &ItemId::new("raw").unwrap(),
                Map::new(),
                false,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Unsigned);
    }

    #[tokio::test]
    async fn execute_directive_runs_thread() {
        let f = fixture(vec![ScriptedTurn::text_only("plan ready").with_usage(50, 10, 0.01)]);
        put_signed(
            &f,
            Space::Project,
            ItemKind::Directive,
            "plan.md",
            "<directive name=\"plan\" version=\"1.0.0\"></directive>\n\nMake a plan for {service}.\n",
        );
        let out = f
            .orchestrator
            .execute(
                ItemKind::Directive,
                &ItemId::new("plan").unwrap(),
                serde_json::json!({"service": "api"})
                    .as_object()
                    .unwrap()
                    .clone(),
                false,
            )
            .await
            .unwrap();
        assert_eq!(out["success"], true);
        assert_eq!(out["status"], "completed");
        assert_eq!(out["result"], "plan ready");
    }

    #[tokio::test]
    async fn directive_dry_run_validates_without_running() {
        let f = fixture(vec![]);
        put_signed(
            &f,
            Space::Project,
            ItemKind::Directive,
            "plan.md",
            "<directive name=\"plan\" version=\"1.0.0\"></directive>\n\nBody.\n",
        );
        let out = f
            .orchestrator
            .execute(
                ItemKind::Directive,
                &ItemId::new("plan").unwrap(),
                Map::new(),
                true,
            )
            .await
            .unwrap();
        assert_eq!(out["dry_run"], true);
        assert_eq!(out["directive"]["name"], "plan");
    }

    #[tokio::test]
    async fn sign_validates_then_embeds() {
        let f = fixture(vec![]);
        // Unsigned but schema-valid tool config.
        let path = f
            .layout
            .item_dir(Space::Project, ItemKind::Tool)
            .join("fmt.yaml");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "name: fmt\nversion: 1.0.0\ntool_type: config\n").unwrap();

        let id = ItemId::new("fmt").unwrap();
        let response = f.orchestrator.sign(ItemKind::Tool, &id).unwrap();
        assert!(response.signature_line.starts_with("strand-sig-v1:"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("strand-sig-v1:"));
    }

    #[tokio::test]
    async fn sign_rejects_invalid_metadata() {
        let f = fixture(vec![]);
        let path = f
            .layout
            .item_dir(Space::Project, ItemKind::Tool)
            .join("broken.yaml");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "name: broken\n").unwrap();
        let err = f
            .orchestrator
            .sign(ItemKind::Tool, &ItemId::new("broken").unwrap())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Parsing);
    }

    #[tokio::test]
    async fn cancel_unknown_thread_errors() {
        let f = fixture(vec![]);
        let err = f
            .orchestrator
            .cancel(&ThreadId::from_raw("ghost"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ThreadNotFound);
    }
}
