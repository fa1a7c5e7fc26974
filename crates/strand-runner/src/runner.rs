// SPDX-License-Identifier: MIT OR Apache-2.0
//! The thread runner: startup sequence, turn loop, streaming dispatch,
//! and terminal settlement.
//!
//! A thread executes one directive as a cooperative LLM loop. Tool calls
//! stream out of the model and dispatch as soon as each call is fully
//! parsed: calls targeting different items run concurrently, calls
//! targeting the same item run in emission order. Child directives run
//! as in-process tasks on the same scheduler — no forking — with the
//! parent's token and thread id injected out of band.

use crate::coordination::{CompletionEvent, LiveThread, ThreadOutcome, WaitOptions};
use crate::transcript::TranscriptWriter;
use crate::{RunnerContext, interpolate_inputs};
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strand_capability::{CapabilityToken, attenuate};
use strand_core::{
    ItemId, ItemKind, Limits, SuspendReason, ThreadId, ThreadState, ThreadStatus,
    TranscriptEventKind,
};
use strand_error::{ErrorCode, StrandError};
use strand_extract::{DirectiveDoc, parse_directive, parse_knowledge};
use strand_harness::{
    CancelFlag, CancelReason, Harness, HookAction, HookDef, HookEvent, HookTable, LimitCheck,
    resolve_limits,
};
use strand_integrity::verify_file;
use strand_provider::{
    ChatMessage, CompletionRequest, StopKind, StreamEvent, ToolSchema, TurnOutcome,
};
use strand_resolve::resolve;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;

/// Environment variable naming the parent thread for out-of-process
/// callers. In-process spawns pass the parent context explicitly.
pub const PARENT_THREAD_ENV: &str = "STRAND_PARENT_THREAD";

/// Default remaining depth for a root thread that declares none.
const DEFAULT_ROOT_DEPTH: u32 = 5;

/// Name of the built-in join tool exposed to the model.
pub const WAIT_TOOL: &str = "wait_threads";

// ---------------------------------------------------------------------------
// Spawn request
// ---------------------------------------------------------------------------

/// Parent context injected into a child thread, never supplied by the
/// model.
#[derive(Debug, Clone)]
pub struct ParentContext {
    /// Parent thread id.
    pub thread_id: ThreadId,
    /// Parent's effective token (attenuation source).
    pub token: CapabilityToken,
    /// Parent's effective limits (capping source).
    pub limits: Limits,
    /// Parent's remaining depth.
    pub depth: u32,
}

/// A request to start one thread.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Directive to execute.
    pub directive_id: ItemId,
    /// Input parameters (reserved keys are stripped).
    pub params: Map<String, Value>,
    /// Parent context for child threads; `None` is a root invocation.
    pub parent: Option<ParentContext>,
    /// Caller limit overrides.
    pub overrides: Limits,
    /// Budget reservation override for child threads; defaults to the
    /// child's effective spend limit.
    pub reserve_spend: Option<f64>,
}

impl SpawnRequest {
    /// A root spawn with no overrides.
    #[must_use]
    pub fn root(directive_id: ItemId, params: Map<String, Value>) -> Self {
        Self {
            directive_id,
            params,
            parent: None,
            overrides: Limits::default(),
            reserve_spend: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Message view
// ---------------------------------------------------------------------------

/// The in-memory message list with turn boundaries, supporting
/// view-layer pruning. The on-disk transcript is never rewritten.
#[derive(Debug, Clone, Default)]
struct MessageView {
    messages: Vec<ChatMessage>,
    turn_starts: Vec<usize>,
}

impl MessageView {
    fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    fn mark_turn_start(&mut self) {
        self.turn_starts.push(self.messages.len());
    }

    fn messages(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    /// Replace everything between the first message and the start of
    /// `prune_before_turn` with a summary message.
    fn apply_patch(&mut self, summary: &str, prune_before_turn: usize) {
        let Some(&cut) = self.turn_starts.get(prune_before_turn) else {
            return;
        };
        if cut <= 1 {
            return;
        }
        let tail: Vec<ChatMessage> = self.messages.drain(cut..).collect();
        self.messages.truncate(1);
        self.messages
            .push(ChatMessage::assistant(format!("[context summary] {summary}")));
        let base = self.messages.len();
        self.messages.extend(tail);
        // Re-anchor turn boundaries onto the compacted list.
        let shift = cut as i64 - base as i64;
        for start in &mut self.turn_starts {
            if *start >= cut {
                *start = (*start as i64 - shift) as usize;
            } else {
                *start = base.min(*start);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// A thread that has completed its startup sequence and is ready to run.
pub struct PreparedThread {
    ctx: RunnerContext,
    /// The registered thread id.
    pub thread_id: ThreadId,
    /// The completion event (pre-created before any task spawn).
    pub event: CompletionEvent,
    directive_id: ItemId,
    doc: DirectiveDoc,
    harness: Arc<Harness>,
    writer: TranscriptWriter,
    view: MessageView,
    depth: u32,
    parent_thread_id: Option<ThreadId>,
    children: Arc<Mutex<Vec<ThreadId>>>,
    pressure_fired: bool,
}

/// Run the startup sequence for one thread.
///
/// # Errors
///
/// Any resolution, integrity, parsing, permission, budget, spawn-count,
/// or depth error. Failures after registration mark the registry row
/// `error` and fire the completion event before returning.
pub async fn start_thread(
    ctx: &RunnerContext,
    request: SpawnRequest,
) -> strand_error::Result<PreparedThread> {
    // 1. Parent context: explicit, then environment, then root.
    let parent = match request.parent.clone() {
        Some(parent) => Some(parent),
        None => match std::env::var(PARENT_THREAD_ENV).ok().filter(|v| !v.is_empty()) {
            Some(raw) => {
                let parent_id = ThreadId::from_raw(raw);
                let live = ctx.coordinator.live(&parent_id).ok_or_else(|| {
                    StrandError::new(
                        ErrorCode::PermissionDenied,
                        format!(
                            "child invocation under {parent_id} has no injected parent token"
                        ),
                    )
                    .with_suggestion("child threads receive their token from the parent, never by self-minting")
                })?;
                Some(ParentContext {
                    thread_id: parent_id,
                    token: live.token,
                    limits: live.limits,
                    depth: live.depth,
                })
            }
            None => None,
        },
    };

    // 2. Load and verify the directive.
    let resolved = resolve(&ctx.layout, ItemKind::Directive, &request.directive_id)?;
    let verdict = verify_file(&resolved.path, &ctx.store, &ctx.verify_cache)?;
    if let Some(err) = verdict.to_error(&resolved.path) {
        return Err(err);
    }
    let content = std::fs::read_to_string(&resolved.path)?;
    let doc = parse_directive(&content)?;

    // 3. Effective limits, depth, and token.
    let limits = resolve_limits(
        &ctx.defaults.limits,
        &doc.meta.limits,
        &request.overrides,
        parent.as_ref().map(|p| &p.limits),
    );
    let depth = match &parent {
        None => limits.max_depth.unwrap_or(DEFAULT_ROOT_DEPTH),
        Some(parent) => parent.depth.checked_sub(1).ok_or_else(|| {
            StrandError::new(
                ErrorCode::SpawnDepthExceeded,
                format!("spawning under {} would exceed the depth budget", parent.thread_id),
            )
        })?,
    };

    let candidate = ThreadId::generate(&request.directive_id, chrono::Utc::now().timestamp());
    let token = match &parent {
        None => CapabilityToken::mint(doc.meta.permissions.iter().cloned(), candidate.clone())
            .map_err(|e| StrandError::new(ErrorCode::Config, e.to_string()))?,
        Some(parent) => {
            // Only root invocations mint; children attenuate the parent's
            // token against what the directive declares.
            let attenuation = attenuate(
                &parent.token,
                doc.meta.permissions.iter().cloned(),
                candidate.clone(),
            )
            .map_err(|e| StrandError::new(ErrorCode::Config, e.to_string()))?;
            for dropped in &attenuation.dropped {
                tracing::warn!(
                    target: "strand.runner",
                    directive = %request.directive_id,
                    pattern = %dropped,
                    "declared capability not implied by parent; dropped"
                );
            }
            attenuation.token
        }
    };

    // 4. Parent spawn accounting (atomic check + increment).
    if let Some(parent) = &parent {
        ctx.ledger
            .increment_spawns(&parent.thread_id, parent.limits.max_spawns)?;
    }

    // 5. Registry row (disambiguates id collisions).
    let thread_id = ctx.ledger.register_thread(
        &candidate,
        parent.as_ref().map(|p| &p.thread_id),
        &request.directive_id,
        depth,
    )?;
    let thread_dir = ctx.layout.thread_dir(&thread_id);

    // Pre-create the completion event before anything can fail or spawn.
    let event = ctx.coordinator.create_event(&thread_id);

    let fail_registered = |err: StrandError| {
        let _ = ctx
            .ledger
            .update_status(&thread_id, ThreadStatus::Error, None, None);
        event.set(ThreadOutcome {
            thread_id: thread_id.clone(),
            status: ThreadStatus::Error,
            result: None,
            error: Some(err.clone()),
        });
        err
    };

    // 6. Budget: roots register their own cap; children must reserve.
    match &parent {
        None => {
            ctx.ledger
                .register_budget(&thread_id, limits.max_spend_usd)
                .map_err(&fail_registered)?;
        }
        Some(parent) => {
            // The reservation comes from what the child *declares* (or
            // the caller overrides) — inheriting the parent's cap is not
            // a declaration, and an undeclared child is rejected.
            let declared = request
                .reserve_spend
                .or(request.overrides.max_spend_usd)
                .or(doc.meta.limits.max_spend_usd)
                .ok_or_else(|| {
                    fail_registered(
                        StrandError::new(
                            ErrorCode::ChildBudgetInsufficient,
                            format!(
                                "child directive {} declares no spend limit",
                                request.directive_id
                            ),
                        )
                        .with_detail("code", "no_budget_declared"),
                    )
                })?;
            let amount = match limits.max_spend_usd {
                Some(effective) => declared.min(effective),
                None => declared,
            };
            let reserved = ctx
                .ledger
                .reserve(&parent.thread_id, &thread_id, amount, amount)
                .map_err(&fail_registered)?;
            if !reserved {
                return Err(fail_registered(
                    StrandError::new(
                        ErrorCode::ChildBudgetInsufficient,
                        format!(
                            "parent {} cannot reserve {amount} for {thread_id}",
                            parent.thread_id
                        ),
                    )
                    .with_detail("amount", amount),
                ));
            }
        }
    }

    // 7. Hooks (directive < project < infrastructure) and harness.
    let directive_hooks: Vec<HookDef> = match &doc.meta.hooks {
        None => Vec::new(),
        Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
            fail_registered(StrandError::new(
                ErrorCode::Config,
                format!("directive hooks block: {e}"),
            ))
        })?,
    };
    let hooks = HookTable::build(
        &directive_hooks,
        &ctx.defaults.project_hooks,
        &ctx.defaults.infrastructure_hooks,
    )
    .map_err(&fail_registered)?;

    let cancel = CancelFlag::for_thread_dir(&thread_dir);
    let harness = Arc::new(Harness::new(
        thread_id.clone(),
        limits.clone(),
        token.clone(),
        hooks,
        cancel.clone(),
        ctx.ledger.clone(),
    ));

    ctx.coordinator.register_live(
        thread_id.clone(),
        LiveThread {
            token,
            limits,
            depth,
            cancel,
            thread_dir: thread_dir.clone(),
        },
    );

    // 8. First message: before_step hook contributions, then the
    //    input-interpolated directive body.
    let mut sections: Vec<String> = Vec::new();
    let fields = Map::new();
    for hook in harness.matching_hooks(HookEvent::BeforeStep, &fields) {
        match &hook.def.action {
            HookAction::LoadKnowledge { item } => match load_knowledge(ctx, item) {
                Ok(body) => sections.push(body),
                Err(e) => {
                    tracing::warn!(
                        target: "strand.runner",
                        item = %item,
                        error = %e,
                        "before_step knowledge load failed"
                    );
                }
            },
            HookAction::Log { message } => {
                tracing::info!(target: "strand.runner", thread_id = %thread_id, "{message}");
            }
            HookAction::RunDirective { .. } => {
                // Directive-running hooks are turn-boundary behaviors;
                // they do not contribute to the first message.
            }
        }
    }
    let params = strand_executor::strip_reserved(request.params);
    sections.push(interpolate_inputs(&doc.prompt_body, &params));
    let first_message = sections.join("\n\n");

    let mut view = MessageView::default();
    view.push(ChatMessage::user(first_message.clone()));

    // 9. Transcript.
    let writer = TranscriptWriter::open(thread_id.clone(), &thread_dir)
        .map_err(&fail_registered)?;
    writer
        .record(
            TranscriptEventKind::ThreadStarted,
            json!({
                "directive": request.directive_id.as_str(),
                "parent_thread_id": parent.as_ref().map(|p| p.thread_id.to_string()),
                "depth": depth,
                "first_message": first_message,
            }),
        )
        .map_err(&fail_registered)?;

    Ok(PreparedThread {
        ctx: ctx.clone(),
        thread_id,
        event,
        directive_id: request.directive_id,
        doc,
        harness,
        writer,
        view,
        depth,
        parent_thread_id: parent.map(|p| p.thread_id),
        children: Arc::new(Mutex::new(Vec::new())),
        pressure_fired: false,
    })
}

/// Rebuild a [`PreparedThread`] for a suspended thread so the loop can
/// continue under the original thread id.
///
/// The caller (resume) has already reconstructed `messages` from the
/// transcript and decided the new limit overlay. The thread re-registers
/// its budget as a root-accounted continuation — the original
/// reservation settled when the thread suspended.
pub(crate) async fn prepare_resume(
    ctx: &RunnerContext,
    thread_id: ThreadId,
    directive_id: ItemId,
    messages: Vec<ChatMessage>,
    overrides: Limits,
    cost: strand_core::Cost,
    depth: u32,
) -> strand_error::Result<PreparedThread> {
    let resolved = resolve(&ctx.layout, ItemKind::Directive, &directive_id)?;
    let verdict = verify_file(&resolved.path, &ctx.store, &ctx.verify_cache)?;
    if let Some(err) = verdict.to_error(&resolved.path) {
        return Err(err);
    }
    let content = std::fs::read_to_string(&resolved.path)?;
    let doc = parse_directive(&content)?;

    let limits = resolve_limits(&ctx.defaults.limits, &doc.meta.limits, &overrides, None);
    let token = CapabilityToken::mint(doc.meta.permissions.iter().cloned(), thread_id.clone())
        .map_err(|e| StrandError::new(ErrorCode::Config, e.to_string()))?;

    let directive_hooks: Vec<HookDef> = match &doc.meta.hooks {
        None => Vec::new(),
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|e| StrandError::new(ErrorCode::Config, format!("directive hooks block: {e}")))?,
    };
    let hooks = HookTable::build(
        &directive_hooks,
        &ctx.defaults.project_hooks,
        &ctx.defaults.infrastructure_hooks,
    )?;

    let thread_dir = ctx.layout.thread_dir(&thread_id);
    let cancel = CancelFlag::for_thread_dir(&thread_dir);
    let mut harness = Harness::new(
        thread_id.clone(),
        limits.clone(),
        token.clone(),
        hooks,
        cancel.clone(),
        ctx.ledger.clone(),
    );
    harness.cost = strand_harness::CostAccumulator::from_snapshot(&cost);
    let harness = Arc::new(harness);

    ctx.ledger.register_budget(&thread_id, limits.max_spend_usd)?;
    ctx.ledger
        .update_status(&thread_id, ThreadStatus::Running, None, None)?;

    // The suspension already fired the old event; waiters of the resumed
    // run need a fresh one.
    let event = ctx.coordinator.replace_event(&thread_id);
    ctx.coordinator.register_live(
        thread_id.clone(),
        LiveThread {
            token,
            limits,
            depth,
            cancel,
            thread_dir: thread_dir.clone(),
        },
    );

    let writer = TranscriptWriter::open(thread_id.clone(), &thread_dir)?;
    writer.record(
        TranscriptEventKind::ThreadStarted,
        json!({
            "directive": directive_id.as_str(),
            "resumed": true,
            "replayed_messages": messages.len(),
        }),
    )?;

    let mut view = MessageView::default();
    for message in messages {
        view.push(message);
    }

    Ok(PreparedThread {
        ctx: ctx.clone(),
        thread_id,
        event,
        directive_id,
        doc,
        harness,
        writer,
        view,
        depth,
        parent_thread_id: None,
        children: Arc::new(Mutex::new(Vec::new())),
        pressure_fired: false,
    })
}

fn load_knowledge(ctx: &RunnerContext, item: &ItemId) -> strand_error::Result<String> {
    let resolved = resolve(&ctx.layout, ItemKind::Knowledge, item)?;
    let verdict = verify_file(&resolved.path, &ctx.store, &ctx.verify_cache)?;
    if let Some(err) = verdict.to_error(&resolved.path) {
        return Err(err);
    }
    let content = std::fs::read_to_string(&resolved.path)?;
    Ok(parse_knowledge(&content)?.body)
}

/// Start a thread and run it as a detached task. Returns once startup
/// finished; the completion event fires even if the task panics.
///
/// # Errors
///
/// Startup errors only; runtime failures surface through the event.
pub async fn spawn_thread(
    ctx: &RunnerContext,
    request: SpawnRequest,
) -> strand_error::Result<(ThreadId, CompletionEvent)> {
    let prepared = start_thread(ctx, request).await?;
    let thread_id = prepared.thread_id.clone();
    let event = prepared.event.clone();
    let coordinator = ctx.coordinator.clone();

    // Boxing erases the run() future's type: child threads spawn from
    // inside run(), so the unboxed type would be self-referential.
    let fut: BoxFuture<'static, ThreadOutcome> = Box::pin(prepared.run());
    let body = tokio::spawn(fut);
    let monitor = {
        let thread_id = thread_id.clone();
        let event = event.clone();
        let ledger = ctx.ledger.clone();
        tokio::spawn(async move {
            if let Err(join_err) = body.await {
                tracing::error!(
                    target: "strand.runner",
                    thread_id = %thread_id,
                    error = %join_err,
                    "thread task aborted"
                );
                let _ = ledger.update_status(&thread_id, ThreadStatus::Error, None, None);
                event.set(ThreadOutcome {
                    thread_id: thread_id.clone(),
                    status: ThreadStatus::Error,
                    result: None,
                    error: Some(StrandError::new(
                        ErrorCode::Unknown,
                        format!("thread task aborted: {join_err}"),
                    )),
                });
            }
            coordinator.remove_task(&thread_id);
        })
    };
    ctx.coordinator.register_task(thread_id.clone(), monitor);
    Ok((thread_id, event))
}

/// Start a thread and run it to completion on the caller's task.
///
/// # Errors
///
/// Startup errors only; runtime failures surface in the outcome.
pub async fn run_thread(
    ctx: &RunnerContext,
    request: SpawnRequest,
) -> strand_error::Result<ThreadOutcome> {
    let prepared = start_thread(ctx, request).await?;
    Ok(prepared.run().await)
}

// ---------------------------------------------------------------------------
// The turn loop
// ---------------------------------------------------------------------------

enum LoopExit {
    Completed(String),
    Breach(strand_harness::LimitBreach),
    Cancelled,
    Failed(StrandError),
}

impl PreparedThread {
    /// Run the turn loop to a terminal state. Settlement (ledger,
    /// registry, transcript, completion event) happens unconditionally
    /// on every exit path.
    pub async fn run(mut self) -> ThreadOutcome {
        self.harness.cost.start_timer();
        let exit = self.turn_loop().await;
        self.finish(exit).await
    }

    async fn turn_loop(&mut self) -> LoopExit {
        loop {
            match self.harness.check_limits() {
                LimitCheck::Breach(breach) => {
                    self.fire_limit_hooks(&breach).await;
                    return LoopExit::Breach(breach);
                }
                LimitCheck::Ok => {}
            }
            if self.harness.is_cancelled() {
                return LoopExit::Cancelled;
            }

            self.view.mark_turn_start();
            let turn_index = self.harness.cost.snapshot().turns;
            if self
                .writer
                .record(TranscriptEventKind::StepStart, json!({"turn": turn_index}))
                .is_err()
            {
                return LoopExit::Failed(StrandError::new(
                    ErrorCode::FileSystem,
                    "transcript unavailable",
                ));
            }

            let (text, tool_results, outcome) = match self.run_turn().await {
                Ok(turn) => turn,
                Err(err) if err.code == ErrorCode::Cancelled => return LoopExit::Cancelled,
                Err(err) => {
                    self.fire_error_hooks(&err);
                    return LoopExit::Failed(err);
                }
            };

            self.harness.cost.record_turn();
            self.harness
                .cost
                .record_tokens(outcome.usage.input_tokens, outcome.usage.output_tokens);
            self.harness.cost.record_spend(outcome.usage.spend_usd);
            let _ = self.ctx.ledger.heartbeat(&self.thread_id);

            if !text.is_empty() {
                self.view.push(ChatMessage::assistant(text.clone()));
                let _ = self
                    .writer
                    .record(TranscriptEventKind::CognitionOut, json!({"text": text}));
            }
            let had_calls = !tool_results.is_empty();
            for (call_id, content) in tool_results {
                self.view.push(ChatMessage::tool_result(call_id, content));
            }

            let _ = self.writer.record(
                TranscriptEventKind::StepFinish,
                json!({"turn": turn_index, "cost": self.harness.cost.snapshot()}),
            );
            self.checkpoint_state(ThreadStatus::Running, None);
            self.run_after_step_hooks();
            self.check_context_pressure().await;

            if !had_calls && outcome.stop == StopKind::EndTurn {
                return LoopExit::Completed(text);
            }
        }
    }

    /// One provider call: stream events, dispatch tool calls inline, and
    /// return the accumulated text plus ordered tool results.
    async fn run_turn(
        &mut self,
    ) -> strand_error::Result<(String, Vec<(String, String)>, TurnOutcome)> {
        let request = CompletionRequest {
            model: self.doc.meta.model.clone(),
            messages: self.view.messages(),
            tools: self.tool_schemas(),
        };

        let (events_tx, mut events_rx) = mpsc::channel::<StreamEvent>(256);
        let provider = self.ctx.provider.clone();
        let call = tokio::spawn(async move { provider.complete(request, events_tx).await });

        let mut text = String::new();
        let mut open_calls: HashMap<String, (String, String)> = HashMap::new();
        let mut dispatcher = TurnDispatcher::new(self);
        let cancel = self.harness.cancel_flag().clone();
        let deadline = tokio::time::sleep(self.ctx.defaults.llm_timeout);
        tokio::pin!(deadline);

        loop {
            let event = tokio::select! {
                event = events_rx.recv() => event,
                () = cancel.cancelled() => {
                    call.abort();
                    return Err(StrandError::new(
                        ErrorCode::Cancelled,
                        format!("{} cancelled during stream", self.thread_id),
                    ));
                }
                () = &mut deadline => {
                    call.abort();
                    return Err(StrandError::new(
                        ErrorCode::Timeout,
                        format!(
                            "provider call exceeded {:?}",
                            self.ctx.defaults.llm_timeout
                        ),
                    ));
                }
            };
            let Some(event) = event else { break };
            match event {
                StreamEvent::TextDelta { text: delta } => {
                    text.push_str(&delta);
                    let _ = self.writer.record(
                        TranscriptEventKind::CognitionOutDelta,
                        json!({"text": delta}),
                    );
                }
                StreamEvent::ToolCallStart { call_id, tool } => {
                    open_calls.insert(call_id, (tool, String::new()));
                }
                StreamEvent::ToolCallDelta { call_id, fragment } => {
                    if let Some((_, buffer)) = open_calls.get_mut(&call_id) {
                        buffer.push_str(&fragment);
                    }
                }
                StreamEvent::ToolCallEnd { call_id } => {
                    // Dispatch as soon as the call is fully parsed; the
                    // rest of the stream keeps flowing meanwhile.
                    if let Some((tool, buffer)) = open_calls.remove(&call_id) {
                        dispatcher.dispatch(call_id, tool, buffer);
                    }
                }
            }
        }

        let outcome = call
            .await
            .map_err(|e| StrandError::new(ErrorCode::Unknown, format!("provider task: {e}")))??;
        let tool_results = dispatcher.finish().await;
        Ok((text, tool_results, outcome))
    }

    /// Tool schemas exposed to the model: the built-in wait tool plus
    /// every concretely granted executable tool.
    fn tool_schemas(&self) -> Vec<ToolSchema> {
        let mut schemas = vec![ToolSchema {
            name: WAIT_TOOL.into(),
            description: "Wait for child threads to complete".into(),
            parameters: Some(json!({
                "type": "object",
                "required": ["thread_ids"],
                "properties": {
                    "thread_ids": {"type": "array", "items": {"type": "string"}},
                    "require_all": {"type": "boolean", "default": true},
                    "fail_fast": {"type": "boolean", "default": false},
                    "cancel_siblings_on_failure": {"type": "boolean", "default": false},
                    "timeout_secs": {"type": "number"}
                }
            })),
        }];

        for pattern in self.harness.token().patterns() {
            let Some(dotted) = pattern
                .strip_prefix("strand.execute.tool.")
                .or_else(|| pattern.strip_prefix("strand.execute.directive."))
            else {
                continue;
            };
            if dotted.contains('*') {
                continue;
            }
            let Ok(item_id) = ItemId::from_dotted(dotted) else {
                continue;
            };
            let kind = if pattern.starts_with("strand.execute.tool.") {
                ItemKind::Tool
            } else {
                ItemKind::Directive
            };
            if let Some(schema) = self.schema_for(kind, &item_id) {
                schemas.push(schema);
            }
        }
        schemas
    }

    fn schema_for(&self, kind: ItemKind, item_id: &ItemId) -> Option<ToolSchema> {
        let resolved = resolve(&self.ctx.layout, kind, item_id).ok()?;
        let content = std::fs::read_to_string(&resolved.path).ok()?;
        match kind {
            ItemKind::Tool => {
                let meta =
                    strand_extract::extract(kind, &resolved.suffix, &content).ok()?;
                let strand_extract::ItemMeta::Tool { meta, .. } = meta else {
                    return None;
                };
                Some(ToolSchema {
                    name: item_id.to_string(),
                    description: meta.name,
                    parameters: meta.parameters,
                })
            }
            ItemKind::Directive => {
                let doc = parse_directive(&content).ok()?;
                Some(ToolSchema {
                    name: item_id.to_string(),
                    description: doc.meta.description,
                    parameters: doc.meta.inputs,
                })
            }
            ItemKind::Knowledge => None,
        }
    }

    async fn fire_limit_hooks(&mut self, breach: &strand_harness::LimitBreach) {
        let cost = self.harness.cost.snapshot();
        let fields = self.harness.breach_fields(breach, &cost);
        let hooks: Vec<_> = self
            .harness
            .matching_hooks(HookEvent::Limit, &fields)
            .into_iter()
            .map(|h| h.def.clone())
            .collect();
        for def in hooks {
            match def.action {
                HookAction::Log { message } => {
                    tracing::warn!(
                        target: "strand.runner",
                        thread_id = %self.thread_id,
                        code = breach.code(),
                        "{message}"
                    );
                }
                HookAction::RunDirective { directive, params } => {
                    let _ = self.writer.record(
                        TranscriptEventKind::LimitEscalationRequested,
                        json!({"directive": directive.as_str(), "code": breach.code()}),
                    );
                    let mut merged = params;
                    for (k, v) in &fields {
                        merged.entry(k.clone()).or_insert(v.clone());
                    }
                    if let Err(e) = self.run_policy_directive(&directive, merged).await {
                        tracing::warn!(
                            target: "strand.runner",
                            directive = %directive,
                            error = %e,
                            "limit hook directive failed"
                        );
                    }
                }
                HookAction::LoadKnowledge { .. } => {}
            }
        }
    }

    /// Fire `error` hooks before the failure transitions the thread.
    /// Hooks observe and log; they cannot rescue the turn.
    fn fire_error_hooks(&self, err: &StrandError) {
        let mut fields = Map::new();
        fields.insert("code".into(), Value::String(err.code.as_str().into()));
        fields.insert("message".into(), Value::String(err.message.clone()));
        fields.insert("retryable".into(), Value::Bool(err.retryable));
        for hook in self.harness.matching_hooks(HookEvent::Error, &fields) {
            if let HookAction::Log { message } = &hook.def.action {
                tracing::error!(
                    target: "strand.runner",
                    thread_id = %self.thread_id,
                    code = err.code.as_str(),
                    "{message}"
                );
            }
        }
    }

    fn run_after_step_hooks(&self) {
        let fields = {
            let mut map = Map::new();
            map.insert(
                "cost".into(),
                serde_json::to_value(self.harness.cost.snapshot()).unwrap_or(Value::Null),
            );
            map
        };
        for hook in self.harness.matching_hooks(HookEvent::AfterStep, &fields) {
            if let HookAction::Log { message } = &hook.def.action {
                tracing::debug!(
                    target: "strand.runner",
                    thread_id = %self.thread_id,
                    "{message}"
                );
            }
        }
    }

    /// Run a policy directive (hook action) as a synchronous child.
    fn run_policy_directive<'a>(
        &'a self,
        directive: &'a ItemId,
        params: Map<String, Value>,
    ) -> BoxFuture<'a, strand_error::Result<ThreadOutcome>> {
        let request = SpawnRequest {
            directive_id: directive.clone(),
            params,
            parent: Some(self.parent_context()),
            overrides: Limits::default(),
            reserve_spend: None,
        };
        let ctx = self.ctx.clone();
        Box::pin(async move { run_thread(&ctx, request).await })
    }

    fn parent_context(&self) -> ParentContext {
        ParentContext {
            thread_id: self.thread_id.clone(),
            token: self.harness.token().clone(),
            limits: self.harness.limits().clone(),
            depth: self.depth,
        }
    }

    async fn check_context_pressure(&mut self) {
        let window = self
            .ctx
            .provider
            .context_window(self.doc.meta.model.as_deref());
        if window == 0 {
            return;
        }
        let cost = self.harness.cost.snapshot();
        let ratio = cost.input_tokens as f64 / window as f64;

        if ratio < self.ctx.defaults.pressure_rearm {
            self.pressure_fired = false;
            return;
        }
        if ratio < self.ctx.defaults.pressure_ratio || self.pressure_fired {
            return;
        }
        self.pressure_fired = true;

        let mut fields = Map::new();
        fields.insert("ratio".into(), json!(ratio));
        fields.insert("input_tokens".into(), json!(cost.input_tokens));
        fields.insert("window".into(), json!(window));
        let hooks: Vec<_> = self
            .harness
            .matching_hooks(HookEvent::ContextWindowPressure, &fields)
            .into_iter()
            .map(|h| h.def.clone())
            .collect();

        for def in hooks {
            if let HookAction::RunDirective { directive, params } = def.action {
                let _ = self.writer.record(
                    TranscriptEventKind::ContextCompactionStart,
                    json!({"ratio": ratio, "directive": directive.as_str()}),
                );
                let mut merged = params;
                for (k, v) in &fields {
                    merged.entry(k.clone()).or_insert(v.clone());
                }
                match self.run_policy_directive(&directive, merged).await {
                    Ok(outcome) => {
                        if let Some(patch) = outcome
                            .result
                            .as_deref()
                            .and_then(|r| serde_json::from_str::<Value>(r).ok())
                        {
                            let summary =
                                patch["summary"].as_str().unwrap_or_default().to_string();
                            let prune =
                                patch["prune_before_turn"].as_u64().unwrap_or(0) as usize;
                            self.view.apply_patch(&summary, prune);
                        }
                        let _ = self.writer.record(
                            TranscriptEventKind::ContextCompactionEnd,
                            json!({"applied": true}),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "strand.runner",
                            error = %e,
                            "context compaction directive failed"
                        );
                        let _ = self.writer.record(
                            TranscriptEventKind::ContextCompactionEnd,
                            json!({"applied": false}),
                        );
                    }
                }
                // One compaction per pressure crossing.
                break;
            }
        }
    }

    fn checkpoint_state(&self, status: ThreadStatus, suspend_reason: Option<SuspendReason>) {
        let state = ThreadState {
            thread_id: self.thread_id.clone(),
            parent_thread_id: self.parent_thread_id.clone(),
            directive_id: self.directive_id.clone(),
            status,
            suspend_reason,
            depth: self.depth,
            limits: self.harness.limits().clone(),
            cost: self.harness.cost.snapshot(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let path = self
            .ctx
            .layout
            .thread_dir(&self.thread_id)
            .join("state.json");
        let Ok(mut body) = serde_json::to_string_pretty(&state) else {
            return;
        };
        body.push('\n');
        if let Some(key) = &self.ctx.signing_key {
            body = strand_integrity::sign_content(&body, key, "json");
        }
        if let Err(e) = std::fs::write(&path, body) {
            tracing::warn!(
                target: "strand.runner",
                path = %path.display(),
                error = %e,
                "state snapshot write failed"
            );
        }
    }

    async fn finish(self, exit: LoopExit) -> ThreadOutcome {
        let (status, suspend_reason, result, error, breach_code) = match exit {
            LoopExit::Completed(text) => (ThreadStatus::Completed, None, Some(text), None, None),
            LoopExit::Cancelled => (ThreadStatus::Cancelled, None, None, None, None),
            LoopExit::Breach(breach) => {
                let (status, reason) = breach.disposition();
                let error = matches!(reason, Some(SuspendReason::Budget)).then(|| {
                    StrandError::new(
                        ErrorCode::BudgetExceeded,
                        format!("limit {} reached", breach.code()),
                    )
                    .with_detail("code", breach.code())
                });
                (status, reason, None, error, Some(breach.code()))
            }
            LoopExit::Failed(err) => (ThreadStatus::Error, None, None, Some(err), None),
        };

        // Cancellation propagates to descendants and to any managed
        // subprocesses this thread left behind.
        if status == ThreadStatus::Cancelled {
            let children: Vec<ThreadId> =
                self.children.lock().expect("children lock poisoned").clone();
            for child in children {
                self.ctx
                    .coordinator
                    .cancel_thread(&child, CancelReason::ParentCancelled);
            }
            strand_executor::terminate_recorded(
                &self.ctx.layout.thread_dir(&self.thread_id),
                Duration::from_secs(2),
            )
            .await;
        }

        let cost = self.harness.cost.snapshot();
        if let Err(e) = self.ctx.ledger.report_actual(&self.thread_id, cost.spend_usd) {
            tracing::warn!(
                target: "strand.runner",
                thread_id = %self.thread_id,
                error = %e,
                "budget settlement failed"
            );
        }
        let _ = self.ctx.ledger.update_status(
            &self.thread_id,
            status,
            suspend_reason,
            result.as_deref(),
        );

        let kind = match status {
            ThreadStatus::Completed => TranscriptEventKind::ThreadCompleted,
            ThreadStatus::Suspended => TranscriptEventKind::ThreadSuspended,
            ThreadStatus::Cancelled => TranscriptEventKind::ThreadCancelled,
            _ => TranscriptEventKind::ThreadError,
        };
        let _ = self.writer.record(
            kind,
            json!({
                "result": result,
                "error": error.as_ref().map(|e| e.to_envelope()["error"].clone()),
                "suspend_reason": suspend_reason.map(|r| r.to_string()),
                "limit_code": breach_code,
                "cost": &cost,
            }),
        );
        self.checkpoint_state(status, suspend_reason);
        if status == ThreadStatus::Suspended {
            let escalation = self
                .ctx
                .layout
                .thread_dir(&self.thread_id)
                .join("escalation.json");
            let _ = std::fs::write(
                &escalation,
                serde_json::to_string_pretty(&json!({
                    "thread_id": self.thread_id.to_string(),
                    "reason": suspend_reason.map(|r| r.to_string()),
                    "requested_at": chrono::Utc::now().to_rfc3339(),
                }))
                .unwrap_or_default(),
            );
        }

        // `after_complete` hooks observe the terminal state.
        let mut fields = Map::new();
        fields.insert("status".into(), Value::String(status.to_string()));
        fields.insert(
            "cost".into(),
            serde_json::to_value(&cost).unwrap_or(Value::Null),
        );
        for hook in self.harness.matching_hooks(HookEvent::AfterComplete, &fields) {
            if let HookAction::Log { message } = &hook.def.action {
                tracing::info!(
                    target: "strand.runner",
                    thread_id = %self.thread_id,
                    status = %status,
                    "{message}"
                );
            }
        }

        self.ctx.coordinator.remove_live(&self.thread_id);
        let outcome = ThreadOutcome {
            thread_id: self.thread_id.clone(),
            status,
            result,
            error,
        };
        self.event.set(outcome.clone());
        outcome
    }
}

// ---------------------------------------------------------------------------
// Turn dispatcher
// ---------------------------------------------------------------------------

struct CallResult {
    content: String,
}

/// Shared context each dispatched call needs.
struct DispatchShared {
    ctx: RunnerContext,
    harness: Arc<Harness>,
    writer: TranscriptWriter,
    parent: ParentContext,
    children: Arc<Mutex<Vec<ThreadId>>>,
}

/// Streams completed calls into per-item groups: one sequential worker
/// per item id, workers running concurrently, capped by a semaphore.
struct TurnDispatcher {
    shared: Arc<DispatchShared>,
    groups: HashMap<String, mpsc::UnboundedSender<(String, Value, oneshot::Sender<CallResult>)>>,
    workers: JoinSet<()>,
    results: Vec<(String, oneshot::Receiver<CallResult>)>,
    semaphore: Arc<Semaphore>,
}

impl TurnDispatcher {
    fn new(thread: &PreparedThread) -> Self {
        Self {
            shared: Arc::new(DispatchShared {
                ctx: thread.ctx.clone(),
                harness: thread.harness.clone(),
                writer: thread.writer.clone(),
                parent: thread.parent_context(),
                children: thread.children.clone(),
            }),
            groups: HashMap::new(),
            workers: JoinSet::new(),
            results: Vec::new(),
            semaphore: Arc::new(Semaphore::new(thread.ctx.defaults.max_parallel_dispatch)),
        }
    }

    /// Route one fully parsed call to its item group, spawning the group
    /// worker on first use.
    fn dispatch(&mut self, call_id: String, tool: String, raw_args: String) {
        let args: Value = match serde_json::from_str(&raw_args) {
            Ok(v) => v,
            Err(e) => {
                // Malformed arguments become an immediate typed error
                // result; the model sees it next turn.
                let (tx, rx) = oneshot::channel();
                let err = StrandError::new(
                    ErrorCode::Parsing,
                    format!("tool call {call_id} has malformed arguments: {e}"),
                );
                let _ = tx.send(CallResult {
                    content: err.to_envelope().to_string(),
                });
                self.results.push((call_id, rx));
                return;
            }
        };

        let (tx, rx) = oneshot::channel();
        self.results.push((call_id.clone(), rx));

        let sender = self.groups.entry(tool.clone()).or_insert_with(|| {
            let (group_tx, mut group_rx) =
                mpsc::unbounded_channel::<(String, Value, oneshot::Sender<CallResult>)>();
            let shared = self.shared.clone();
            let semaphore = self.semaphore.clone();
            let tool = tool.clone();
            self.workers.spawn(async move {
                // Same-item calls run strictly in emission order.
                while let Some((call_id, args, reply)) = group_rx.recv().await {
                    let _permit = semaphore.acquire().await;
                    let content = run_one_call(&shared, &tool, &call_id, args).await;
                    let _ = reply.send(CallResult { content });
                }
            });
            group_tx
        });
        let _ = sender.send((call_id, args, tx));
    }

    /// Close all groups, await the workers, and return `(call_id,
    /// content)` pairs in the model's emission order.
    async fn finish(mut self) -> Vec<(String, String)> {
        self.groups.clear();
        while self.workers.join_next().await.is_some() {}
        let mut out = Vec::with_capacity(self.results.len());
        for (call_id, rx) in self.results {
            let content = rx.await.map_or_else(
                |_| {
                    StrandError::new(ErrorCode::Unknown, "tool dispatch dropped")
                        .to_envelope()
                        .to_string()
                },
                |r| r.content,
            );
            out.push((call_id, content));
        }
        out
    }
}

/// Execute one call: the built-in wait tool, a child directive, or an
/// executor-chain tool. Always returns result content for the model;
/// failures are typed error envelopes, never bare strings.
async fn run_one_call(
    shared: &DispatchShared,
    tool: &str,
    call_id: &str,
    args: Value,
) -> String {
    let _ = shared.writer.record(
        TranscriptEventKind::ToolCallStart,
        json!({"call_id": call_id, "tool": tool, "args": args}),
    );

    let content = dispatch_call(shared, tool, args).await;
    let (body, is_error) = match content {
        Ok(value) => (value.to_string(), false),
        Err(err) => (err.to_envelope().to_string(), true),
    };

    let _ = shared.writer.record(
        TranscriptEventKind::ToolCallResult,
        json!({
            "call_id": call_id,
            "tool": tool,
            "is_error": is_error,
            "content": serde_json::from_str::<Value>(&body).unwrap_or(Value::Null),
        }),
    );
    body
}

async fn dispatch_call(
    shared: &DispatchShared,
    tool: &str,
    args: Value,
) -> strand_error::Result<Value> {
    if shared.harness.is_cancelled() {
        return Err(StrandError::new(
            ErrorCode::Cancelled,
            "thread cancelled before dispatch",
        ));
    }

    if tool == WAIT_TOOL {
        return run_wait_tool(shared, args).await;
    }

    let item_id = ItemId::new(tool)
        .or_else(|_| ItemId::from_dotted(tool))
        .map_err(|e| StrandError::new(ErrorCode::ItemNotFound, e))?;

    // A tool call naming a directive starts a child thread; everything
    // else flows through the executor chain.
    if resolve(&shared.ctx.layout, ItemKind::Directive, &item_id).is_ok() {
        return run_child_directive(shared, &item_id, args).await;
    }

    shared
        .harness
        .check_permission(&format!("strand.execute.tool.{}", item_id.dotted()))?;

    let params = match args {
        Value::Object(map) => strand_executor::strip_reserved(map),
        Value::Null => Map::new(),
        other => {
            return Err(StrandError::new(
                ErrorCode::Parsing,
                format!("tool arguments must be an object, got {other}"),
            ));
        }
    };

    let report = shared
        .ctx
        .executor
        .execute(
            strand_executor::Invocation::new(item_id, params),
            shared.harness.cancel_flag().clone(),
        )
        .await?;
    let result = report.result.ok_or_else(|| {
        StrandError::new(ErrorCode::Unknown, "execution returned no primitive result")
    })?;
    Ok(serde_json::to_value(&result)?)
}

async fn run_child_directive(
    shared: &DispatchShared,
    item_id: &ItemId,
    args: Value,
) -> strand_error::Result<Value> {
    shared
        .harness
        .check_permission(&format!("strand.execute.directive.{}", item_id.dotted()))?;

    let mut params = match args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(StrandError::new(
                ErrorCode::Parsing,
                format!("directive arguments must be an object, got {other}"),
            ));
        }
    };
    let fire_and_forget = params
        .remove("fire_and_forget")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    // Model-supplied parent context is stripped; the real context is
    // injected out of band from the dispatching thread.
    let params = strand_executor::strip_reserved(params);

    let request = SpawnRequest {
        directive_id: item_id.clone(),
        params,
        parent: Some(shared.parent.clone()),
        overrides: Limits::default(),
        reserve_spend: None,
    };

    let (child_id, event) = spawn_thread(&shared.ctx, request).await?;
    shared.harness.cost.record_spawn();
    shared
        .children
        .lock()
        .expect("children lock poisoned")
        .push(child_id.clone());
    let _ = shared.writer.record(
        TranscriptEventKind::ChildThreadStarted,
        json!({"child_thread_id": child_id.to_string(), "directive": item_id.as_str()}),
    );

    if fire_and_forget {
        return Ok(json!({"thread_id": child_id.to_string(), "status": "running"}));
    }

    let outcome = event.wait().await;
    if outcome.status == ThreadStatus::Error {
        let _ = shared.writer.record(
            TranscriptEventKind::ChildThreadFailed,
            json!({
                "child_thread_id": child_id.to_string(),
                "error": outcome.error.as_ref().map(|e| e.to_envelope()["error"].clone()),
            }),
        );
    }
    Ok(outcome_to_value(&outcome))
}

async fn run_wait_tool(shared: &DispatchShared, args: Value) -> strand_error::Result<Value> {
    let ids: Vec<ThreadId> = args["thread_ids"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(ThreadId::from_raw))
                .collect()
        })
        .unwrap_or_default();
    if ids.is_empty() {
        return Err(StrandError::new(
            ErrorCode::Parsing,
            "wait_threads requires a non-empty thread_ids array",
        ));
    }
    let opts = WaitOptions {
        require_all: args["require_all"].as_bool().unwrap_or(true),
        fail_fast: args["fail_fast"].as_bool().unwrap_or(false),
        cancel_siblings_on_failure: args["cancel_siblings_on_failure"]
            .as_bool()
            .unwrap_or(false),
        timeout: args["timeout_secs"]
            .as_f64()
            .map(Duration::from_secs_f64),
    };
    let report = shared.ctx.coordinator.wait_threads(&ids, opts).await?;
    Ok(json!({
        "outcomes": report.outcomes.iter().map(outcome_to_value).collect::<Vec<_>>(),
        "pending": report.pending.iter().map(ToString::to_string).collect::<Vec<_>>(),
    }))
}

fn outcome_to_value(outcome: &ThreadOutcome) -> Value {
    json!({
        "thread_id": outcome.thread_id.to_string(),
        "status": outcome.status.to_string(),
        "result": outcome.result,
        "error": outcome.error.as_ref().map(|e| e.to_envelope()["error"].clone()),
    })
}
