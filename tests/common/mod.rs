// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared end-to-end fixture: a full orchestrator over temp spaces with
//! a routing mock provider and recording primitives.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use strand_api::{Orchestrator, OrchestratorConfig};
use strand_core::{ItemId, ItemKind, Space};
use strand_error::{ErrorCode, StrandError};
use strand_executor::{Primitive, PrimitiveRegistry, PrimitiveRequest, PrimitiveResult};
use strand_harness::CancelFlag;
use strand_integrity::{KeyPair, TrustStore, sign_content};
use strand_provider::{
    CompletionRequest, MockProvider, Provider, ScriptedCall, ScriptedTurn, StreamEvent,
    TurnOutcome,
};
use strand_resolve::SpaceLayout;
use tokio::sync::mpsc;

/// Routes completions to a per-directive script by matching a marker
/// word in the conversation's first message.
pub struct RoutingProvider {
    routes: Vec<(String, Script)>,
    fallback: MockProvider,
}

pub enum Script {
    Turns(MockProvider),
    Fails(String),
}

impl RoutingProvider {
    pub fn new(routes: Vec<(&str, Script)>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|(marker, script)| (marker.to_string(), script))
                .collect(),
            fallback: MockProvider::new(vec![ScriptedTurn::text_only("done")]),
        }
    }
}

#[async_trait]
impl Provider for RoutingProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<TurnOutcome, StrandError> {
        let first = request
            .messages
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        for (marker, script) in &self.routes {
            if first.contains(marker.as_str()) {
                return match script {
                    Script::Turns(provider) => provider.complete(request, events).await,
                    Script::Fails(message) => Err(StrandError::new(
                        ErrorCode::PrimitiveFailure,
                        message.clone(),
                    )),
                };
            }
        }
        self.fallback.complete(request, events).await
    }

    fn context_window(&self, _model: Option<&str>) -> u64 {
        200_000
    }

    fn name(&self) -> &str {
        "routing-mock"
    }
}

/// A primitive that records `(tag, start, end)` per invocation and
/// sleeps `sleep_ms` from its config, observing cancellation.
#[derive(Clone, Default)]
pub struct RecordingPrimitive {
    pub log: Arc<Mutex<Vec<(String, Instant, Instant)>>>,
}

#[async_trait]
impl Primitive for RecordingPrimitive {
    async fn invoke(
        &self,
        request: PrimitiveRequest,
        cancel: CancelFlag,
    ) -> Result<PrimitiveResult, StrandError> {
        let start = Instant::now();
        let sleep_ms = request
            .config
            .get("sleep_ms")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let tag = request
            .config
            .get("params_json")
            .and_then(serde_json::Value::as_str)
            .and_then(|p| serde_json::from_str::<serde_json::Value>(p).ok())
            .and_then(|p| p["tag"].as_str().map(str::to_owned))
            .unwrap_or_else(|| request.root_id.to_string());

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
            () = cancel.cancelled() => {
                return Err(StrandError::new(
                    ErrorCode::Cancelled,
                    format!("{tag} cancelled mid-sleep"),
                ));
            }
        }

        let end = Instant::now();
        self.log
            .lock()
            .expect("log lock poisoned")
            .push((tag.clone(), start, end));
        Ok(PrimitiveResult::ok(serde_json::json!({"tag": tag})))
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// The full test harness: three temp spaces, a signing key trusted by
/// the orchestrator, a routing provider, and one recording primitive
/// registered as `core/primitive/run`.
pub struct World {
    pub _dirs: Vec<tempfile::TempDir>,
    pub layout: SpaceLayout,
    pub key: KeyPair,
    pub orchestrator: Orchestrator,
    pub primitive: RecordingPrimitive,
}

/// Install a fmt subscriber once so `STRAND_LOG=debug cargo test` shows
/// runner traces.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_env("STRAND_LOG")
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}

impl World {
    pub fn new(provider: RoutingProvider) -> Self {
        Self::with_config(provider, OrchestratorConfig::default())
    }

    pub fn with_config(provider: RoutingProvider, config: OrchestratorConfig) -> Self {
        init_tracing();
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let layout = SpaceLayout {
            project: dirs[0].path().to_path_buf(),
            user: dirs[1].path().to_path_buf(),
            system: dirs[2].path().to_path_buf(),
        };
        let key = KeyPair::generate();
        let mut store = TrustStore::new();
        store.insert(key.fingerprint.clone(), key.signing.verifying_key());

        let primitive = RecordingPrimitive::default();
        let mut primitives = PrimitiveRegistry::new();
        primitives.register(
            ItemId::new("core/primitive/run").unwrap(),
            primitive.clone(),
        );

        let orchestrator = Orchestrator::new(
            layout.clone(),
            store,
            Arc::new(provider),
            primitives,
            &config,
            Some(key.clone()),
        )
        .unwrap();

        Self {
            _dirs: dirs,
            layout,
            key,
            orchestrator,
            primitive,
        }
    }

    pub fn put_signed(&self, space: Space, kind: ItemKind, rel: &str, body: &str) {
        let path = self.layout.item_dir(space, kind).join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let suffix = rel.rsplit('.').next().unwrap();
        std::fs::write(path, sign_content(body, &self.key, suffix)).unwrap();
    }

    /// Author the standard sleep-tool chain: a tool per name, all backed
    /// by the recording primitive.
    pub fn put_sleep_tool(&self, id: &str, sleep_ms: u64) {
        self.put_signed(
            Space::Project,
            ItemKind::Tool,
            "core/primitive/run.yaml",
            "name: run\nversion: 1.0.0\ntool_type: primitive\n",
        );
        self.put_signed(
            Space::Project,
            ItemKind::Tool,
            &format!("{id}.yaml"),
            &format!(
                "name: {id}\nversion: 1.0.0\ntool_type: script\nexecutor_id: core/primitive/run\nconfig:\n  sleep_ms: {sleep_ms}\n"
            ),
        );
    }
}

/// Convenience: a tool call the scripted model emits.
pub fn call(call_id: &str, tool: &str, params: serde_json::Value) -> ScriptedCall {
    ScriptedCall {
        call_id: call_id.to_string(),
        tool: tool.to_string(),
        params,
    }
}

pub fn params(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    v.as_object().cloned().unwrap_or_default()
}
