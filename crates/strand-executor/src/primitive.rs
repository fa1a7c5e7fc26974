// SPDX-License-Identifier: MIT OR Apache-2.0
//! The primitive seam.
//!
//! Primitives terminate every chain. Their bytes-on-the-wire behavior
//! (subprocess spawning, HTTP) lives in external collaborators; the core
//! sees this async trait, a registry keyed by primitive item id, and a
//! structured result.

use crate::env::ResolvedEnv;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use strand_core::ItemId;
use strand_error::{ErrorCode, StrandError};
use strand_harness::CancelFlag;

/// A fully resolved invocation handed to a primitive.
#[derive(Debug, Clone)]
pub struct PrimitiveRequest {
    /// The chain's root item id (for logging and process records).
    pub root_id: ItemId,
    /// The merged, templated execution config.
    pub config: BTreeMap<String, serde_json::Value>,
    /// The resolved environment.
    pub env: ResolvedEnv,
    /// Per-call timeout.
    pub timeout: Duration,
}

/// Structured result every primitive returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrimitiveResult {
    /// Whether the primitive reports success.
    pub success: bool,
    /// Structured output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Captured stdout.
    #[serde(default)]
    pub stdout: String,
    /// Captured stderr.
    #[serde(default)]
    pub stderr: String,
    /// Wall-clock duration of the invocation.
    pub duration_ms: u64,
    /// Exit code for subprocess-like primitives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl PrimitiveResult {
    /// A successful result carrying `data`.
    #[must_use]
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Self::default()
        }
    }

    /// A failed result carrying `error`.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// A chain-terminal execution backend.
#[async_trait]
pub trait Primitive: Send + Sync {
    /// Execute one invocation. Implementations observe `cancel` and stop
    /// their work (including managed subprocesses) when it fires.
    async fn invoke(
        &self,
        request: PrimitiveRequest,
        cancel: CancelFlag,
    ) -> strand_error::Result<PrimitiveResult>;

    /// Name used in logs and diagnostics.
    fn name(&self) -> &str;
}

/// Registry mapping primitive item ids to implementations.
#[derive(Clone, Default)]
pub struct PrimitiveRegistry {
    primitives: HashMap<ItemId, Arc<dyn Primitive>>,
}

impl PrimitiveRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation for a primitive item id.
    pub fn register(&mut self, id: ItemId, primitive: impl Primitive + 'static) {
        self.primitives.insert(id, Arc::new(primitive));
    }

    /// Look up the implementation for a primitive item id.
    ///
    /// # Errors
    ///
    /// `EXECUTOR_NOT_FOUND` when no implementation is installed.
    pub fn get(&self, id: &ItemId) -> strand_error::Result<Arc<dyn Primitive>> {
        self.primitives.get(id).cloned().ok_or_else(|| {
            StrandError::new(
                ErrorCode::ExecutorNotFound,
                format!("no primitive implementation installed for {id}"),
            )
            .with_detail("primitive_id", id.as_str())
        })
    }

    /// Registered primitive ids, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<&ItemId> {
        let mut ids: Vec<&ItemId> = self.primitives.keys().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for PrimitiveRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimitiveRegistry")
            .field("primitives", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Primitive for Echo {
        async fn invoke(
            &self,
            request: PrimitiveRequest,
            _cancel: CancelFlag,
        ) -> strand_error::Result<PrimitiveResult> {
            Ok(PrimitiveResult::ok(serde_json::json!({
                "root": request.root_id.as_str(),
            })))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn request() -> PrimitiveRequest {
        PrimitiveRequest {
            root_id: ItemId::new("demo").unwrap(),
            config: BTreeMap::new(),
            env: ResolvedEnv::default(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn registry_dispatch() {
        let mut registry = PrimitiveRegistry::new();
        let id = ItemId::new("core/primitive/echo").unwrap();
        registry.register(id.clone(), Echo);
        let primitive = registry.get(&id).unwrap();
        let result = primitive
            .invoke(request(), CancelFlag::detached())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.data.unwrap()["root"], "demo");
    }

    #[test]
    fn missing_primitive_is_executor_not_found() {
        let registry = PrimitiveRegistry::new();
        let err = match registry.get(&ItemId::new("ghost").unwrap()) {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.code, ErrorCode::ExecutorNotFound);
    }

    #[test]
    fn result_serde_roundtrip() {
        let result = PrimitiveResult {
            success: false,
            data: None,
            error: Some("exit 1".into()),
            stdout: "out".into(),
            stderr: "err".into(),
            duration_ms: 42,
            exit_code: Some(1),
        };
        let json = serde_json::to_string(&result).unwrap();
        let back: PrimitiveResult = serde_json::from_str(&json).unwrap();
        assert!(!back.success);
        assert_eq!(back.exit_code, Some(1));
    }
}
