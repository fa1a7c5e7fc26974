// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Strand: an agent orchestration core.
//!
//! Signed, versioned workflow items (directives, tools, knowledge)
//! executed by a language-model turn loop under capability checks,
//! per-thread limits, and hierarchical budgets.
//!
//! This root crate is a convenience facade over the workspace members;
//! depend on the individual `strand-*` crates for finer-grained builds.

pub use strand_api::{LoadResponse, Orchestrator, OrchestratorConfig, SearchHit, SignResponse};
pub use strand_capability::{Attenuation, CapabilityToken, attenuate};
pub use strand_core::{
    Cost, DirectiveMeta, ItemId, ItemKind, KnowledgeMeta, Limits, Space, SuspendReason, ThreadId,
    ThreadState, ThreadStatus, ToolMeta, TranscriptEvent, TranscriptEventKind,
};
pub use strand_error::{ErrorCategory, ErrorCode, StrandError};
pub use strand_executor::{
    Chain, ExecutionReport, Executor, Invocation, Primitive, PrimitiveRegistry, PrimitiveRequest,
    PrimitiveResult,
};
pub use strand_harness::{CancelFlag, CancelReason, Harness, HookDef, HookEvent, LimitBreach};
pub use strand_integrity::{BundleManifest, KeyPair, TrustStore, Verdict, VerifyCache};
pub use strand_ledger::Ledger;
pub use strand_provider::{ChatMessage, CompletionRequest, MockProvider, Provider, StreamEvent};
pub use strand_resolve::{Resolved, SpaceLayout, resolve};
pub use strand_runner::{
    CompletionEvent, Coordinator, ResumeOptions, RunnerContext, RunnerDefaults, SpawnRequest,
    ThreadOutcome, WaitOptions, resume_thread, run_thread, spawn_thread,
};
