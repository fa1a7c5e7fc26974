// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cancellation primitives for thread execution.
//!
//! A cancel request is both durable and immediate: it writes a poison
//! file under the thread's state directory (so descendants and restarted
//! orchestrators observe it) and flips an in-process flag that wakes any
//! waiter. The runner polls the flag at loop checkpoints; primitives and
//! retry sleeps select against [`CancelFlag::cancelled`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Filename of the durable cancellation marker.
pub const CANCEL_MARKER: &str = "cancel.requested";

/// A cloneable, cheaply-shareable cancellation flag.
///
/// All clones share the same underlying state; cancelling one
/// immediately makes every clone observe `is_cancelled() == true`.
#[derive(Clone)]
pub struct CancelFlag {
    inner: Arc<FlagInner>,
}

struct FlagInner {
    cancelled: AtomicBool,
    notify: Notify,
    marker: Option<PathBuf>,
}

impl CancelFlag {
    /// Create a flag with no durable marker (tests, detached work).
    #[must_use]
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(FlagInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                marker: None,
            }),
        }
    }

    /// Create a flag whose durable marker lives in `thread_dir`.
    ///
    /// If the marker already exists on disk (a cancel requested before
    /// this process started, or by another process), the flag starts
    /// cancelled.
    #[must_use]
    pub fn for_thread_dir(thread_dir: &std::path::Path) -> Self {
        let marker = thread_dir.join(CANCEL_MARKER);
        let already = marker.exists();
        Self {
            inner: Arc::new(FlagInner {
                cancelled: AtomicBool::new(already),
                notify: Notify::new(),
                marker: Some(marker),
            }),
        }
    }

    /// Signal cancellation: write the marker (best effort) and wake
    /// waiters. Idempotent.
    pub fn request(&self, reason: CancelReason) {
        if let Some(marker) = &self.inner.marker {
            if let Some(parent) = marker.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = std::fs::write(marker, reason.as_str()) {
                tracing::warn!(
                    target: "strand.harness",
                    marker = %marker.display(),
                    error = %e,
                    "could not write cancel marker"
                );
            }
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns `true` once [`request`](Self::request) has been called or
    /// the durable marker has appeared on disk.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        // Another process may have written the marker.
        if let Some(marker) = &self.inner.marker
            && marker.exists()
        {
            self.inner.cancelled.store(true, Ordering::SeqCst);
            self.inner.notify.notify_waiters();
            return true;
        }
        false
    }

    /// Future that completes when the flag is cancelled. Resolves
    /// immediately if cancellation already happened.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.inner.cancelled.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

impl std::fmt::Debug for CancelFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelFlag")
            .field("cancelled", &self.inner.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}

/// Why a thread was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Explicit request from the caller or a sibling-failure policy.
    Requested,
    /// A per-operation timeout fired.
    Timeout,
    /// The parent thread was cancelled and propagated the marker.
    ParentCancelled,
    /// The orchestrator is shutting down.
    Shutdown,
}

impl CancelReason {
    /// Stable string written into the marker file.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Timeout => "timeout",
            Self::ParentCancelled => "parent_cancelled",
            Self::Shutdown => "shutdown",
        }
    }
}
