// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-process coordination: task registry and completion events.
//!
//! Two maps keyed by thread id live behind one [`Coordinator`] handle:
//! running task handles and completion events. Events are created
//! *before* the child task spawns, eliminating the race where a child
//! finishes before its parent registers interest. Coordination is
//! strictly in-process — joining an unknown thread is a synchronous
//! error, and the transcript is never polled as a fallback.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strand_capability::CapabilityToken;
use strand_core::{Limits, ThreadId, ThreadStatus};
use strand_error::{ErrorCode, StrandError};
use strand_harness::{CancelFlag, CancelReason};
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Outcomes and events
// ---------------------------------------------------------------------------

/// Terminal outcome of one thread, delivered through its completion
/// event.
#[derive(Debug, Clone)]
pub struct ThreadOutcome {
    /// The thread.
    pub thread_id: ThreadId,
    /// Terminal status.
    pub status: ThreadStatus,
    /// Final result text when completed.
    pub result: Option<String>,
    /// The error when status is `Error`.
    pub error: Option<StrandError>,
}

/// A set-exactly-once completion event.
#[derive(Clone)]
pub struct CompletionEvent {
    inner: Arc<EventInner>,
}

struct EventInner {
    outcome: Mutex<Option<ThreadOutcome>>,
    notify: Notify,
}

impl CompletionEvent {
    /// Create an unset event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                outcome: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Set the outcome and wake all waiters. Only the first set wins;
    /// later calls are ignored.
    pub fn set(&self, outcome: ThreadOutcome) {
        {
            let mut guard = self.inner.outcome.lock().expect("event lock poisoned");
            if guard.is_some() {
                return;
            }
            *guard = Some(outcome);
        }
        self.inner.notify.notify_waiters();
    }

    /// The outcome, if already set.
    #[must_use]
    pub fn get(&self) -> Option<ThreadOutcome> {
        self.inner.outcome.lock().expect("event lock poisoned").clone()
    }

    /// Wait for the outcome.
    pub async fn wait(&self) -> ThreadOutcome {
        loop {
            // Register interest before checking, so a set between check
            // and await cannot be missed.
            let notified = self.inner.notify.notified();
            if let Some(outcome) = self.get() {
                return outcome;
            }
            notified.await;
        }
    }
}

impl Default for CompletionEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompletionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionEvent")
            .field("set", &self.get().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Live thread info
// ---------------------------------------------------------------------------

/// What the coordinator knows about a live thread, enough for parent
/// context resolution and cancellation.
#[derive(Debug, Clone)]
pub struct LiveThread {
    /// Effective capability token.
    pub token: CapabilityToken,
    /// Effective limits.
    pub limits: Limits,
    /// Remaining spawn depth.
    pub depth: u32,
    /// Cancellation flag.
    pub cancel: CancelFlag,
    /// The thread's state directory (durable markers).
    pub thread_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Wait options / report
// ---------------------------------------------------------------------------

/// Options of the `wait_threads` built-in.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Wait for all ids (`true`) or return on the first completion.
    pub require_all: bool,
    /// Return as soon as any waited thread errors.
    pub fail_fast: bool,
    /// On a failure, request cancellation of the still-running ids.
    pub cancel_siblings_on_failure: bool,
    /// Overall deadline.
    pub timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            require_all: true,
            fail_fast: false,
            cancel_siblings_on_failure: false,
            timeout: None,
        }
    }
}

/// What a wait returned.
#[derive(Debug, Clone)]
pub struct WaitReport {
    /// Outcomes in completion order.
    pub outcomes: Vec<ThreadOutcome>,
    /// Ids still pending when the wait returned early.
    pub pending: Vec<ThreadId>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CoordinatorInner {
    events: Mutex<HashMap<ThreadId, CompletionEvent>>,
    live: Mutex<HashMap<ThreadId, LiveThread>>,
    tasks: Mutex<HashMap<ThreadId, tokio::task::JoinHandle<()>>>,
}

/// The in-process coordination handle. Clone freely.
#[derive(Clone, Default)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Create an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return) the completion event for a thread. Called
    /// before the thread's task spawns.
    #[must_use]
    pub fn create_event(&self, thread_id: &ThreadId) -> CompletionEvent {
        self.inner
            .events
            .lock()
            .expect("events lock poisoned")
            .entry(thread_id.clone())
            .or_default()
            .clone()
    }

    /// Install a fresh completion event, replacing any prior (already
    /// fired) one. Used when a suspended thread resumes under its
    /// original id.
    #[must_use]
    pub fn replace_event(&self, thread_id: &ThreadId) -> CompletionEvent {
        let event = CompletionEvent::new();
        self.inner
            .events
            .lock()
            .expect("events lock poisoned")
            .insert(thread_id.clone(), event.clone());
        event
    }

    /// Look up an existing completion event.
    #[must_use]
    pub fn event(&self, thread_id: &ThreadId) -> Option<CompletionEvent> {
        self.inner
            .events
            .lock()
            .expect("events lock poisoned")
            .get(thread_id)
            .cloned()
    }

    /// Record a live thread (called during startup).
    pub fn register_live(&self, thread_id: ThreadId, info: LiveThread) {
        self.inner
            .live
            .lock()
            .expect("live lock poisoned")
            .insert(thread_id, info);
    }

    /// Live info for a thread, if it is still running in this process.
    #[must_use]
    pub fn live(&self, thread_id: &ThreadId) -> Option<LiveThread> {
        self.inner
            .live
            .lock()
            .expect("live lock poisoned")
            .get(thread_id)
            .cloned()
    }

    /// Remove a thread from the live map (terminal transition).
    pub fn remove_live(&self, thread_id: &ThreadId) {
        self.inner
            .live
            .lock()
            .expect("live lock poisoned")
            .remove(thread_id);
    }

    /// Track a spawned task handle.
    pub fn register_task(&self, thread_id: ThreadId, handle: tokio::task::JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .insert(thread_id, handle);
    }

    /// Drop a finished task handle.
    pub fn remove_task(&self, thread_id: &ThreadId) {
        self.inner
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .remove(thread_id);
    }

    /// Request cancellation of a live thread (flag + durable marker).
    /// Unknown or already-terminal threads are a no-op.
    pub fn cancel_thread(&self, thread_id: &ThreadId, reason: CancelReason) {
        if let Some(info) = self.live(thread_id) {
            tracing::info!(
                target: "strand.coordination",
                thread_id = %thread_id,
                reason = reason.as_str(),
                "cancellation requested"
            );
            info.cancel.request(reason);
        }
    }

    /// Block on completion events per `opts`.
    ///
    /// # Errors
    ///
    /// `THREAD_NOT_FOUND` immediately when any id has no event (never
    /// started); `WAIT_TIMEOUT` when the deadline passes first.
    pub async fn wait_threads(
        &self,
        ids: &[ThreadId],
        opts: WaitOptions,
    ) -> strand_error::Result<WaitReport> {
        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            let event = self.event(id).ok_or_else(|| {
                StrandError::new(
                    ErrorCode::ThreadNotFound,
                    format!("cannot wait on unknown thread {id}"),
                )
                .with_detail("thread_id", id.as_str())
            })?;
            events.push((id.clone(), event));
        }

        let wait_all = self.collect_outcomes(events, &opts);
        let report = match opts.timeout {
            Some(deadline) => tokio::time::timeout(deadline, wait_all).await.map_err(|_| {
                StrandError::new(
                    ErrorCode::WaitTimeout,
                    format!("wait on {} thread(s) timed out after {deadline:?}", ids.len()),
                )
            })?,
            None => wait_all.await,
        };
        Ok(report)
    }

    async fn collect_outcomes(
        &self,
        events: Vec<(ThreadId, CompletionEvent)>,
        opts: &WaitOptions,
    ) -> WaitReport {
        let mut pending: Vec<ThreadId> = events.iter().map(|(id, _)| id.clone()).collect();
        let mut futures: FuturesUnordered<_> = events
            .into_iter()
            .map(|(id, event)| async move {
                let outcome = event.wait().await;
                (id, outcome)
            })
            .collect();

        let mut outcomes = Vec::new();
        while let Some((id, outcome)) = futures.next().await {
            pending.retain(|p| p != &id);
            let failed = outcome.status == ThreadStatus::Error;
            outcomes.push(outcome);

            let early_exit = (!opts.require_all) || (opts.fail_fast && failed);
            if early_exit {
                if failed && opts.cancel_siblings_on_failure {
                    for sibling in &pending {
                        self.cancel_thread(sibling, CancelReason::Requested);
                    }
                }
                return WaitReport {
                    outcomes,
                    pending,
                };
            }
        }
        WaitReport {
            outcomes,
            pending,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tid(s: &str) -> ThreadId {
        ThreadId::from_raw(s)
    }

    fn done(id: &str, status: ThreadStatus) -> ThreadOutcome {
        ThreadOutcome {
            thread_id: tid(id),
            status,
            result: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn event_set_before_wait_resolves_immediately() {
        let event = CompletionEvent::new();
        event.set(done("a", ThreadStatus::Completed));
        let outcome = event.wait().await;
        assert_eq!(outcome.status, ThreadStatus::Completed);
    }

    #[tokio::test]
    async fn event_set_only_once() {
        let event = CompletionEvent::new();
        event.set(done("a", ThreadStatus::Completed));
        event.set(done("a", ThreadStatus::Error));
        assert_eq!(event.get().unwrap().status, ThreadStatus::Completed);
    }

    #[tokio::test]
    async fn wait_on_unknown_thread_is_synchronous_error() {
        let coordinator = Coordinator::new();
        let err = coordinator
            .wait_threads(&[tid("ghost")], WaitOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ThreadNotFound);
    }

    #[tokio::test]
    async fn wait_all_collects_every_outcome() {
        let coordinator = Coordinator::new();
        let a = coordinator.create_event(&tid("a"));
        let b = coordinator.create_event(&tid("b"));
        a.set(done("a", ThreadStatus::Completed));
        b.set(done("b", ThreadStatus::Completed));
        let report = coordinator
            .wait_threads(&[tid("a"), tid("b")], WaitOptions::default())
            .await
            .unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.pending.is_empty());
    }

    #[tokio::test]
    async fn wait_any_returns_on_first() {
        let coordinator = Coordinator::new();
        let a = coordinator.create_event(&tid("a"));
        let _b = coordinator.create_event(&tid("b"));
        a.set(done("a", ThreadStatus::Completed));
        let report = coordinator
            .wait_threads(
                &[tid("a"), tid("b")],
                WaitOptions {
                    require_all: false,
                    ..WaitOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.pending, vec![tid("b")]);
    }

    #[tokio::test]
    async fn fail_fast_stops_on_error() {
        let coordinator = Coordinator::new();
        let a = coordinator.create_event(&tid("a"));
        let _b = coordinator.create_event(&tid("b"));
        a.set(done("a", ThreadStatus::Error));
        let report = coordinator
            .wait_threads(
                &[tid("a"), tid("b")],
                WaitOptions {
                    fail_fast: true,
                    ..WaitOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].status, ThreadStatus::Error);
        assert_eq!(report.pending, vec![tid("b")]);
    }

    #[tokio::test]
    async fn timeout_is_wait_timeout() {
        let coordinator = Coordinator::new();
        let _a = coordinator.create_event(&tid("a"));
        let err = coordinator
            .wait_threads(
                &[tid("a")],
                WaitOptions {
                    timeout: Some(Duration::from_millis(20)),
                    ..WaitOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::WaitTimeout);
    }

    #[tokio::test]
    async fn late_set_wakes_waiter() {
        let coordinator = Coordinator::new();
        let event = coordinator.create_event(&tid("slow"));
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_threads(&[tid("slow")], WaitOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        event.set(done("slow", ThreadStatus::Cancelled));
        let report = waiter.await.unwrap().unwrap();
        assert_eq!(report.outcomes[0].status, ThreadStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_thread_requests_live_flag() {
        let coordinator = Coordinator::new();
        let flag = CancelFlag::detached();
        coordinator.register_live(
            tid("x"),
            LiveThread {
                token: CapabilityToken::empty(tid("x")),
                limits: Limits::default(),
                depth: 1,
                cancel: flag.clone(),
                thread_dir: PathBuf::from("/tmp/none"),
            },
        );
        coordinator.cancel_thread(&tid("x"), CancelReason::Requested);
        assert!(flag.is_cancelled());
        // Unknown thread: no-op, no panic.
        coordinator.cancel_thread(&tid("ghost"), CancelReason::Requested);
    }
}
