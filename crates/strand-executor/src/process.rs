// SPDX-License-Identifier: MIT OR Apache-2.0
//! Managed subprocess records.
//!
//! A primitive that leaves a long-lived child process behind records it
//! under the owning thread's `processes/` directory so cancellation can
//! find and stop it later — even from a different orchestrator process.
//! Termination is SIGTERM to the process group, then SIGKILL after a
//! grace period.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use strand_error::{ErrorCode, StrandError};
use uuid::Uuid;

/// Directory name under a thread's state directory.
pub const PROCESS_DIR: &str = "processes";

/// One managed subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Opaque handle id (filename stem).
    pub handle_id: Uuid,
    /// OS process id. The process is expected to lead its own group.
    pub pid: u32,
    /// The command line, for diagnostics.
    pub command: String,
    /// When the process was spawned.
    pub started_at: DateTime<Utc>,
}

impl ProcessRecord {
    /// Record a freshly spawned process.
    #[must_use]
    pub fn new(pid: u32, command: impl Into<String>) -> Self {
        Self {
            handle_id: Uuid::new_v4(),
            pid,
            command: command.into(),
            started_at: Utc::now(),
        }
    }

    /// Persist under `{thread_dir}/processes/{handle_id}.json`.
    ///
    /// # Errors
    ///
    /// `FILE_SYSTEM` on write failure.
    pub fn save(&self, thread_dir: &Path) -> strand_error::Result<PathBuf> {
        let dir = thread_dir.join(PROCESS_DIR);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", self.handle_id));
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| StrandError::new(ErrorCode::Parsing, e.to_string()))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// Remove this record (the process exited normally).
    pub fn remove(&self, thread_dir: &Path) {
        let path = thread_dir
            .join(PROCESS_DIR)
            .join(format!("{}.json", self.handle_id));
        let _ = std::fs::remove_file(path);
    }
}

/// Load all process records under a thread's state directory. Malformed
/// records are skipped with a warning.
#[must_use]
pub fn list_records(thread_dir: &Path) -> Vec<ProcessRecord> {
    let dir = thread_dir.join(PROCESS_DIR);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut records = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
        {
            Some(record) => records.push(record),
            None => {
                tracing::warn!(
                    target: "strand.executor",
                    path = %path.display(),
                    "skipping malformed process record"
                );
            }
        }
    }
    records
}

/// Terminate every recorded process of a thread: SIGTERM to each process
/// group, a grace period, then SIGKILL for survivors. Records are
/// removed afterwards. On non-unix targets the records are only cleared.
pub async fn terminate_recorded(thread_dir: &Path, grace: Duration) {
    let records = list_records(thread_dir);
    if records.is_empty() {
        return;
    }

    #[cfg(unix)]
    {
        for record in &records {
            tracing::info!(
                target: "strand.executor",
                pid = record.pid,
                command = %record.command,
                "terminating managed subprocess group"
            );
            signal_group(record.pid, libc::SIGTERM);
        }
        tokio::time::sleep(grace).await;
        for record in &records {
            signal_group(record.pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
        tracing::warn!(
            target: "strand.executor",
            count = records.len(),
            "process-group termination is unix-only; clearing records"
        );
    }

    for record in records {
        record.remove(thread_dir);
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn signal_group(pid: u32, signal: i32) {
    // Negative pid addresses the whole process group.
    let target = -(pid as i32);
    // SAFETY: kill(2) with a group id; failure (gone already) is benign.
    unsafe {
        libc::kill(target, signal);
    }
}
