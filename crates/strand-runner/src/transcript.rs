// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only transcript writer and reader.
//!
//! One JSONL file per thread. Critical events are written and flushed
//! under the lock; droppable events skip the write entirely when the
//! lock is contended — losing a progress delta is acceptable, stalling
//! the turn loop is not.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};
use strand_core::{ThreadId, TranscriptEvent, TranscriptEventKind};
use strand_error::{ErrorCode, StrandError};

/// Transcript filename inside a thread's state directory.
pub const TRANSCRIPT_FILE: &str = "transcript.jsonl";

/// Append-only writer for one thread's transcript.
#[derive(Clone)]
pub struct TranscriptWriter {
    thread_id: ThreadId,
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl std::fmt::Debug for TranscriptWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptWriter")
            .field("path", &self.path)
            .finish()
    }
}

impl TranscriptWriter {
    /// Open (append mode) the transcript in `thread_dir`.
    ///
    /// # Errors
    ///
    /// `FILE_SYSTEM` when the directory or file cannot be created.
    pub fn open(thread_id: ThreadId, thread_dir: &Path) -> strand_error::Result<Self> {
        std::fs::create_dir_all(thread_dir)?;
        let path = thread_dir.join(TRANSCRIPT_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            thread_id,
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Path of the transcript file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Droppable kinds are best-effort: a contended
    /// lock or failed write drops them silently; critical kinds
    /// propagate failures.
    ///
    /// # Errors
    ///
    /// `FILE_SYSTEM` when a critical event cannot be appended.
    pub fn record(
        &self,
        kind: TranscriptEventKind,
        payload: serde_json::Value,
    ) -> strand_error::Result<()> {
        let event = TranscriptEvent::now(self.thread_id.clone(), kind, payload);
        let line = serde_json::to_string(&event)?;

        if kind.is_droppable() {
            match self.file.try_lock() {
                Ok(mut file) => {
                    let _ = writeln!(file, "{line}");
                }
                Err(TryLockError::WouldBlock | TryLockError::Poisoned(_)) => {
                    tracing::trace!(
                        target: "strand.transcript",
                        kind = %kind,
                        "dropped transcript event under contention"
                    );
                }
            }
            return Ok(());
        }

        let mut file = self.file.lock().map_err(|_| {
            StrandError::new(ErrorCode::FileSystem, "transcript lock poisoned")
        })?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

/// Read a transcript back, skipping unparsable lines with a warning.
///
/// # Errors
///
/// `FILE_SYSTEM` when the file cannot be opened.
pub fn read_transcript(path: &Path) -> strand_error::Result<Vec<TranscriptEvent>> {
    let file = File::open(path)?;
    let mut events = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TranscriptEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!(
                    target: "strand.transcript",
                    line = n + 1,
                    error = %e,
                    "skipping malformed transcript line"
                );
            }
        }
    }
    Ok(events)
}
