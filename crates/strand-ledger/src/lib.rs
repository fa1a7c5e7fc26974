// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Durable thread registry and hierarchical budget ledger.
//!
//! One WAL-mode SQLite database holds two tables: `threads` (the
//! registry rows the runner transitions) and `budgets` (hierarchical
//! reservation and settlement). Every write runs in a `BEGIN IMMEDIATE`
//! transaction so racing siblings serialize at the database; reads may
//! proceed concurrently under WAL.
//!
//! The budget invariant: for any thread `T` with direct children `C`,
//! `T.actual + Σ(reserved of active C) + Σ(actual of completed C)
//! ≤ T.max_spend`.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use strand_core::{ItemId, SuspendReason, ThreadId, ThreadStatus};
use strand_error::{ErrorCode, StrandError};

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One row of the thread registry.
#[derive(Debug, Clone)]
pub struct ThreadRow {
    /// Thread identifier.
    pub thread_id: ThreadId,
    /// Parent thread, if any.
    pub parent_thread_id: Option<ThreadId>,
    /// Directive the thread executes.
    pub directive_id: ItemId,
    /// Current status.
    pub status: ThreadStatus,
    /// Suspension reason when suspended.
    pub suspend_reason: Option<SuspendReason>,
    /// Remaining spawn-tree depth.
    pub depth: u32,
    /// Direct children spawned so far.
    pub spawns: u32,
    /// Final result text, when completed.
    pub result: Option<String>,
}

/// One row of the budget table.
#[derive(Debug, Clone)]
pub struct BudgetRow {
    /// Thread identifier.
    pub thread_id: ThreadId,
    /// Parent thread, if any.
    pub parent_thread_id: Option<ThreadId>,
    /// Outstanding reservation.
    pub reserved_spend: f64,
    /// Settled spend.
    pub actual_spend: f64,
    /// Spend cap; `None` means unconstrained (root only).
    pub max_spend: Option<f64>,
    /// `true` once settled.
    pub completed: bool,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Handle to the registry / ledger database. Cheap to clone; all clones
/// share one connection guarded by a mutex (single writer).
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

fn db_err(e: rusqlite::Error) -> StrandError {
    StrandError::new(ErrorCode::Unknown, format!("ledger database: {e}"))
}

impl Ledger {
    /// Open (or create) the database at `path` and run migrations.
    ///
    /// # Errors
    ///
    /// Returns a `FILE_SYSTEM` error when the parent directory cannot be
    /// created, or a database error on open/migrate failure.
    pub fn open(path: &Path) -> strand_error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    /// Open an in-memory database (tests).
    ///
    /// # Errors
    ///
    /// Returns a database error on open/migrate failure.
    pub fn open_in_memory() -> strand_error::Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> strand_error::Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS threads (
                thread_id        TEXT PRIMARY KEY,
                parent_thread_id TEXT,
                directive_id     TEXT NOT NULL,
                status           TEXT NOT NULL,
                suspend_reason   TEXT,
                depth            INTEGER NOT NULL,
                spawns           INTEGER NOT NULL DEFAULT 0,
                result           TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS budgets (
                thread_id        TEXT PRIMARY KEY,
                parent_thread_id TEXT,
                reserved_spend   REAL NOT NULL DEFAULT 0,
                actual_spend     REAL NOT NULL DEFAULT 0,
                max_spend        REAL,
                status           TEXT NOT NULL DEFAULT 'active',
                updated_at       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_budgets_parent
                ON budgets(parent_thread_id);
            CREATE INDEX IF NOT EXISTS idx_threads_parent
                ON threads(parent_thread_id);",
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("ledger connection poisoned")
    }

    // -- thread registry ----------------------------------------------------

    /// Register a thread with status `running`, disambiguating id
    /// collisions with a `-{n}` suffix. Returns the id actually stored.
    ///
    /// # Errors
    ///
    /// Returns a database error on insert failure other than collision.
    pub fn register_thread(
        &self,
        candidate: &ThreadId,
        parent: Option<&ThreadId>,
        directive: &ItemId,
        depth: u32,
    ) -> strand_error::Result<ThreadId> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let now = Utc::now().to_rfc3339();

        let mut id = candidate.clone();
        for n in 1..u32::MAX {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO threads
                     (thread_id, parent_thread_id, directive_id, status, depth,
                      created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'running', ?4, ?5, ?5)",
                    params![
                        id.as_str(),
                        parent.map(ThreadId::as_str),
                        directive.as_str(),
                        depth,
                        now,
                    ],
                )
                .map_err(db_err)?;
            if inserted == 1 {
                break;
            }
            id = candidate.with_disambiguator(n);
        }
        tx.commit().map_err(db_err)?;
        Ok(id)
    }

    /// Transition a thread's status (and optionally its result text).
    ///
    /// # Errors
    ///
    /// `THREAD_NOT_FOUND` when the id is unknown.
    pub fn update_status(
        &self,
        thread_id: &ThreadId,
        status: ThreadStatus,
        suspend_reason: Option<SuspendReason>,
        result: Option<&str>,
    ) -> strand_error::Result<()> {
        let changed = self
            .lock()
            .execute(
                "UPDATE threads
                 SET status = ?2, suspend_reason = ?3, result = COALESCE(?4, result),
                     updated_at = ?5
                 WHERE thread_id = ?1",
                params![
                    thread_id.as_str(),
                    status.to_string(),
                    suspend_reason.map(|r| r.to_string()),
                    result,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(StrandError::new(
                ErrorCode::ThreadNotFound,
                format!("thread {thread_id} is not registered"),
            ));
        }
        Ok(())
    }

    /// Fetch a registry row.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn get_thread(&self, thread_id: &ThreadId) -> strand_error::Result<Option<ThreadRow>> {
        self.lock()
            .query_row(
                "SELECT thread_id, parent_thread_id, directive_id, status,
                        suspend_reason, depth, spawns, result
                 FROM threads WHERE thread_id = ?1",
                params![thread_id.as_str()],
                |row| {
                    Ok(ThreadRow {
                        thread_id: ThreadId::from_raw(row.get::<_, String>(0)?),
                        parent_thread_id: row
                            .get::<_, Option<String>>(1)?
                            .map(ThreadId::from_raw),
                        directive_id: ItemId::new(row.get::<_, String>(2)?)
                            .unwrap_or_else(|_| ItemId::new("unknown").expect("static id")),
                        status: parse_status(&row.get::<_, String>(3)?),
                        suspend_reason: row
                            .get::<_, Option<String>>(4)?
                            .as_deref()
                            .and_then(parse_suspend_reason),
                        depth: row.get(5)?,
                        spawns: row.get(6)?,
                        result: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)
    }

    /// Atomically check the parent's spawn cap and increment its count.
    ///
    /// # Errors
    ///
    /// `SPAWN_COUNT_EXCEEDED` when the parent is at `max_spawns`;
    /// `THREAD_NOT_FOUND` for an unknown parent.
    pub fn increment_spawns(
        &self,
        parent: &ThreadId,
        max_spawns: Option<u32>,
    ) -> strand_error::Result<u32> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let spawns: u32 = tx
            .query_row(
                "SELECT spawns FROM threads WHERE thread_id = ?1",
                params![parent.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| {
                StrandError::new(
                    ErrorCode::ThreadNotFound,
                    format!("parent thread {parent} is not registered"),
                )
            })?;
        if let Some(max) = max_spawns
            && spawns >= max
        {
            return Err(StrandError::new(
                ErrorCode::SpawnCountExceeded,
                format!("thread {parent} already spawned {spawns} of {max} children"),
            )
            .with_detail("spawns", spawns)
            .with_detail("max_spawns", max));
        }
        tx.execute(
            "UPDATE threads SET spawns = spawns + 1, updated_at = ?2 WHERE thread_id = ?1",
            params![parent.as_str(), Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(spawns + 1)
    }

    // -- budget ledger ------------------------------------------------------

    /// Register a budget row for a root thread. `max_spend = None` means
    /// unconstrained.
    ///
    /// # Errors
    ///
    /// Returns a database error on insert failure.
    pub fn register_budget(
        &self,
        thread_id: &ThreadId,
        max_spend: Option<f64>,
    ) -> strand_error::Result<()> {
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO budgets
                 (thread_id, parent_thread_id, reserved_spend, actual_spend,
                  max_spend, status, updated_at)
                 VALUES (?1, NULL, 0, 0, ?2, 'active', ?3)",
                params![thread_id.as_str(), max_spend, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Reserve `amount` of the parent's remaining budget for a child.
    ///
    /// Atomic read-check-insert: at most one of two racing siblings whose
    /// combined reservations would exceed the parent's remainder wins.
    /// Returns `false` when the remainder is insufficient.
    ///
    /// # Errors
    ///
    /// `THREAD_NOT_FOUND` for an unknown parent; database errors
    /// otherwise.
    pub fn reserve(
        &self,
        parent: &ThreadId,
        child: &ThreadId,
        amount: f64,
        child_max_spend: f64,
    ) -> strand_error::Result<bool> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let parent_row: Option<(f64, Option<f64>)> = tx
            .query_row(
                "SELECT actual_spend, max_spend FROM budgets WHERE thread_id = ?1",
                params![parent.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        let Some((parent_actual, parent_max)) = parent_row else {
            return Err(StrandError::new(
                ErrorCode::ThreadNotFound,
                format!("no budget row for parent thread {parent}"),
            ));
        };

        if let Some(max) = parent_max {
            let committed: f64 = tx
                .query_row(
                    "SELECT COALESCE(SUM(CASE WHEN status = 'active'
                                              THEN reserved_spend
                                              ELSE actual_spend END), 0)
                     FROM budgets WHERE parent_thread_id = ?1",
                    params![parent.as_str()],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            let remaining = max - parent_actual - committed;
            if amount > remaining {
                tracing::debug!(
                    target: "strand.ledger",
                    parent = %parent,
                    child = %child,
                    amount,
                    remaining,
                    "reservation refused"
                );
                return Ok(false);
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO budgets
             (thread_id, parent_thread_id, reserved_spend, actual_spend,
              max_spend, status, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, 'active', ?5)",
            params![
                child.as_str(),
                parent.as_str(),
                amount,
                child_max_spend,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(true)
    }

    /// Settle a thread: fold the settled spend of its completed children
    /// into its own direct spend, clamp to the reservation (child
    /// threads only), release the reservation, and mark the row
    /// completed. A fully settled tree therefore reports its total spend
    /// at the root.
    ///
    /// # Errors
    ///
    /// `THREAD_NOT_FOUND` for a thread with no budget row.
    pub fn report_actual(
        &self,
        thread_id: &ThreadId,
        own_spend: f64,
    ) -> strand_error::Result<f64> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let row: Option<(f64, Option<String>)> = tx
            .query_row(
                "SELECT reserved_spend, parent_thread_id FROM budgets WHERE thread_id = ?1",
                params![thread_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        let Some((reserved, parent)) = row else {
            return Err(StrandError::new(
                ErrorCode::ThreadNotFound,
                format!("no budget row for thread {thread_id}"),
            ));
        };

        let children_actual: f64 = tx
            .query_row(
                "SELECT COALESCE(SUM(actual_spend), 0) FROM budgets
                 WHERE parent_thread_id = ?1 AND status = 'completed'",
                params![thread_id.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        let total = own_spend + children_actual;

        // Children can never overrun their reservation; roots have none.
        let settled = if parent.is_some() {
            total.min(reserved)
        } else {
            total
        };

        tx.execute(
            "UPDATE budgets
             SET actual_spend = ?2, reserved_spend = 0, status = 'completed',
                 updated_at = ?3
             WHERE thread_id = ?1",
            params![thread_id.as_str(), settled, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(settled)
    }

    /// Snapshot of a thread's remaining budget. `None` means
    /// unconstrained.
    ///
    /// # Errors
    ///
    /// `THREAD_NOT_FOUND` for a thread with no budget row.
    pub fn check_remaining(&self, thread_id: &ThreadId) -> strand_error::Result<Option<f64>> {
        let conn = self.lock();
        let row: Option<(f64, Option<f64>)> = conn
            .query_row(
                "SELECT actual_spend, max_spend FROM budgets WHERE thread_id = ?1",
                params![thread_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        let Some((actual, max)) = row else {
            return Err(StrandError::new(
                ErrorCode::ThreadNotFound,
                format!("no budget row for thread {thread_id}"),
            ));
        };
        let Some(max) = max else {
            return Ok(None);
        };
        let committed: f64 = conn
            .query_row(
                "SELECT COALESCE(SUM(CASE WHEN status = 'active'
                                          THEN reserved_spend
                                          ELSE actual_spend END), 0)
                 FROM budgets WHERE parent_thread_id = ?1",
                params![thread_id.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(Some((max - actual - committed).max(0.0)))
    }

    /// Fetch a budget row.
    ///
    /// # Errors
    ///
    /// Returns a database error on query failure.
    pub fn get_budget(&self, thread_id: &ThreadId) -> strand_error::Result<Option<BudgetRow>> {
        self.lock()
            .query_row(
                "SELECT thread_id, parent_thread_id, reserved_spend, actual_spend,
                        max_spend, status
                 FROM budgets WHERE thread_id = ?1",
                params![thread_id.as_str()],
                |row| {
                    Ok(BudgetRow {
                        thread_id: ThreadId::from_raw(row.get::<_, String>(0)?),
                        parent_thread_id: row
                            .get::<_, Option<String>>(1)?
                            .map(ThreadId::from_raw),
                        reserved_spend: row.get(2)?,
                        actual_spend: row.get(3)?,
                        max_spend: row.get(4)?,
                        completed: row.get::<_, String>(5)? == "completed",
                    })
                },
            )
            .optional()
            .map_err(db_err)
    }

    /// Touch a thread's `updated_at` as a liveness heartbeat. Cost detail
    /// lives in the state snapshot file, not the registry row.
    ///
    /// # Errors
    ///
    /// Returns a database error on update failure.
    pub fn heartbeat(&self, thread_id: &ThreadId) -> strand_error::Result<()> {
        self.lock()
            .execute(
                "UPDATE threads SET updated_at = ?2 WHERE thread_id = ?1",
                params![thread_id.as_str(), Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        Ok(())
    }
}

fn parse_status(s: &str) -> ThreadStatus {
    match s {
        "completed" => ThreadStatus::Completed,
        "error" => ThreadStatus::Error,
        "suspended" => ThreadStatus::Suspended,
        "cancelled" => ThreadStatus::Cancelled,
        _ => ThreadStatus::Running,
    }
}

fn parse_suspend_reason(s: &str) -> Option<SuspendReason> {
    match s {
        "limit" => Some(SuspendReason::Limit),
        "error" => Some(SuspendReason::Error),
        "budget" => Some(SuspendReason::Budget),
        _ => None,
    }
}
