//! SQLite-backed persistence for tasks, enrollments, contacts and leases.
//! Autopilot decisions share the same database; see [`crate::decision_log`].
//!
//! The claim (`pending → processing`) is a single conditional UPDATE, which
//! SQLite executes atomically even across connections to the same file.
//! Every later transition is guarded by `status = 'processing'` so terminal
//! rows are never touched again.

use chrono::{DateTime, TimeZone, Utc};
use leadpulse_core::error::{LeadPulseError, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::enrollment::{Contact, Enrollment, EnrollmentStatus};
use crate::tasks::{CancelOutcome, NewTask, ScheduledTask, TaskStatus};

pub(crate) fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub(crate) fn store_err(ctx: &str) -> impl Fn(rusqlite::Error) -> LeadPulseError + '_ {
    move |e| LeadPulseError::Store(format!("{ctx}: {e}"))
}

/// Shared SELECT column list for task queries.
const TASK_SELECT: &str = "SELECT id, owner_id, task_type, payload, status, scheduled_for, claimed_at, executed_at, error, output, retry_count, max_retries, cancel_requested, dedupe_key, created_by, created_at, updated_at FROM scheduled_tasks";

/// Map a database row to a ScheduledTask.
fn row_to_task(row: &Row) -> rusqlite::Result<ScheduledTask> {
    let task_type: String = row.get(2)?;
    let payload: String = row.get(3)?;
    let status: String = row.get(4)?;
    let output: Option<String> = row.get(9)?;
    Ok(ScheduledTask {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        task_type: task_type.parse().map_err(|e| conversion_err(2, e))?,
        payload: serde_json::from_str(&payload).unwrap_or_default(),
        status: status.parse().map_err(|e| conversion_err(4, e))?,
        scheduled_for: from_ms(row.get(5)?),
        claimed_at: row.get::<_, Option<i64>>(6)?.map(from_ms),
        executed_at: row.get::<_, Option<i64>>(7)?.map(from_ms),
        error: row.get(8)?,
        output: output.and_then(|s| serde_json::from_str(&s).ok()),
        retry_count: row.get(10)?,
        max_retries: row.get(11)?,
        cancel_requested: row.get::<_, i32>(12)? != 0,
        dedupe_key: row.get(13)?,
        created_by: row.get(14)?,
        created_at: from_ms(row.get(15)?),
        updated_at: from_ms(row.get(16)?),
    })
}

fn conversion_err(idx: usize, e: LeadPulseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

const ENROLLMENT_SELECT: &str = "SELECT id, contact_id, campaign_name, current_step, status, enrolled_at, responded_at, updated_at FROM enrollments";

fn row_to_enrollment(row: &Row) -> rusqlite::Result<Enrollment> {
    let status: String = row.get(4)?;
    Ok(Enrollment {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        campaign_name: row.get(2)?,
        current_step: row.get(3)?,
        status: status.parse().map_err(|e| conversion_err(4, e))?,
        enrolled_at: from_ms(row.get(5)?),
        responded_at: row.get::<_, Option<i64>>(6)?.map(from_ms),
        step_sent_at: BTreeMap::new(),
        updated_at: from_ms(row.get(7)?),
    })
}

fn row_to_contact(row: &Row) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        email: row.get(2)?,
        first_name: row.get(3)?,
        lead_score: row.get(4)?,
        created_at: from_ms(row.get(5)?),
    })
}

/// Per-status task totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// SQLite-backed persistence store for all scheduler data.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(store_err("DB open"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(store_err("DB pragmas"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Private in-memory database, used by tests and `decide --dry`.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err("DB open"))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(store_err("DB pragmas"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            -- Units of work
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,   -- FIFO tie-break
                id TEXT NOT NULL UNIQUE,
                owner_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                payload TEXT NOT NULL,                   -- JSON
                status TEXT NOT NULL DEFAULT 'pending',
                scheduled_for INTEGER NOT NULL,          -- unix ms
                claimed_at INTEGER,
                executed_at INTEGER,
                error TEXT,
                output TEXT,                             -- JSON
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                dedupe_key TEXT UNIQUE,
                created_by TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_due
                ON scheduled_tasks(status, scheduled_for, seq);

            -- CRM contacts (recipients + lead score)
            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                email TEXT NOT NULL,
                first_name TEXT,
                lead_score INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            -- One row per applied score change, keyed by task id
            CREATE TABLE IF NOT EXISTS lead_score_ledger (
                idempotency_key TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL,
                delta INTEGER NOT NULL,
                applied_at INTEGER NOT NULL
            );

            -- Drip participants
            CREATE TABLE IF NOT EXISTS enrollments (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL,
                campaign_name TEXT NOT NULL,
                current_step INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                enrolled_at INTEGER NOT NULL,
                responded_at INTEGER,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_enrollments_status ON enrollments(status);

            -- Step send times; the primary key makes each write happen once
            CREATE TABLE IF NOT EXISTS enrollment_steps (
                enrollment_id TEXT NOT NULL,
                step INTEGER NOT NULL,
                sent_at INTEGER NOT NULL,
                PRIMARY KEY (enrollment_id, step),
                FOREIGN KEY (enrollment_id) REFERENCES enrollments(id) ON DELETE CASCADE
            );

            -- Advisory leases (single active dispatcher)
            CREATE TABLE IF NOT EXISTS scheduler_leases (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            -- Autopilot decisions and their approval/execution state
            CREATE TABLE IF NOT EXISTS decisions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                decision_type TEXT NOT NULL,
                rule TEXT NOT NULL,
                fingerprint TEXT NOT NULL,               -- type + canonical action
                reasoning TEXT NOT NULL,
                action TEXT NOT NULL,                    -- JSON
                confidence REAL NOT NULL,
                status TEXT NOT NULL,
                execution_ref TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_status ON decisions(status, seq);
            CREATE INDEX IF NOT EXISTS idx_decisions_fingerprint ON decisions(fingerprint, seq);

            -- Learned confidence offset per decision type
            CREATE TABLE IF NOT EXISTS decision_calibration (
                decision_type TEXT PRIMARY KEY,
                adjustment REAL NOT NULL
            );
         ",
            )
            .map_err(store_err("Migration"))?;
        Ok(())
    }

    // ─── Tasks ──────────────────────────────────────────────

    /// Insert a new pending task. Returns `None` when another task already
    /// holds the same dedupe key.
    pub fn insert_task(&self, new: &NewTask, now: DateTime<Utc>) -> Result<Option<ScheduledTask>> {
        let id = uuid::Uuid::new_v4().to_string();
        let changed = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO scheduled_tasks
                 (id, owner_id, task_type, payload, status, scheduled_for, retry_count, max_retries,
                  dedupe_key, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 0, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id,
                    new.owner_id,
                    new.task_type.as_str(),
                    new.payload.to_string(),
                    to_ms(new.scheduled_for),
                    new.max_retries,
                    new.dedupe_key,
                    new.created_by,
                    to_ms(now),
                ],
            )
            .map_err(store_err("Insert task"))?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_task(&id)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        self.conn()
            .query_row(&format!("{TASK_SELECT} WHERE id = ?1"), [id], row_to_task)
            .optional()
            .map_err(store_err("Get task"))
    }

    pub fn task_by_dedupe_key(&self, key: &str) -> Result<Option<ScheduledTask>> {
        self.conn()
            .query_row(&format!("{TASK_SELECT} WHERE dedupe_key = ?1"), [key], row_to_task)
            .optional()
            .map_err(store_err("Get task by key"))
    }

    /// Pending tasks whose time has come: oldest `scheduled_for` first,
    /// insertion order on ties.
    pub fn due_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "{TASK_SELECT} WHERE status = 'pending' AND scheduled_for <= ?1
                 ORDER BY scheduled_for ASC, seq ASC LIMIT ?2"
            ))
            .map_err(store_err("Due tasks"))?;
        let rows = stmt
            .query_map(params![to_ms(now), limit as i64], row_to_task)
            .map_err(store_err("Due tasks"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("Due tasks"))
    }

    /// Atomically move a task from `pending` to `processing`.
    /// Returns false if someone else got there first (or it is no longer pending).
    pub fn claim_task(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE scheduled_tasks SET status = 'processing', claimed_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![to_ms(now), id],
            )
            .map_err(store_err("Claim task"))?;
        Ok(changed == 1)
    }

    pub fn complete_task(
        &self,
        id: &str,
        executed_at: DateTime<Utc>,
        output: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE scheduled_tasks
                 SET status = 'completed', executed_at = ?1, output = ?2, claimed_at = NULL, updated_at = ?1
                 WHERE id = ?3 AND status = 'processing'",
                params![to_ms(executed_at), output.map(|v| v.to_string()), id],
            )
            .map_err(store_err("Complete task"))?;
        Ok(changed == 1)
    }

    /// Put a failed attempt back in the queue.
    pub fn retry_task(
        &self,
        id: &str,
        retry_count: u32,
        scheduled_for: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE scheduled_tasks
                 SET status = 'pending', retry_count = ?1, scheduled_for = ?2, error = ?3,
                     claimed_at = NULL, updated_at = ?4
                 WHERE id = ?5 AND status = 'processing' AND ?1 <= max_retries",
                params![retry_count, to_ms(scheduled_for), error, to_ms(now), id],
            )
            .map_err(store_err("Retry task"))?;
        Ok(changed == 1)
    }

    /// Terminal failure (`failed` or `cancelled`) of a processing task.
    pub fn finish_task(&self, id: &str, status: TaskStatus, error: &str, now: DateTime<Utc>) -> Result<bool> {
        if !matches!(status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(LeadPulseError::InvalidState(format!(
                "finish_task cannot set status '{status}'"
            )));
        }
        let changed = self
            .conn()
            .execute(
                "UPDATE scheduled_tasks SET status = ?1, error = ?2, claimed_at = NULL, updated_at = ?3
                 WHERE id = ?4 AND status = 'processing'",
                params![status.as_str(), error, to_ms(now), id],
            )
            .map_err(store_err("Finish task"))?;
        Ok(changed == 1)
    }

    /// External cancel. Pending → cancelled; processing → flagged.
    pub fn cancel_task(&self, id: &str, now: DateTime<Utc>) -> Result<CancelOutcome> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE scheduled_tasks SET status = 'cancelled', updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![to_ms(now), id],
            )
            .map_err(store_err("Cancel task"))?;
        if changed == 1 {
            return Ok(CancelOutcome::Cancelled);
        }
        let flagged = conn
            .execute(
                "UPDATE scheduled_tasks SET cancel_requested = 1, updated_at = ?1
                 WHERE id = ?2 AND status = 'processing'",
                params![to_ms(now), id],
            )
            .map_err(store_err("Cancel task"))?;
        if flagged == 1 {
            return Ok(CancelOutcome::CancelRequested);
        }
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM scheduled_tasks WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err("Cancel task"))?;
        match status {
            Some(s) => Ok(CancelOutcome::AlreadyFinished(s.parse()?)),
            None => Err(LeadPulseError::NotFound(format!("task {id}"))),
        }
    }

    /// Cancel every pending task whose dedupe key starts with `prefix`.
    pub fn cancel_pending_with_prefix(&self, prefix: &str, now: DateTime<Utc>) -> Result<usize> {
        self.conn()
            .execute(
                "UPDATE scheduled_tasks SET status = 'cancelled', updated_at = ?1
                 WHERE status = 'pending' AND dedupe_key LIKE ?2 || '%'",
                params![to_ms(now), prefix],
            )
            .map_err(store_err("Cancel by prefix"))
    }

    /// Tasks stuck in `processing` since before `claimed_before`.
    pub fn stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "{TASK_SELECT} WHERE status = 'processing' AND claimed_at < ?1 ORDER BY seq"
            ))
            .map_err(store_err("Stale claims"))?;
        let rows = stmt
            .query_map([to_ms(claimed_before)], row_to_task)
            .map_err(store_err("Stale claims"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("Stale claims"))
    }

    // ─── Inspection queries ─────────────────────────────────

    /// Pending tasks with `scheduled_for` in `[from, to]`.
    pub fn count_pending_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<usize> {
        let n: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM scheduled_tasks
                 WHERE status = 'pending' AND scheduled_for >= ?1 AND scheduled_for <= ?2",
                params![to_ms(from), to_ms(to)],
                |row| row.get(0),
            )
            .map_err(store_err("Count pending"))?;
        Ok(n as usize)
    }

    /// Most recent `failed` tasks.
    pub fn failed_tasks(&self, limit: usize) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "{TASK_SELECT} WHERE status = 'failed' ORDER BY updated_at DESC, seq DESC LIMIT ?1"
            ))
            .map_err(store_err("Failed tasks"))?;
        let rows = stmt
            .query_map([limit as i64], row_to_task)
            .map_err(store_err("Failed tasks"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("Failed tasks"))
    }

    /// Failed tasks whose last error starts with `prefix`.
    pub fn failed_tasks_with_error(&self, prefix: &str, limit: usize) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "{TASK_SELECT} WHERE status = 'failed' AND error LIKE ?1 || '%'
                 ORDER BY updated_at DESC, seq DESC LIMIT ?2"
            ))
            .map_err(store_err("Failed tasks"))?;
        let rows = stmt
            .query_map(params![prefix, limit as i64], row_to_task)
            .map_err(store_err("Failed tasks"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("Failed tasks"))
    }

    pub fn status_counts(&self) -> Result<StatusCounts> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM scheduled_tasks GROUP BY status")
            .map_err(store_err("Status counts"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(store_err("Status counts"))?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row.map_err(store_err("Status counts"))?;
            let n = n as usize;
            match status.parse::<TaskStatus>()? {
                TaskStatus::Pending => counts.pending = n,
                TaskStatus::Processing => counts.processing = n,
                TaskStatus::Completed => counts.completed = n,
                TaskStatus::Failed => counts.failed = n,
                TaskStatus::Cancelled => counts.cancelled = n,
            }
        }
        Ok(counts)
    }

    // ─── Contacts ───────────────────────────────────────────

    pub fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO contacts (id, owner_id, email, first_name, lead_score, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET owner_id = ?2, email = ?3, first_name = ?4",
                params![
                    contact.id,
                    contact.owner_id,
                    contact.email,
                    contact.first_name,
                    contact.lead_score,
                    to_ms(contact.created_at),
                ],
            )
            .map_err(store_err("Upsert contact"))?;
        Ok(())
    }

    pub fn get_contact(&self, id: &str) -> Result<Option<Contact>> {
        self.conn()
            .query_row(
                "SELECT id, owner_id, email, first_name, lead_score, created_at FROM contacts WHERE id = ?1",
                [id],
                row_to_contact,
            )
            .optional()
            .map_err(store_err("Get contact"))
    }

    /// Apply `delta` to a contact's score once per `idempotency_key`.
    /// Returns the score after the call (unchanged on a replay).
    pub fn apply_lead_score(
        &self,
        contact_id: &str,
        delta: i64,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(store_err("Lead score"))?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT lead_score FROM contacts WHERE id = ?1",
                [contact_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err("Lead score"))?;
        if exists.is_none() {
            return Err(LeadPulseError::NotFound(format!("contact {contact_id}")));
        }
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO lead_score_ledger (idempotency_key, contact_id, delta, applied_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![idempotency_key, contact_id, delta, to_ms(now)],
            )
            .map_err(store_err("Lead score"))?;
        if inserted == 1 {
            tx.execute(
                "UPDATE contacts SET lead_score = lead_score + ?1 WHERE id = ?2",
                params![delta, contact_id],
            )
            .map_err(store_err("Lead score"))?;
        }
        let score: i64 = tx
            .query_row(
                "SELECT lead_score FROM contacts WHERE id = ?1",
                [contact_id],
                |row| row.get(0),
            )
            .map_err(store_err("Lead score"))?;
        tx.commit().map_err(store_err("Lead score"))?;
        Ok(score)
    }

    // ─── Enrollments ────────────────────────────────────────

    pub fn insert_enrollment(
        &self,
        contact_id: &str,
        campaign_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Enrollment> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO enrollments (id, contact_id, campaign_name, current_step, status, enrolled_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, 'active', ?4, ?4)",
                params![id, contact_id, campaign_name, to_ms(now)],
            )
            .map_err(store_err("Insert enrollment"))?;
        self.get_enrollment(&id)?
            .ok_or_else(|| LeadPulseError::Store(format!("enrollment {id} vanished after insert")))
    }

    /// Whether the contact already has an active enrollment in the campaign.
    pub fn has_active_enrollment(&self, contact_id: &str, campaign_name: &str) -> Result<bool> {
        let n: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM enrollments
                 WHERE contact_id = ?1 AND campaign_name = ?2 AND status = 'active'",
                params![contact_id, campaign_name],
                |row| row.get(0),
            )
            .map_err(store_err("Enrollment lookup"))?;
        Ok(n > 0)
    }

    pub fn get_enrollment(&self, id: &str) -> Result<Option<Enrollment>> {
        let conn = self.conn();
        let enrollment = conn
            .query_row(
                &format!("{ENROLLMENT_SELECT} WHERE id = ?1"),
                [id],
                row_to_enrollment,
            )
            .optional()
            .map_err(store_err("Get enrollment"))?;
        match enrollment {
            Some(mut e) => {
                e.step_sent_at = load_steps(&conn, &e.id)?;
                Ok(Some(e))
            }
            None => Ok(None),
        }
    }

    /// Enrollments, optionally filtered by status, with their step times.
    pub fn enrollments(&self, status: Option<EnrollmentStatus>) -> Result<Vec<Enrollment>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "{ENROLLMENT_SELECT} WHERE (?1 IS NULL OR status = ?1) ORDER BY enrolled_at, id"
            ))
            .map_err(store_err("List enrollments"))?;
        let rows = stmt
            .query_map([status.map(|s| s.as_str())], row_to_enrollment)
            .map_err(store_err("List enrollments"))?;
        let mut list = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err("List enrollments"))?;
        for e in list.iter_mut() {
            e.step_sent_at = load_steps(&conn, &e.id)?;
        }
        Ok(list)
    }

    /// Record that `step` was sent. Only succeeds if the enrollment is still
    /// active, unresponded and sitting on `step - 1`.
    pub fn record_step_sent(
        &self,
        enrollment_id: &str,
        step: u32,
        sent_at: DateTime<Utc>,
        is_final: bool,
    ) -> Result<bool> {
        if step == 0 {
            return Err(LeadPulseError::Validation("steps are numbered from 1".into()));
        }
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(store_err("Record step"))?;
        let changed = tx
            .execute(
                "UPDATE enrollments
                 SET current_step = ?1,
                     status = CASE WHEN ?2 THEN 'completed' ELSE status END,
                     updated_at = ?3
                 WHERE id = ?4 AND current_step = ?5 AND status = 'active' AND responded_at IS NULL",
                params![step, is_final, to_ms(sent_at), enrollment_id, step - 1],
            )
            .map_err(store_err("Record step"))?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO enrollment_steps (enrollment_id, step, sent_at) VALUES (?1, ?2, ?3)",
            params![enrollment_id, step, to_ms(sent_at)],
        )
        .map_err(store_err("Record step"))?;
        tx.commit().map_err(store_err("Record step"))?;
        Ok(true)
    }

    /// Set `responded_at` if it is not set yet. Returns true on first write.
    pub fn record_response(&self, enrollment_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE enrollments SET responded_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND responded_at IS NULL",
                params![to_ms(at), enrollment_id],
            )
            .map_err(store_err("Record response"))?;
        Ok(changed == 1)
    }

    /// Active → cancelled. Returns false if the enrollment was not active.
    pub fn cancel_enrollment(&self, enrollment_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "UPDATE enrollments SET status = 'cancelled', updated_at = ?1
                 WHERE id = ?2 AND status = 'active'",
                params![to_ms(now), enrollment_id],
            )
            .map_err(store_err("Cancel enrollment"))?;
        Ok(changed == 1)
    }

    // ─── Leases ─────────────────────────────────────────────

    /// Take or renew the named lease. Returns false while another holder's
    /// lease is unexpired.
    pub fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<bool> {
        let changed = self
            .conn()
            .execute(
                "INSERT INTO scheduler_leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET holder = ?2, expires_at = ?3
                 WHERE scheduler_leases.holder = ?2 OR scheduler_leases.expires_at <= ?4",
                params![name, holder, to_ms(now + ttl), to_ms(now)],
            )
            .map_err(store_err("Acquire lease"))?;
        Ok(changed == 1)
    }

    pub fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM scheduler_leases WHERE name = ?1 AND holder = ?2",
                params![name, holder],
            )
            .map_err(store_err("Release lease"))?;
        Ok(())
    }
}

fn load_steps(conn: &Connection, enrollment_id: &str) -> Result<BTreeMap<u32, DateTime<Utc>>> {
    let mut stmt = conn
        .prepare("SELECT step, sent_at FROM enrollment_steps WHERE enrollment_id = ?1 ORDER BY step")
        .map_err(store_err("Load steps"))?;
    let rows = stmt
        .query_map([enrollment_id], |row| {
            Ok((row.get::<_, u32>(0)?, from_ms(row.get(1)?)))
        })
        .map_err(store_err("Load steps"))?;
    rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()
        .map_err(store_err("Load steps"))
}
