//! SQLite-backed sequence store: leads, sequences, queued messages and the
//! shared rate-limit windows.
//!
//! This is the only source of truth across restarts and across worker
//! processes. Every cross-worker decision (claiming an item, counting a send
//! against a domain window, enrolling a lead) is a single conditional
//! statement or an immediate transaction, so several processes may open the
//! same database file at once.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::DeliveryReceipt;
use leadflow_core::types::{Lead, LeadStatus, QueueItem, Sequence};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::Serialize;

use crate::planner::{Enrollment, EnrollmentPlan};
use crate::render::Recipient;

const QUEUE_COLUMNS: &str = "q.id, q.lead_id, q.sequence_id, q.template_id, q.position, q.scheduled_at, \
     q.context, q.sent, q.sent_at, q.error_message, q.retry_count, q.next_attempt_at, \
     q.claimed_at, q.claimed_by, q.failed_at, q.provider, q.provider_message_id";

const SEQUENCE_COLUMNS: &str = "id, lead_id, status_at_enrollment, current_message_number, total_messages, \
     next_send_at, is_completed, is_paused, is_unsubscribed, created_at, updated_at";

const LEAD_COLUMNS: &str = "id, email, name, company, job_title, company_size, score, status, \
     feedback_score, budget_range, timeline_days, call_scheduled, messaging_channel, \
     unsubscribed_at, created_at, updated_at";

/// A queue item that is due, joined with what is needed to render it.
#[derive(Debug, Clone)]
pub struct DueItem {
    pub item: QueueItem,
    pub recipient: Recipient,
}

/// What an unsubscribe touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnsubscribeReport {
    pub sequences_frozen: usize,
    pub messages_purged: usize,
}

/// Snapshot of a rate-limit window after counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

/// Queue counters for health output.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub active_sequences: u64,
}

/// SQLite-backed persistence for the engagement engine.
pub struct SequenceStore {
    conn: Mutex<Connection>,
}

impl SequenceStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| LeadflowError::persistence(format!("DB open {}: {e}", path.display())))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database. Not shareable between handles.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // Concurrent readers alongside one writer; writers wait instead of failing.
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.busy_timeout(StdDuration::from_secs(5)).map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LeadflowError::persistence(format!("connection lock poisoned: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                name TEXT,
                company TEXT,
                job_title TEXT,
                company_size INTEGER,
                score INTEGER NOT NULL DEFAULT 50,
                status TEXT NOT NULL DEFAULT 'cold',
                feedback_score INTEGER,
                budget_range TEXT,
                timeline_days INTEGER,
                call_scheduled INTEGER NOT NULL DEFAULT 0,
                messaging_channel INTEGER NOT NULL DEFAULT 0,
                unsubscribed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_leads_email ON leads(email);

            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL REFERENCES leads(id),
                status_at_enrollment TEXT NOT NULL,
                current_message_number INTEGER NOT NULL DEFAULT 0,
                total_messages INTEGER NOT NULL,
                next_send_at TEXT,
                is_completed INTEGER NOT NULL DEFAULT 0,
                is_paused INTEGER NOT NULL DEFAULT 0,
                is_unsubscribed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- At most one sequence per lead may be neither completed nor unsubscribed.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sequences_one_active
                ON sequences(lead_id) WHERE is_completed = 0 AND is_unsubscribed = 0;

            CREATE TABLE IF NOT EXISTS queue_items (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL,
                sequence_id TEXT NOT NULL REFERENCES sequences(id),
                template_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                scheduled_at TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '{}',
                sent INTEGER NOT NULL DEFAULT 0,
                sent_at TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT,
                claimed_at TEXT,
                claimed_by TEXT,
                failed_at TEXT,
                provider TEXT,
                provider_message_id TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_queue_items_due
                ON queue_items(sent, scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_queue_items_lead
                ON queue_items(lead_id);

            -- Fixed windows shared by every dispatch worker.
            CREATE TABLE IF NOT EXISTS rate_limits (
                key TEXT PRIMARY KEY,
                count INTEGER NOT NULL,
                reset_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| LeadflowError::persistence(format!("Migration: {e}")))?;

        // Columns added after the first release.
        add_column_if_missing(&conn, "queue_items", "provider", "TEXT")?;
        add_column_if_missing(&conn, "queue_items", "provider_message_id", "TEXT")?;
        Ok(())
    }

    // ─── Leads ──────────────────────────────────────────────

    /// Insert or update a lead.
    pub fn upsert_lead(&self, lead: &Lead) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO leads (id, email, name, company, job_title, company_size, score, status,
                 feedback_score, budget_range, timeline_days, call_scheduled, messaging_channel,
                 unsubscribed_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(id) DO UPDATE SET
                 email = excluded.email, name = excluded.name, company = excluded.company,
                 job_title = excluded.job_title, company_size = excluded.company_size,
                 score = excluded.score, status = excluded.status,
                 feedback_score = excluded.feedback_score, budget_range = excluded.budget_range,
                 timeline_days = excluded.timeline_days, call_scheduled = excluded.call_scheduled,
                 messaging_channel = excluded.messaging_channel,
                 unsubscribed_at = COALESCE(leads.unsubscribed_at, excluded.unsubscribed_at),
                 updated_at = excluded.updated_at",
            params![
                lead.id,
                lead.email,
                lead.name,
                lead.company,
                lead.job_title,
                lead.company_size,
                lead.score,
                lead.status.as_str(),
                lead.feedback_score,
                lead.budget_range,
                lead.timeline_days,
                lead.call_scheduled,
                lead.messaging_channel,
                lead.unsubscribed_at.map(fmt_ts),
                fmt_ts(lead.created_at),
                fmt_ts(lead.updated_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn get_lead(&self, id: &str) -> Result<Option<Lead>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
            [id],
            map_lead,
        )
        .optional()
        .map_err(db_err)
    }

    /// Oldest lead registered under `email`.
    pub fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads WHERE email = ?1 ORDER BY created_at ASC LIMIT 1"
            ),
            [email.trim().to_ascii_lowercase()],
            map_lead,
        )
        .optional()
        .map_err(db_err)
    }

    // ─── Sequences ──────────────────────────────────────────

    pub fn get_sequence(&self, id: &str) -> Result<Option<Sequence>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {SEQUENCE_COLUMNS} FROM sequences WHERE id = ?1"),
            [id],
            map_sequence,
        )
        .optional()
        .map_err(db_err)
    }

    /// All sequences of a lead, newest first.
    pub fn sequences_for_lead(&self, lead_id: &str) -> Result<Vec<Sequence>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SEQUENCE_COLUMNS} FROM sequences WHERE lead_id = ?1 ORDER BY created_at DESC"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([lead_id], map_sequence).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Queue items of a sequence in catalog order.
    pub fn queue_items_for_sequence(&self, sequence_id: &str) -> Result<Vec<QueueItem>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {QUEUE_COLUMNS} FROM queue_items q WHERE q.sequence_id = ?1 ORDER BY q.position"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([sequence_id], map_queue_item).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Unsent queue items of a lead (pending or permanently failed).
    pub fn unsent_count_for_lead(&self, lead_id: &str) -> Result<u64> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM queue_items WHERE lead_id = ?1 AND sent = 0",
            [lead_id],
            |r| r.get(0),
        )
        .map_err(db_err)
    }

    /// Dedup check plus sequence and queue inserts in one immediate transaction:
    /// all rows of an enrollment land together or not at all.
    pub fn insert_enrollment(&self, plan: &EnrollmentPlan) -> Result<Enrollment> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let lead_unsubscribed: Option<bool> = tx
            .query_row(
                "SELECT unsubscribed_at IS NOT NULL
                    OR EXISTS (SELECT 1 FROM sequences WHERE lead_id = ?1 AND is_unsubscribed = 1)
                 FROM leads WHERE id = ?1",
                [&plan.lead_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match lead_unsubscribed {
            None => return Err(LeadflowError::not_found(format!("lead {}", plan.lead_id))),
            Some(true) => return Ok(Enrollment::Unsubscribed),
            Some(false) => {}
        }

        let active: Option<String> = tx
            .query_row(
                "SELECT id FROM sequences
                 WHERE lead_id = ?1 AND is_completed = 0 AND is_unsubscribed = 0
                 ORDER BY created_at DESC LIMIT 1",
                [&plan.lead_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if let Some(id) = active {
            return Ok(Enrollment::AlreadyActive(id));
        }

        let sequence_id = format!("seq-{}", uuid::Uuid::new_v4());
        let now = fmt_ts(plan.now);
        tx.execute(
            "INSERT INTO sequences (id, lead_id, status_at_enrollment, current_message_number,
                 total_messages, next_send_at, is_completed, is_paused, is_unsubscribed,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, 0, 0, 0, ?5, ?5)",
            params![
                sequence_id,
                plan.lead_id,
                plan.status.as_str(),
                plan.messages.len() as u32,
                now,
            ],
        )
        .map_err(db_err)?;

        let context = plan.context.to_string();
        {
            let mut insert = tx
                .prepare(
                    "INSERT INTO queue_items (id, lead_id, sequence_id, template_id, position,
                         scheduled_at, context, sent, retry_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0)",
                )
                .map_err(db_err)?;
            for message in &plan.messages {
                insert
                    .execute(params![
                        format!("msg-{}", uuid::Uuid::new_v4()),
                        plan.lead_id,
                        sequence_id,
                        message.template_id,
                        message.position,
                        fmt_ts(message.scheduled_at),
                        context,
                    ])
                    .map_err(db_err)?;
            }
        }

        tx.commit().map_err(db_err)?;
        Ok(Enrollment::Created(sequence_id))
    }

    /// Flip the pause flag. Unsubscribed sequences cannot be resumed.
    pub fn set_paused(&self, sequence_id: &str, paused: bool, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE sequences SET is_paused = ?2, updated_at = ?3
                 WHERE id = ?1 AND (?2 = 1 OR is_unsubscribed = 0)",
                params![sequence_id, paused, fmt_ts(now)],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Freeze every sequence of the lead and delete its unsent messages.
    /// Sent messages stay as an audit trail.
    pub fn unsubscribe_lead(&self, lead_id: &str, now: DateTime<Utc>) -> Result<UnsubscribeReport> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let now = fmt_ts(now);

        let sequences_frozen = tx
            .execute(
                "UPDATE sequences SET is_unsubscribed = 1, is_paused = 1, updated_at = ?2
                 WHERE lead_id = ?1",
                params![lead_id, now],
            )
            .map_err(db_err)?;
        let messages_purged = tx
            .execute(
                "DELETE FROM queue_items WHERE lead_id = ?1 AND sent = 0",
                [lead_id],
            )
            .map_err(db_err)?;
        tx.execute(
            "UPDATE leads SET unsubscribed_at = COALESCE(unsubscribed_at, ?2), updated_at = ?2
             WHERE id = ?1",
            params![lead_id, now],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(UnsubscribeReport {
            sequences_frozen,
            messages_purged,
        })
    }

    // ─── Dispatch ───────────────────────────────────────────

    /// Unsent, unfailed items whose time has come, from running sequences, that
    /// are next in line for their sequence. Oldest first.
    pub fn due_items(
        &self,
        now: DateTime<Utc>,
        stale_claim_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DueItem>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {QUEUE_COLUMNS}, l.email, l.name, l.company
                 FROM queue_items q
                 JOIN sequences s ON s.id = q.sequence_id
                 JOIN leads l ON l.id = q.lead_id
                 WHERE q.sent = 0 AND q.failed_at IS NULL
                   AND q.scheduled_at <= ?1
                   AND (q.next_attempt_at IS NULL OR q.next_attempt_at <= ?1)
                   AND (q.claimed_at IS NULL OR q.claimed_at <= ?2)
                   AND s.is_paused = 0 AND s.is_unsubscribed = 0 AND s.is_completed = 0
                   AND q.position = s.current_message_number + 1
                 ORDER BY q.scheduled_at ASC, q.position ASC
                 LIMIT ?3"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![fmt_ts(now), fmt_ts(stale_claim_before), limit],
                |row| {
                    Ok(DueItem {
                        item: map_queue_item(row)?,
                        recipient: Recipient {
                            email: row.get(17)?,
                            name: row.get(18)?,
                            company: row.get(19)?,
                        },
                    })
                },
            )
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Conditional claim. Exactly one concurrent caller gets `true`; a claim
    /// older than `stale_claim_before` counts as abandoned.
    pub fn claim(
        &self,
        item_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_claim_before: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE queue_items SET claimed_at = ?2, claimed_by = ?3
                 WHERE id = ?1 AND sent = 0 AND failed_at IS NULL
                   AND (claimed_at IS NULL OR claimed_at <= ?4)
                   AND EXISTS (SELECT 1 FROM sequences s
                               WHERE s.id = queue_items.sequence_id
                                 AND s.is_paused = 0 AND s.is_unsubscribed = 0)",
                params![item_id, fmt_ts(now), worker_id, fmt_ts(stale_claim_before)],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Give an item back untouched (rate-limited, or cycle aborted).
    pub fn release_claim(&self, item_id: &str, worker_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE queue_items SET claimed_at = NULL, claimed_by = NULL
             WHERE id = ?1 AND claimed_by = ?2 AND sent = 0",
            params![item_id, worker_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Give an item back and keep it out of the due set until `not_before`.
    /// Used for rate-limited items; `retry_count` is left alone.
    pub fn defer(&self, item_id: &str, worker_id: &str, not_before: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE queue_items SET claimed_at = NULL, claimed_by = NULL, next_attempt_at = ?3
             WHERE id = ?1 AND claimed_by = ?2 AND sent = 0",
            params![item_id, worker_id, fmt_ts(not_before)],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Record a delivery and advance the sequence.
    ///
    /// An item purged by an unsubscribe while it was in flight is written
    /// back as a sent row so the delivery keeps its audit record. `false`
    /// when the claim was lost to another worker after the TTL.
    pub fn mark_sent(
        &self,
        item: &QueueItem,
        worker_id: &str,
        now: DateTime<Utc>,
        receipt: &DeliveryReceipt,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let changed = tx
            .execute(
                "UPDATE queue_items
                 SET sent = 1, sent_at = ?3, error_message = NULL, claimed_at = NULL,
                     provider = ?4, provider_message_id = ?5
                 WHERE id = ?1 AND claimed_by = ?2 AND sent = 0",
                params![item.id, worker_id, fmt_ts(now), receipt.provider, receipt.id],
            )
            .map_err(db_err)?;
        if changed == 1 {
            advance_sequence(&tx, &item.sequence_id, item.position, now)?;
        }
        let restored = if changed == 0 {
            tx.execute(
                "INSERT OR IGNORE INTO queue_items (id, lead_id, sequence_id, template_id, position,
                     scheduled_at, context, sent, sent_at, retry_count, claimed_by,
                     provider, provider_message_id)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?10, ?11, ?12
                 WHERE EXISTS (SELECT 1 FROM sequences WHERE id = ?3 AND is_unsubscribed = 1)",
                params![
                    item.id,
                    item.lead_id,
                    item.sequence_id,
                    item.template_id,
                    item.position,
                    fmt_ts(item.scheduled_at),
                    item.context.to_string(),
                    fmt_ts(now),
                    item.retry_count,
                    worker_id,
                    receipt.provider,
                    receipt.id,
                ],
            )
            .map_err(db_err)?
        } else {
            0
        };
        tx.commit().map_err(db_err)?;
        Ok(changed == 1 || restored == 1)
    }

    /// Transient failure after the in-cycle attempts: bump the retry count,
    /// push the next attempt out and release the claim. Returns the new count.
    pub fn record_retry(
        &self,
        item_id: &str,
        worker_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32> {
        let conn = self.lock()?;
        conn.query_row(
            "UPDATE queue_items
             SET retry_count = retry_count + 1, error_message = ?3, next_attempt_at = ?4,
                 claimed_at = NULL, claimed_by = NULL
             WHERE id = ?1 AND claimed_by = ?2 AND sent = 0
             RETURNING retry_count",
            params![item_id, worker_id, error, fmt_ts(next_attempt_at)],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)
        .map(|count| count.unwrap_or(0))
    }

    /// Terminal failure: no further attempts. The sequence moves past this
    /// position so later messages are not blocked.
    pub fn mark_failed(
        &self,
        item: &QueueItem,
        worker_id: &str,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let changed = tx
            .execute(
                "UPDATE queue_items
                 SET failed_at = ?3, error_message = ?4, claimed_at = NULL
                 WHERE id = ?1 AND claimed_by = ?2 AND sent = 0",
                params![item.id, worker_id, fmt_ts(now), error],
            )
            .map_err(db_err)?;
        if changed == 1 {
            advance_sequence(&tx, &item.sequence_id, item.position, now)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(changed == 1)
    }

    // ─── Rate limiting ──────────────────────────────────────

    /// Count one request against `key`'s fixed window in a single atomic
    /// upsert. An expired window is replaced by a fresh one starting at `now`.
    pub fn hit_window(&self, key: &str, now: DateTime<Utc>, window: Duration) -> Result<WindowHit> {
        let conn = self.lock()?;
        let (count, reset_at): (u32, String) = conn
            .query_row(
                "INSERT INTO rate_limits (key, count, reset_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(key) DO UPDATE SET
                     count = CASE WHEN rate_limits.reset_at <= ?3 THEN 1
                                  ELSE rate_limits.count + 1 END,
                     reset_at = CASE WHEN rate_limits.reset_at <= ?3 THEN ?2
                                     ELSE rate_limits.reset_at END
                 RETURNING count, reset_at",
                params![key, fmt_ts(now + window), fmt_ts(now)],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(db_err)?;
        let reset_at = parse_ts(&reset_at)
            .map_err(|e| LeadflowError::persistence(format!("bad reset_at '{reset_at}': {e}")))?;
        Ok(WindowHit { count, reset_at })
    }

    // ─── Stats ──────────────────────────────────────────────

    pub fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT
                 (SELECT COUNT(*) FROM queue_items WHERE sent = 0 AND failed_at IS NULL),
                 (SELECT COUNT(*) FROM queue_items WHERE sent = 1),
                 (SELECT COUNT(*) FROM queue_items WHERE failed_at IS NOT NULL),
                 (SELECT COUNT(*) FROM sequences WHERE is_completed = 0 AND is_unsubscribed = 0)",
            [],
            |r| {
                Ok(QueueStats {
                    pending: r.get(0)?,
                    sent: r.get(1)?,
                    failed: r.get(2)?,
                    active_sequences: r.get(3)?,
                })
            },
        )
        .map_err(db_err)
    }
}

/// Move the sequence cursor past `position`, complete it at the last
/// position, and point `next_send_at` at the next unsent message.
fn advance_sequence(
    tx: &rusqlite::Transaction<'_>,
    sequence_id: &str,
    position: u32,
    now: DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        "UPDATE sequences SET
             current_message_number = MAX(current_message_number, ?2),
             is_completed = CASE WHEN ?2 >= total_messages THEN 1 ELSE is_completed END,
             next_send_at = (SELECT MIN(scheduled_at) FROM queue_items
                             WHERE sequence_id = ?1 AND sent = 0 AND failed_at IS NULL
                               AND position > ?2),
             updated_at = ?3
         WHERE id = ?1",
        params![sequence_id, position, fmt_ts(now)],
    )
    .map_err(db_err)?;
    Ok(())
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let exists: bool = conn
        .query_row(
            &format!("SELECT COUNT(*) > 0 FROM pragma_table_info('{table}') WHERE name = ?1"),
            [column],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    if !exists {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};"))
            .map_err(|e| LeadflowError::persistence(format!("Migration add {column}: {e}")))?;
    }
    Ok(())
}

fn db_err(e: rusqlite::Error) -> LeadflowError {
    LeadflowError::persistence(e.to_string())
}

/// Fixed-width UTC timestamps so text comparison in SQL is chronological.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc))
}

fn conversion_err(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| conversion_err(idx, e))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn status_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<LeadStatus> {
    let raw: String = row.get(idx)?;
    LeadStatus::parse(&raw).ok_or_else(|| conversion_err(idx, format!("unknown status '{raw}'")))
}

fn map_lead(row: &Row<'_>) -> rusqlite::Result<Lead> {
    Ok(Lead {
        id: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        company: row.get(3)?,
        job_title: row.get(4)?,
        company_size: row.get(5)?,
        score: row.get(6)?,
        status: status_col(row, 7)?,
        feedback_score: row.get(8)?,
        budget_range: row.get(9)?,
        timeline_days: row.get(10)?,
        call_scheduled: row.get(11)?,
        messaging_channel: row.get(12)?,
        unsubscribed_at: opt_ts_col(row, 13)?,
        created_at: ts_col(row, 14)?,
        updated_at: ts_col(row, 15)?,
    })
}

fn map_sequence(row: &Row<'_>) -> rusqlite::Result<Sequence> {
    Ok(Sequence {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        status_at_enrollment: status_col(row, 2)?,
        current_message_number: row.get(3)?,
        total_messages: row.get(4)?,
        next_send_at: opt_ts_col(row, 5)?,
        is_completed: row.get(6)?,
        is_paused: row.get(7)?,
        is_unsubscribed: row.get(8)?,
        created_at: ts_col(row, 9)?,
        updated_at: ts_col(row, 10)?,
    })
}

fn map_queue_item(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    let context: String = row.get(6)?;
    Ok(QueueItem {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        sequence_id: row.get(2)?,
        template_id: row.get(3)?,
        position: row.get(4)?,
        scheduled_at: ts_col(row, 5)?,
        context: serde_json::from_str(&context).unwrap_or_default(),
        sent: row.get(7)?,
        sent_at: opt_ts_col(row, 8)?,
        error_message: row.get(9)?,
        retry_count: row.get(10)?,
        next_attempt_at: opt_ts_col(row, 11)?,
        claimed_at: opt_ts_col(row, 12)?,
        claimed_by: row.get(13)?,
        failed_at: opt_ts_col(row, 14)?,
        provider: row.get(15)?,
        provider_message_id: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlannedMessage;
    use leadflow_core::types::NewLead;

    fn lead(store: &SequenceStore, email: &str) -> Lead {
        let lead = Lead::new(
            NewLead {
                email: email.into(),
                name: Some("Ana Lima".into()),
                ..Default::default()
            },
            Utc::now(),
        )
        .unwrap();
        store.upsert_lead(&lead).unwrap();
        lead
    }

    fn plan(lead_id: &str, now: DateTime<Utc>, delays: &[i64]) -> EnrollmentPlan {
        EnrollmentPlan {
            lead_id: lead_id.into(),
            status: LeadStatus::Hot,
            context: serde_json::json!({"blueprint_title": "Plan"}),
            now,
            messages: delays
                .iter()
                .enumerate()
                .map(|(i, d)| PlannedMessage {
                    template_id: "hot_blueprint_ready".into(),
                    position: i as u32 + 1,
                    scheduled_at: now + Duration::minutes(*d),
                })
                .collect(),
        }
    }

    fn created(e: Enrollment) -> String {
        match e {
            Enrollment::Created(id) => id,
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[test]
    fn test_open_and_migrate_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leadflow.db");
        drop(SequenceStore::open(&path).unwrap());
        let store = SequenceStore::open(&path).unwrap();
        assert_eq!(store.queue_stats().unwrap().pending, 0);
    }

    #[test]
    fn test_lead_roundtrip_keeps_unsubscribe_stamp() {
        let store = SequenceStore::open_in_memory().unwrap();
        let mut l = lead(&store, "ana@acme.io");
        l.score = 77;
        l.status = LeadStatus::Hot;
        l.budget_range = Some("30_60k".into());
        store.upsert_lead(&l).unwrap();

        let loaded = store.get_lead(&l.id).unwrap().unwrap();
        assert_eq!(loaded.score, 77);
        assert_eq!(loaded.status, LeadStatus::Hot);
        assert_eq!(loaded.budget_range.as_deref(), Some("30_60k"));

        store.unsubscribe_lead(&l.id, Utc::now()).unwrap();
        // A later upsert of a stale in-memory copy must not clear the stamp.
        store.upsert_lead(&l).unwrap();
        assert!(store.get_lead(&l.id).unwrap().unwrap().unsubscribed_at.is_some());
        assert!(store.get_lead("missing").unwrap().is_none());
    }

    #[test]
    fn test_enrollment_inserts_all_rows_and_dedups() {
        let store = SequenceStore::open_in_memory().unwrap();
        let l = lead(&store, "ana@acme.io");
        let now = Utc::now();

        let id = created(store.insert_enrollment(&plan(&l.id, now, &[0, 60, 120])).unwrap());
        let seq = store.get_sequence(&id).unwrap().unwrap();
        assert_eq!(seq.total_messages, 3);
        assert_eq!(seq.current_message_number, 0);
        assert!(seq.is_active());

        let items = store.queue_items_for_sequence(&id).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].position, 2);
        assert_eq!(items[1].context["blueprint_title"], "Plan");
        assert!(items.iter().all(|i| !i.sent && i.retry_count == 0));

        let again = store.insert_enrollment(&plan(&l.id, now, &[0])).unwrap();
        assert_eq!(again, Enrollment::AlreadyActive(id));
        assert_eq!(store.sequences_for_lead(&l.id).unwrap().len(), 1);
    }

    #[test]
    fn test_enrollment_is_all_or_nothing() {
        let store = SequenceStore::open_in_memory().unwrap();
        let l = lead(&store, "ana@acme.io");
        store
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_second_message BEFORE INSERT ON queue_items
                 WHEN NEW.position = 2
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .unwrap();

        let err = store
            .insert_enrollment(&plan(&l.id, Utc::now(), &[0, 60, 120]))
            .unwrap_err();
        assert!(err.is_persistence());
        assert!(store.sequences_for_lead(&l.id).unwrap().is_empty());
        assert_eq!(store.unsent_count_for_lead(&l.id).unwrap(), 0);

        // Nothing half-written blocks the next attempt.
        store
            .lock()
            .unwrap()
            .execute_batch("DROP TRIGGER fail_second_message;")
            .unwrap();
        let id = created(store.insert_enrollment(&plan(&l.id, Utc::now(), &[0, 60, 120])).unwrap());
        assert_eq!(store.queue_items_for_sequence(&id).unwrap().len(), 3);
    }

    #[test]
    fn test_concurrent_enrollment_creates_one_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leadflow.db");
        let store_a = SequenceStore::open(&path).unwrap();
        let store_b = SequenceStore::open(&path).unwrap();
        let l = lead(&store_a, "ana@acme.io");
        let now = Utc::now();
        let barrier = std::sync::Barrier::new(2);

        let outcomes: Vec<Enrollment> = std::thread::scope(|scope| {
            let handles: Vec<_> = [&store_a, &store_b]
                .into_iter()
                .map(|store| {
                    let (barrier, lead_id) = (&barrier, &l.id);
                    scope.spawn(move || {
                        barrier.wait();
                        store.insert_enrollment(&plan(lead_id, now, &[0, 60])).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let created_count = outcomes
            .iter()
            .filter(|e| matches!(e, Enrollment::Created(_)))
            .count();
        assert_eq!(created_count, 1);
        assert!(outcomes.iter().any(|e| matches!(e, Enrollment::AlreadyActive(_))));
        assert_eq!(store_b.sequences_for_lead(&l.id).unwrap().len(), 1);
        assert_eq!(store_b.unsent_count_for_lead(&l.id).unwrap(), 2);

        // The partial unique index rejects a second active sequence outright.
        let dup = store_a.lock().unwrap().execute(
            "INSERT INTO sequences (id, lead_id, status_at_enrollment, total_messages,
                 created_at, updated_at)
             VALUES ('seq-dup', ?1, 'hot', 1, ?2, ?2)",
            params![l.id, fmt_ts(now)],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_enrollment_for_unknown_lead() {
        let store = SequenceStore::open_in_memory().unwrap();
        let err = store.insert_enrollment(&plan("nobody", Utc::now(), &[0])).unwrap_err();
        assert!(matches!(err, LeadflowError::NotFound(_)));
    }

    #[test]
    fn test_due_items_only_next_in_line() {
        let store = SequenceStore::open_in_memory().unwrap();
        let l = lead(&store, "ana@acme.io");
        let now = Utc::now();
        let id = created(store.insert_enrollment(&plan(&l.id, now, &[0, 0, 60])).unwrap());

        let due = store.due_items(now, now - Duration::minutes(10), 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].item.position, 1);
        assert_eq!(due[0].recipient.email, "ana@acme.io");

        let item = &due[0].item;
        assert!(store.claim(&item.id, "w1", now, now - Duration::minutes(10)).unwrap());
        let receipt = DeliveryReceipt {
            id: "prov-1".into(),
            provider: "log".into(),
        };
        assert!(store.mark_sent(item, "w1", now, &receipt).unwrap());

        let seq = store.get_sequence(&id).unwrap().unwrap();
        assert_eq!(seq.current_message_number, 1);
        assert!(!seq.is_completed);

        let due = store.due_items(now, now - Duration::minutes(10), 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].item.position, 2);
    }

    #[test]
    fn test_claim_is_exclusive_until_stale() {
        let store = SequenceStore::open_in_memory().unwrap();
        let l = lead(&store, "ana@acme.io");
        let now = Utc::now();
        let id = created(store.insert_enrollment(&plan(&l.id, now, &[0])).unwrap());
        let item = store.queue_items_for_sequence(&id).unwrap().remove(0);

        let stale_before = now - Duration::minutes(10);
        assert!(store.claim(&item.id, "w1", now, stale_before).unwrap());
        assert!(!store.claim(&item.id, "w2", now, stale_before).unwrap());

        // Eleven minutes later the first claim counts as abandoned.
        let later = now + Duration::minutes(11);
        assert!(store.claim(&item.id, "w2", later, later - Duration::minutes(10)).unwrap());
        // The original owner can no longer complete it.
        let receipt = DeliveryReceipt {
            id: "x".into(),
            provider: "log".into(),
        };
        assert!(!store.mark_sent(&item, "w1", later, &receipt).unwrap());
    }

    #[test]
    fn test_paused_sequence_is_not_due_or_claimable() {
        let store = SequenceStore::open_in_memory().unwrap();
        let l = lead(&store, "ana@acme.io");
        let now = Utc::now();
        let id = created(store.insert_enrollment(&plan(&l.id, now, &[0])).unwrap());
        let item = store.queue_items_for_sequence(&id).unwrap().remove(0);

        assert!(store.set_paused(&id, true, now).unwrap());
        assert!(store.due_items(now, now, 10).unwrap().is_empty());
        assert!(!store.claim(&item.id, "w1", now, now).unwrap());

        assert!(store.set_paused(&id, false, now).unwrap());
        assert_eq!(store.due_items(now, now, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_last_item_completes_sequence() {
        let store = SequenceStore::open_in_memory().unwrap();
        let l = lead(&store, "ana@acme.io");
        let now = Utc::now();
        let id = created(store.insert_enrollment(&plan(&l.id, now, &[0])).unwrap());
        let item = store.queue_items_for_sequence(&id).unwrap().remove(0);

        assert!(store.claim(&item.id, "w1", now, now).unwrap());
        assert!(store.mark_failed(&item, "w1", now, "mailbox unavailable").unwrap());

        let seq = store.get_sequence(&id).unwrap().unwrap();
        assert!(seq.is_completed);
        assert_eq!(seq.current_message_number, 1);
        assert!(seq.next_send_at.is_none());
        let stored = store.queue_items_for_sequence(&id).unwrap().remove(0);
        assert!(stored.failed_at.is_some());
        assert_eq!(stored.error_message.as_deref(), Some("mailbox unavailable"));
    }

    #[test]
    fn test_record_retry_defers_item() {
        let store = SequenceStore::open_in_memory().unwrap();
        let l = lead(&store, "ana@acme.io");
        let now = Utc::now();
        let id = created(store.insert_enrollment(&plan(&l.id, now, &[0])).unwrap());
        let item = store.queue_items_for_sequence(&id).unwrap().remove(0);

        assert!(store.claim(&item.id, "w1", now, now).unwrap());
        let count = store
            .record_retry(&item.id, "w1", "503", now + Duration::minutes(2))
            .unwrap();
        assert_eq!(count, 1);
        assert!(store.due_items(now, now, 10).unwrap().is_empty());
        let later = now + Duration::minutes(3);
        assert_eq!(store.due_items(later, later, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe_purges_unsent_and_keeps_sent() {
        let store = SequenceStore::open_in_memory().unwrap();
        let l = lead(&store, "ana@acme.io");
        let now = Utc::now();
        let id = created(store.insert_enrollment(&plan(&l.id, now, &[0, 60, 120])).unwrap());
        let first = store.queue_items_for_sequence(&id).unwrap().remove(0);
        store.claim(&first.id, "w1", now, now).unwrap();
        let receipt = DeliveryReceipt {
            id: "p".into(),
            provider: "log".into(),
        };
        store.mark_sent(&first, "w1", now, &receipt).unwrap();

        let report = store.unsubscribe_lead(&l.id, now).unwrap();
        assert_eq!(
            report,
            UnsubscribeReport {
                sequences_frozen: 1,
                messages_purged: 2
            }
        );
        assert_eq!(store.unsent_count_for_lead(&l.id).unwrap(), 0);
        assert_eq!(store.queue_items_for_sequence(&id).unwrap().len(), 1);

        let seq = store.get_sequence(&id).unwrap().unwrap();
        assert!(seq.is_unsubscribed && seq.is_paused);
        assert!(!store.set_paused(&id, false, now).unwrap());
        assert_eq!(
            store.insert_enrollment(&plan(&l.id, now, &[0])).unwrap(),
            Enrollment::Unsubscribed
        );
    }

    #[test]
    fn test_send_in_flight_during_unsubscribe_keeps_audit_row() {
        let store = SequenceStore::open_in_memory().unwrap();
        let l = lead(&store, "ana@acme.io");
        let now = Utc::now();
        let id = created(store.insert_enrollment(&plan(&l.id, now, &[0, 60])).unwrap());
        let first = store.queue_items_for_sequence(&id).unwrap().remove(0);
        assert!(store.claim(&first.id, "w1", now, now - Duration::minutes(10)).unwrap());

        let report = store.unsubscribe_lead(&l.id, now).unwrap();
        assert_eq!(report.messages_purged, 2);
        assert_eq!(store.unsent_count_for_lead(&l.id).unwrap(), 0);

        // The provider call finishes after the purge.
        let receipt = DeliveryReceipt {
            id: "prov-9".into(),
            provider: "http".into(),
        };
        assert!(store.mark_sent(&first, "w1", now, &receipt).unwrap());

        let rows = store.queue_items_for_sequence(&id).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].sent);
        assert_eq!(rows[0].provider_message_id.as_deref(), Some("prov-9"));
        assert_eq!(store.unsent_count_for_lead(&l.id).unwrap(), 0);
        let seq = store.get_sequence(&id).unwrap().unwrap();
        assert!(seq.is_unsubscribed);
        assert_eq!(seq.current_message_number, 0);
    }

    #[test]
    fn test_defer_holds_item_without_retry() {
        let store = SequenceStore::open_in_memory().unwrap();
        let l = lead(&store, "ana@acme.io");
        let now = Utc::now();
        let id = created(store.insert_enrollment(&plan(&l.id, now, &[0])).unwrap());
        let item = store.queue_items_for_sequence(&id).unwrap().remove(0);

        assert!(store.claim(&item.id, "w1", now, now).unwrap());
        store.defer(&item.id, "w1", now + Duration::minutes(30)).unwrap();
        let held = store.queue_items_for_sequence(&id).unwrap().remove(0);
        assert_eq!(held.retry_count, 0);
        assert!(held.claimed_by.is_none());
        assert!(store.due_items(now, now, 10).unwrap().is_empty());
        let later = now + Duration::minutes(31);
        assert_eq!(store.due_items(later, later, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_hit_window_fixed_window() {
        let store = SequenceStore::open_in_memory().unwrap();
        let t0 = Utc::now();
        let w = Duration::seconds(60);
        assert_eq!(store.hit_window("d:acme.io", t0, w).unwrap().count, 1);
        assert_eq!(store.hit_window("d:acme.io", t0 + Duration::seconds(5), w).unwrap().count, 2);
        let hit = store.hit_window("d:other.io", t0, w).unwrap();
        assert_eq!(hit.count, 1);

        let expired = store.hit_window("d:acme.io", t0 + Duration::seconds(61), w).unwrap();
        assert_eq!(expired.count, 1);
        assert_eq!(fmt_ts(expired.reset_at), fmt_ts(t0 + Duration::seconds(121)));
    }

    #[test]
    fn test_timestamp_format_sorts_chronologically() {
        let a = parse_ts("2026-01-01T09:00:00Z").unwrap();
        let b = a + Duration::milliseconds(1500);
        assert!(fmt_ts(a) < fmt_ts(b));
        assert_eq!(parse_ts(&fmt_ts(b)).unwrap(), b);
    }
}
