//! SQLite-backed persistence for notifications, the delivery queue,
//! delivery logs, and scheduled notifications.
//! One connection behind a mutex; every repository call is a short
//! synchronous statement, so the lock is never held across an await.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use pigeon_core::error::{PigeonError, Result};
use pigeon_core::traits::{
    DeliveryLogRepository, NotificationRepository, QueueRepository, ScheduleRepository,
};
use pigeon_core::types::{
    ChannelType, DeliveryLog, DeliveryOutcome, Notification, NotificationPayload,
    NotificationStatus, QueueItem, QueueStatus, RecurrencePattern, ScheduleStatus,
    ScheduledNotification,
};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

/// SQLite store implementing every repository trait.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| PigeonError::storage(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    /// Fresh private database, used by tests and `--once` dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PigeonError::storage(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                channel TEXT NOT NULL,           -- 'email', 'sms', 'push'
                recipient TEXT NOT NULL,
                subject TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',  -- JSON object
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                created_at TEXT NOT NULL,
                sent_at TEXT,
                last_error TEXT
            );

            CREATE TABLE IF NOT EXISTS queue_items (
                id TEXT PRIMARY KEY,
                notification_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',  -- pending, processing, completed, failed
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                claim_token TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_status ON queue_items(status, created_at);

            CREATE TABLE IF NOT EXISTS delivery_logs (
                id TEXT PRIMARY KEY,
                notification_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                outcome TEXT NOT NULL,           -- 'sent', 'failed'
                message_id TEXT,
                error TEXT,
                attempt INTEGER NOT NULL DEFAULT 1,
                logged_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_notification ON delivery_logs(notification_id);

            CREATE TABLE IF NOT EXISTS scheduled_notifications (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,           -- JSON NotificationPayload
                scheduled_for TEXT NOT NULL,
                time_zone TEXT NOT NULL DEFAULT 'UTC',
                is_recurring INTEGER NOT NULL DEFAULT 0,
                recurrence TEXT,                 -- 'daily', 'weekly', 'monthly', 'yearly', 'cron'
                cron_expression TEXT,
                last_execution TEXT,
                next_execution TEXT,
                max_executions INTEGER,
                execution_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                created_by TEXT NOT NULL DEFAULT '',
                cancel_reason TEXT,
                cancelled_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_schedules_next ON scheduled_notifications(status, next_execution);
         ",
            )
            .map_err(|e| PigeonError::storage(format!("Migration: {e}")))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| PigeonError::storage(format!("Lock: {e}")))
    }

    /// Row counts per queue status, for `pigeon status`.
    pub fn queue_counts(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM queue_items GROUP BY status ORDER BY status")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Active schedules ordered by next execution.
    pub fn active_schedules(&self) -> Result<Vec<ScheduledNotification>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM scheduled_notifications
                 WHERE status = 'active' ORDER BY next_execution"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], schedule_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn queue_by_status(&self, status: QueueStatus) -> Result<Vec<QueueItem>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {QUEUE_COLUMNS} FROM queue_items
                 WHERE status = ?1 ORDER BY created_at, id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![status.as_str()], queue_item_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

// ─── Row Mapping ──────────────────────────────────────────

const NOTIFICATION_COLUMNS: &str = "id, channel, recipient, subject, content, metadata, status, \
     retry_count, max_retries, created_at, sent_at, last_error";

const QUEUE_COLUMNS: &str =
    "id, notification_id, status, attempts, last_attempt_at, error_message, created_at, claim_token";

const LOG_COLUMNS: &str =
    "id, notification_id, channel, outcome, message_id, error, attempt, logged_at";

const SCHEDULE_COLUMNS: &str = "id, payload, scheduled_for, time_zone, is_recurring, recurrence, \
     cron_expression, last_execution, next_execution, max_executions, execution_count, status, \
     created_by, cancel_reason, cancelled_by, created_at, updated_at";

fn db_err(e: rusqlite::Error) -> PigeonError {
    PigeonError::Storage(e.to_string())
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn conversion(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn get_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion(idx, format!("timestamp '{raw}': {e}")))
}

fn get_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion(idx, format!("timestamp '{raw}': {e}")))
    })
    .transpose()
}

fn get_json<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion(idx, format!("json: {e}")))
}

fn get_enum<T>(row: &Row, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion(idx, format!("unexpected value '{raw}'")))
}

fn notification_from_row(row: &Row) -> rusqlite::Result<Notification> {
    let channel: String = row.get(1)?;
    Ok(Notification {
        id: row.get(0)?,
        channel: ChannelType::parse(&channel),
        recipient: row.get(2)?,
        subject: row.get(3)?,
        content: row.get(4)?,
        metadata: get_json(row, 5)?,
        status: get_enum(row, 6, NotificationStatus::parse)?,
        retry_count: row.get(7)?,
        max_retries: row.get(8)?,
        created_at: get_ts(row, 9)?,
        sent_at: get_opt_ts(row, 10)?,
        last_error: row.get(11)?,
    })
}

fn queue_item_from_row(row: &Row) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        id: row.get(0)?,
        notification_id: row.get(1)?,
        status: get_enum(row, 2, QueueStatus::parse)?,
        attempts: row.get(3)?,
        last_attempt_at: get_opt_ts(row, 4)?,
        error_message: row.get(5)?,
        created_at: get_ts(row, 6)?,
        claim_token: row.get(7)?,
    })
}

fn log_from_row(row: &Row) -> rusqlite::Result<DeliveryLog> {
    let channel: String = row.get(2)?;
    Ok(DeliveryLog {
        id: row.get(0)?,
        notification_id: row.get(1)?,
        channel: ChannelType::parse(&channel),
        outcome: get_enum(row, 3, DeliveryOutcome::parse)?,
        message_id: row.get(4)?,
        error: row.get(5)?,
        attempt: row.get(6)?,
        logged_at: get_ts(row, 7)?,
    })
}

fn schedule_from_row(row: &Row) -> rusqlite::Result<ScheduledNotification> {
    let recurrence: Option<String> = row.get(5)?;
    let payload: NotificationPayload = get_json(row, 1)?;
    Ok(ScheduledNotification {
        id: row.get(0)?,
        payload,
        scheduled_for: get_ts(row, 2)?,
        time_zone: row.get(3)?,
        is_recurring: row.get(4)?,
        recurrence: recurrence.as_deref().and_then(RecurrencePattern::parse),
        cron_expression: row.get(6)?,
        last_execution: get_opt_ts(row, 7)?,
        next_execution: get_opt_ts(row, 8)?,
        max_executions: row.get(9)?,
        execution_count: row.get(10)?,
        status: get_enum(row, 11, ScheduleStatus::parse)?,
        created_by: row.get(12)?,
        cancel_reason: row.get(13)?,
        cancelled_by: row.get(14)?,
        created_at: get_ts(row, 15)?,
        updated_at: get_ts(row, 16)?,
    })
}

fn ensure_updated(rows: usize, what: &str, id: &str) -> Result<()> {
    if rows == 0 {
        Err(PigeonError::NotFound(format!("{what} {id}")))
    } else {
        Ok(())
    }
}

// ─── Notifications ────────────────────────────────────────

#[async_trait]
impl NotificationRepository for SqliteStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<Notification>> {
        self.conn()?
            .query_row(
                &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
                params![id],
                notification_from_row,
            )
            .optional()
            .map_err(db_err)
    }

    async fn add(&self, n: &Notification) -> Result<()> {
        let metadata = serde_json::to_string(&n.metadata)?;
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO notifications ({NOTIFICATION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    n.id,
                    n.channel.as_str(),
                    n.recipient,
                    n.subject,
                    n.content,
                    metadata,
                    n.status.as_str(),
                    n.retry_count,
                    n.max_retries,
                    ts(&n.created_at),
                    opt_ts(&n.sent_at),
                    n.last_error,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn update(&self, n: &Notification) -> Result<()> {
        let metadata = serde_json::to_string(&n.metadata)?;
        let rows = self
            .conn()?
            .execute(
                "UPDATE notifications SET channel = ?2, recipient = ?3, subject = ?4, content = ?5,
                     metadata = ?6, status = ?7, retry_count = ?8, max_retries = ?9,
                     sent_at = ?10, last_error = ?11
                 WHERE id = ?1",
                params![
                    n.id,
                    n.channel.as_str(),
                    n.recipient,
                    n.subject,
                    n.content,
                    metadata,
                    n.status.as_str(),
                    n.retry_count,
                    n.max_retries,
                    opt_ts(&n.sent_at),
                    n.last_error,
                ],
            )
            .map_err(db_err)?;
        ensure_updated(rows, "notification", &n.id)
    }
}

// ─── Delivery Queue ───────────────────────────────────────

#[async_trait]
impl QueueRepository for SqliteStore {
    async fn get_pending(&self) -> Result<Vec<QueueItem>> {
        self.queue_by_status(QueueStatus::Pending)
    }

    async fn get_failed(&self) -> Result<Vec<QueueItem>> {
        self.queue_by_status(QueueStatus::Failed)
    }

    async fn add(&self, item: &QueueItem) -> Result<()> {
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO queue_items ({QUEUE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    item.id,
                    item.notification_id,
                    item.status.as_str(),
                    item.attempts,
                    opt_ts(&item.last_attempt_at),
                    item.error_message,
                    ts(&item.created_at),
                    item.claim_token,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn try_claim(&self, id: &str, token: &str, at: DateTime<Utc>) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                "UPDATE queue_items
                 SET status = 'processing', attempts = attempts + 1,
                     last_attempt_at = ?2, claim_token = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![id, ts(&at), token],
            )
            .map_err(db_err)?;
        Ok(rows == 1)
    }

    async fn settle(&self, item: &QueueItem) -> Result<bool> {
        let Some(token) = item.claim_token.as_deref() else {
            return Ok(false);
        };
        let rows = self
            .conn()?
            .execute(
                "UPDATE queue_items SET status = ?3, error_message = ?4
                 WHERE id = ?1 AND claim_token = ?2 AND status = 'processing'",
                params![item.id, token, item.status.as_str(), item.error_message],
            )
            .map_err(db_err)?;
        Ok(rows == 1)
    }

    async fn rearm(&self, id: &str, attempts: u32) -> Result<bool> {
        let rows = self
            .conn()?
            .execute(
                "UPDATE queue_items SET status = 'pending', claim_token = NULL
                 WHERE id = ?1 AND status = 'failed' AND attempts = ?2",
                params![id, attempts],
            )
            .map_err(db_err)?;
        Ok(rows == 1)
    }

    async fn update(&self, item: &QueueItem) -> Result<()> {
        let rows = self
            .conn()?
            .execute(
                "UPDATE queue_items SET status = ?2, attempts = ?3, last_attempt_at = ?4,
                     error_message = ?5, claim_token = ?6
                 WHERE id = ?1",
                params![
                    item.id,
                    item.status.as_str(),
                    item.attempts,
                    opt_ts(&item.last_attempt_at),
                    item.error_message,
                    item.claim_token,
                ],
            )
            .map_err(db_err)?;
        ensure_updated(rows, "queue item", &item.id)
    }
}

// ─── Delivery Logs ────────────────────────────────────────

#[async_trait]
impl DeliveryLogRepository for SqliteStore {
    async fn add(&self, entry: &DeliveryLog) -> Result<()> {
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO delivery_logs ({LOG_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    entry.id,
                    entry.notification_id,
                    entry.channel.as_str(),
                    entry.outcome.as_str(),
                    entry.message_id,
                    entry.error,
                    entry.attempt,
                    ts(&entry.logged_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_for_notification(&self, notification_id: &str) -> Result<Vec<DeliveryLog>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {LOG_COLUMNS} FROM delivery_logs
                 WHERE notification_id = ?1 ORDER BY logged_at, attempt"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![notification_id], log_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

// ─── Scheduled Notifications ──────────────────────────────

#[async_trait]
impl ScheduleRepository for SqliteStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<ScheduledNotification>> {
        self.conn()?
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM scheduled_notifications WHERE id = ?1"),
                params![id],
                schedule_from_row,
            )
            .optional()
            .map_err(db_err)
    }

    async fn add(&self, s: &ScheduledNotification) -> Result<()> {
        let payload = serde_json::to_string(&s.payload)?;
        self.conn()?
            .execute(
                &format!(
                    "INSERT INTO scheduled_notifications ({SCHEDULE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    s.id,
                    payload,
                    ts(&s.scheduled_for),
                    s.time_zone,
                    s.is_recurring,
                    s.recurrence.map(|r| r.as_str()),
                    s.cron_expression,
                    opt_ts(&s.last_execution),
                    opt_ts(&s.next_execution),
                    s.max_executions,
                    s.execution_count,
                    s.status.as_str(),
                    s.created_by,
                    s.cancel_reason,
                    s.cancelled_by,
                    ts(&s.created_at),
                    ts(&s.updated_at),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn update(&self, s: &ScheduledNotification) -> Result<()> {
        let payload = serde_json::to_string(&s.payload)?;
        let rows = self
            .conn()?
            .execute(
                "UPDATE scheduled_notifications SET payload = ?2, scheduled_for = ?3,
                     time_zone = ?4, is_recurring = ?5, recurrence = ?6, cron_expression = ?7,
                     last_execution = ?8, next_execution = ?9, max_executions = ?10,
                     execution_count = ?11, status = ?12, cancel_reason = ?13,
                     cancelled_by = ?14, updated_at = ?15
                 WHERE id = ?1",
                params![
                    s.id,
                    payload,
                    ts(&s.scheduled_for),
                    s.time_zone,
                    s.is_recurring,
                    s.recurrence.map(|r| r.as_str()),
                    s.cron_expression,
                    opt_ts(&s.last_execution),
                    opt_ts(&s.next_execution),
                    s.max_executions,
                    s.execution_count,
                    s.status.as_str(),
                    s.cancel_reason,
                    s.cancelled_by,
                    ts(&s.updated_at),
                ],
            )
            .map_err(db_err)?;
        ensure_updated(rows, "schedule", &s.id)
    }
}
