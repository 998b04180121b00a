use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use erasure_core::{
    BeginOutcome, CoreError, CoreResult, DedupRecord, DedupStats, DedupStatus, DedupStore,
    NotificationId,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Time a connection waits on a lock held by another process before
/// reporting the database as busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// SQLite-backed deduplication store.
///
/// Every process instance opens the same database file; the primary key on
/// `notification_id` plus `ON CONFLICT DO NOTHING` makes the claim atomic
/// across instances. Calls run on the blocking pool so a slow disk never
/// stalls the async request path.
pub struct SqliteDedupStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDedupStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &str) -> CoreResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CoreError::Storage(format!("failed to open database: {}", e)))?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| CoreError::Storage(format!("failed to set busy timeout: {}", e)))?;

        if path != ":memory:" {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
                .map_err(|e| CoreError::Storage(format!("failed to enable WAL: {}", e)))?;
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS notifications (
                notification_id TEXT PRIMARY KEY NOT NULL,
                status TEXT NOT NULL,
                first_seen_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                failure_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_first_seen
                ON notifications (first_seen_at);",
        )
        .map_err(|e| CoreError::Storage(format!("failed to create tables: {}", e)))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> CoreResult<Self> {
        Self::open(":memory:")
    }

    async fn with_conn<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Connection) -> CoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| CoreError::Storage(format!("lock poisoned: {}", e)))?;
            f(&*guard)
        })
        .await
        .map_err(|e| CoreError::Internal(format!("storage task failed: {}", e)))?
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> CoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| CoreError::Storage(format!("invalid timestamp {}", ms)))
}

fn query_failed(e: rusqlite::Error) -> CoreError {
    CoreError::Storage(format!("query failed: {}", e))
}

fn set_status(
    conn: &Connection,
    id: &str,
    status: DedupStatus,
    reason: Option<&str>,
) -> CoreResult<()> {
    let rows = conn
        .execute(
            "UPDATE notifications SET status = ?2, failure_reason = ?3, updated_at = ?4
             WHERE notification_id = ?1",
            params![id, status.as_str(), reason, to_millis(Utc::now())],
        )
        .map_err(query_failed)?;
    if rows == 0 {
        return Err(CoreError::Storage(format!("no record for notification {}", id)));
    }
    Ok(())
}

#[async_trait]
impl DedupStore for SqliteDedupStore {
    async fn try_begin_processing(&self, id: &NotificationId) -> CoreResult<BeginOutcome> {
        let id = id.as_str().to_string();
        self.with_conn(move |conn| {
            let now = to_millis(Utc::now());
            let inserted = conn
                .execute(
                    "INSERT INTO notifications (notification_id, status, first_seen_at, updated_at)
                     VALUES (?1, ?2, ?3, ?3)
                     ON CONFLICT (notification_id) DO NOTHING",
                    params![id, DedupStatus::Pending.as_str(), now],
                )
                .map_err(query_failed)?;
            Ok(if inserted == 1 {
                BeginOutcome::Started
            } else {
                BeginOutcome::AlreadySeen
            })
        })
        .await
    }

    async fn mark_processed(&self, id: &NotificationId) -> CoreResult<()> {
        let id = id.as_str().to_string();
        self.with_conn(move |conn| set_status(conn, &id, DedupStatus::Processed, None))
            .await
    }

    async fn mark_failed(&self, id: &NotificationId, reason: &str) -> CoreResult<()> {
        let id = id.as_str().to_string();
        let reason = reason.to_string();
        self.with_conn(move |conn| set_status(conn, &id, DedupStatus::Failed, Some(reason.as_str())))
            .await
    }

    async fn release(&self, id: &NotificationId) -> CoreResult<bool> {
        let id = id.as_str().to_string();
        self.with_conn(move |conn| {
            let rows = conn
                .execute(
                    "DELETE FROM notifications WHERE notification_id = ?1 AND status = ?2",
                    params![id, DedupStatus::Pending.as_str()],
                )
                .map_err(query_failed)?;
            Ok(rows > 0)
        })
        .await
    }

    async fn get(&self, id: &NotificationId) -> CoreResult<Option<DedupRecord>> {
        let key = id.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT status, first_seen_at, updated_at, failure_reason
                     FROM notifications WHERE notification_id = ?1",
                    params![key.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    },
                )
                .optional()
                .map_err(query_failed)?;

            match row {
                None => Ok(None),
                Some((status, first_seen, updated, failure_reason)) => Ok(Some(DedupRecord {
                    notification_id: key,
                    first_seen_at: from_millis(first_seen)?,
                    updated_at: from_millis(updated)?,
                    status: status.parse()?,
                    failure_reason,
                })),
            }
        })
        .await
    }

    async fn prune_expired(&self, cutoff: DateTime<Utc>) -> CoreResult<u64> {
        self.with_conn(move |conn| {
            let rows = conn
                .execute(
                    "DELETE FROM notifications WHERE first_seen_at < ?1",
                    params![to_millis(cutoff)],
                )
                .map_err(query_failed)?;
            Ok(rows as u64)
        })
        .await
    }

    async fn stats(&self) -> CoreResult<DedupStats> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM notifications GROUP BY status")
                .map_err(query_failed)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(query_failed)?;

            let mut stats = DedupStats::default();
            for row in rows {
                let (status, count) = row.map_err(query_failed)?;
                let count = count.max(0) as u64;
                match status.parse::<DedupStatus>()? {
                    DedupStatus::Pending => stats.pending = count,
                    DedupStatus::Processed => stats.processed = count,
                    DedupStatus::Failed => stats.failed = count,
                }
            }
            Ok(stats)
        })
        .await
    }
}
