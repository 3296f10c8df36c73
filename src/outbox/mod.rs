//! Ingress & transactional outbox
//! Mission: Once we return 2xx, the event reaches the risk engine, even across crashes

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::bus::{event_stream_for, EventBus};
use crate::error::{EngineError, EngineResult};
use crate::models::{Config, Event};

/// Terminal and in-flight delivery states for an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: String,
    pub org_id: String,
    pub event_id: String,
    pub event_type: String,
    pub payload: String,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub published: u64,
    pub failed: u64,
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    user_id TEXT NOT NULL,
    body TEXT NOT NULL,
    received_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS outbox (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    published_at TEXT,
    next_attempt_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_outbox_pending
    ON outbox(status, next_attempt_at, created_at);

CREATE INDEX IF NOT EXISTS idx_outbox_published_at
    ON outbox(status, published_at);
"#;

/// SQLite-backed outbox. The ingest write and the outbox insert share one
/// transaction; the poller and retention job run over the same connection.
pub struct OutboxStore {
    conn: Arc<Mutex<Connection>>,
}

impl OutboxStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open outbox database: {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize outbox schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Accept an event at the ingress boundary. Writes the domain record and
    /// the outbox entry in a single transaction; both commit or neither do.
    pub fn ingest(&self, event: &Event) -> EngineResult<()> {
        if event.event_id.is_empty() {
            return Err(EngineError::InvalidInput("event_id is required".into()));
        }
        if event.event_type.is_empty() {
            return Err(EngineError::InvalidInput("event_type is required".into()));
        }
        if event.actor.user_id.is_empty() {
            return Err(EngineError::InvalidInput("actor.user_id is required".into()));
        }

        let body = serde_json::to_string(event)
            .map_err(|e| EngineError::InvalidInput(format!("unserializable event: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        tx.execute(
            "INSERT INTO events (event_id, org_id, event_type, user_id, body, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.event_id,
                event.org_id,
                event.event_type,
                event.actor.user_id,
                body,
                now,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                EngineError::Conflict(format!("event {} already ingested", event.event_id))
            }
            other => EngineError::Transient(other.to_string()),
        })?;

        tx.execute(
            "INSERT INTO outbox (id, org_id, event_id, event_type, payload, status,
                                 created_at, next_attempt_at, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6, 0)",
            params![
                uuid::Uuid::new_v4().to_string(),
                event.org_id,
                event.event_id,
                event.event_type,
                body,
                now,
            ],
        )
        .map_err(|e| EngineError::Transient(e.to_string()))?;

        tx.commit()
            .map_err(|e| EngineError::Transient(e.to_string()))?;

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Event ingested into outbox"
        );
        Ok(())
    }

    /// Pending entries whose backoff has elapsed, oldest first.
    pub fn fetch_due(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, org_id, event_id, event_type, payload, status,
                    created_at, published_at, retry_count, last_error
             FROM outbox
             WHERE status = 'pending' AND next_attempt_at <= ?1
             ORDER BY created_at ASC
             LIMIT ?2",
        )?;

        let entries = stmt
            .query_map(params![now, limit as i64], |row| {
                Ok(OutboxEntry {
                    id: row.get(0)?,
                    org_id: row.get(1)?,
                    event_id: row.get(2)?,
                    event_type: row.get(3)?,
                    payload: row.get(4)?,
                    status: OutboxStatus::Pending,
                    created_at: parse_ts(row.get::<_, String>(6)?),
                    published_at: row
                        .get::<_, Option<String>>(7)?
                        .map(parse_ts),
                    retry_count: row.get(8)?,
                    last_error: row.get(9)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    pub fn mark_published(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE outbox SET status = 'published', published_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Record a failed publish. Schedules the next attempt with doubling
    /// backoff capped at the poll interval, or marks the entry `failed` once
    /// the retry budget is exhausted.
    pub fn mark_failed_attempt(
        &self,
        id: &str,
        error_message: &str,
        max_retries: u32,
        poll_interval: Duration,
    ) -> Result<OutboxStatus> {
        let conn = self.conn.lock();
        let retry_count: u32 = conn.query_row(
            "SELECT retry_count FROM outbox WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;

        let next_retry = retry_count + 1;
        if next_retry >= max_retries {
            conn.execute(
                "UPDATE outbox SET status = 'failed', retry_count = ?2, last_error = ?3
                 WHERE id = ?1",
                params![id, next_retry, error_message],
            )?;
            return Ok(OutboxStatus::Failed);
        }

        let backoff_ms = (poll_interval.as_millis() as u64 / 8)
            .saturating_mul(1u64 << next_retry.min(16))
            .min(poll_interval.as_millis() as u64);
        let next_attempt = Utc::now() + ChronoDuration::milliseconds(backoff_ms as i64);

        conn.execute(
            "UPDATE outbox SET retry_count = ?2, last_error = ?3, next_attempt_at = ?4
             WHERE id = ?1",
            params![id, next_retry, error_message, next_attempt.to_rfc3339()],
        )?;
        Ok(OutboxStatus::Pending)
    }

    pub fn stats(&self) -> Result<OutboxStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM outbox GROUP BY status")?;
        let mut stats = OutboxStats::default();

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match status.as_str() {
                "pending" => stats.pending = count,
                "published" => stats.published = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    /// Delete published entries older than the retention horizon.
    pub fn purge_published_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM outbox WHERE status = 'published' AND published_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(deleted)
    }

    pub fn entry_status(&self, event_id: &str) -> Result<Option<(OutboxStatus, u32)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT status, retry_count FROM outbox WHERE event_id = ?1",
                params![event_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        Ok(row.map(|(status, retries)| {
            let status = match status.as_str() {
                "published" => OutboxStatus::Published,
                "failed" => OutboxStatus::Failed,
                _ => OutboxStatus::Pending,
            };
            (status, retries)
        }))
    }
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// One poll cycle: publish due entries to the bus, sequentially within the
/// batch to preserve per-key ordering. Failures move on; the poller never
/// blocks on a slow entry. Returns the number of entries published.
pub fn poll_once(
    store: &OutboxStore,
    bus: &EventBus,
    batch_size: usize,
    max_retries: u32,
    poll_interval: Duration,
) -> usize {
    let entries = match store.fetch_due(batch_size) {
        Ok(entries) => entries,
        Err(e) => {
            error!(error = %e, "Outbox poll failed");
            return 0;
        }
    };

    let mut published = 0;
    for entry in entries {
        let payload: serde_json::Value = match serde_json::from_str(&entry.payload) {
            Ok(v) => v,
            Err(e) => {
                // Unparseable payloads can never publish; burn the retries.
                let _ = store.mark_failed_attempt(
                    &entry.id,
                    &format!("corrupt payload: {e}"),
                    1,
                    poll_interval,
                );
                continue;
            }
        };

        let stream = event_stream_for(&entry.event_type);
        match bus.publish(&stream, &entry.event_type, payload) {
            Ok(_) => {
                if let Err(e) = store.mark_published(&entry.id) {
                    error!(entry = %entry.id, error = %e, "Failed to mark entry published");
                } else {
                    published += 1;
                }
            }
            Err(e) => {
                metrics::increment_counter!("outbox_publish_failures_total");
                match store.mark_failed_attempt(&entry.id, &e.to_string(), max_retries, poll_interval)
                {
                    Ok(OutboxStatus::Failed) => {
                        warn!(
                            entry = %entry.id,
                            event_id = %entry.event_id,
                            retries = max_retries,
                            "Outbox entry exhausted retries, marked failed"
                        );
                    }
                    Ok(_) => {
                        debug!(entry = %entry.id, error = %e, "Publish failed, will retry");
                    }
                    Err(db_err) => {
                        error!(entry = %entry.id, error = %db_err, "Failed to record publish failure");
                    }
                }
            }
        }
    }
    published
}

/// Long-lived poller task. Batches run back-to-back while entries exist.
pub async fn run_poller(store: Arc<OutboxStore>, bus: Arc<EventBus>, config: Config) {
    let poll_interval = Duration::from_millis(config.outbox_poll_interval_ms);
    info!(
        interval_ms = config.outbox_poll_interval_ms,
        batch = config.outbox_batch_size,
        "Outbox poller started"
    );

    loop {
        let published = poll_once(
            &store,
            &bus,
            config.outbox_batch_size,
            config.outbox_max_retries,
            poll_interval,
        );

        // Full batch published: more may be waiting, go straight back in.
        if published < config.outbox_batch_size {
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Retention job: drops published entries older than the configured horizon.
pub async fn run_retention(store: Arc<OutboxStore>, retention_days: i64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    loop {
        ticker.tick().await;
        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        match store.purge_published_before(cutoff) {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "Outbox retention purge complete"),
            Err(e) => error!(error = %e, "Outbox retention purge failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ActorContext;
    use tempfile::NamedTempFile;

    fn test_event(id: &str) -> Event {
        Event {
            event_id: id.to_string(),
            event_type: "transaction.attempted".to_string(),
            org_id: "org_1".to_string(),
            timestamp: Utc::now(),
            actor: ActorContext {
                user_id: "u_1".to_string(),
                ip_address: "10.0.0.1".to_string(),
                user_agent: "test".to_string(),
                device_fingerprint: "fp_1".to_string(),
                session_id: None,
            },
            context: Default::default(),
            payload: serde_json::json!({"amount": 42.0}),
        }
    }

    fn test_store() -> (OutboxStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = OutboxStore::new(file.path().to_str().unwrap()).unwrap();
        (store, file)
    }

    #[test]
    fn test_ingest_requires_identifiers() {
        let (store, _f) = test_store();

        let mut event = test_event("");
        assert!(matches!(
            store.ingest(&event),
            Err(EngineError::InvalidInput(_))
        ));

        event.event_id = "evt_1".to_string();
        event.event_type = String::new();
        assert!(matches!(
            store.ingest(&event),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_ingest_creates_pending_entry() {
        let (store, _f) = test_store();
        store.ingest(&test_event("evt_1")).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.published, 0);

        let (status, retries) = store.entry_status("evt_1").unwrap().unwrap();
        assert_eq!(status, OutboxStatus::Pending);
        assert_eq!(retries, 0);
    }

    #[test]
    fn test_duplicate_event_id_conflicts() {
        let (store, _f) = test_store();
        store.ingest(&test_event("evt_1")).unwrap();
        assert!(matches!(
            store.ingest(&test_event("evt_1")),
            Err(EngineError::Conflict(_))
        ));
        // The failed transaction must not leave a second outbox row.
        assert_eq!(store.stats().unwrap().pending, 1);
    }

    #[test]
    fn test_publish_with_consumer_marks_published() {
        let (store, _f) = test_store();
        let bus = EventBus::new();
        let _rx = bus.subscribe("events:transaction");

        store.ingest(&test_event("evt_1")).unwrap();
        let published = poll_once(&store, &bus, 100, 5, Duration::from_secs(1));

        assert_eq!(published, 1);
        let stats = store.stats().unwrap();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_failed_publish_exhausts_retries() {
        let (store, _f) = test_store();
        let bus = EventBus::new(); // no consumers: every publish fails
        store.ingest(&test_event("evt_1")).unwrap();

        // max_retries - 1 attempts leave the entry pending
        for _ in 0..4 {
            let entries = store.fetch_due(10).unwrap();
            for entry in &entries {
                store
                    .mark_failed_attempt(&entry.id, "no consumers", 5, Duration::from_millis(0))
                    .unwrap();
            }
        }
        let (status, retries) = store.entry_status("evt_1").unwrap().unwrap();
        assert_eq!(status, OutboxStatus::Pending);
        assert_eq!(retries, 4);

        // the final attempt flips it to failed
        let entries = store.fetch_due(10).unwrap();
        let status = store
            .mark_failed_attempt(&entries[0].id, "no consumers", 5, Duration::from_millis(0))
            .unwrap();
        assert_eq!(status, OutboxStatus::Failed);
        assert_eq!(store.stats().unwrap().failed, 1);
    }

    #[test]
    fn test_retention_purges_only_old_published() {
        let (store, _f) = test_store();
        let bus = EventBus::new();
        let _rx = bus.subscribe("events:transaction");

        store.ingest(&test_event("evt_old")).unwrap();
        store.ingest(&test_event("evt_new")).unwrap();
        poll_once(&store, &bus, 100, 5, Duration::from_secs(1));

        // Nothing published before "the future minus 7 days" yet
        let deleted = store
            .purge_published_before(Utc::now() - ChronoDuration::days(7))
            .unwrap();
        assert_eq!(deleted, 0);

        let deleted = store
            .purge_published_before(Utc::now() + ChronoDuration::seconds(1))
            .unwrap();
        assert_eq!(deleted, 2);
    }

    #[test]
    fn test_fetch_due_orders_by_created_at() {
        let (store, _f) = test_store();
        store.ingest(&test_event("evt_a")).unwrap();
        store.ingest(&test_event("evt_b")).unwrap();

        let entries = store.fetch_due(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].created_at <= entries[1].created_at);
    }
}
