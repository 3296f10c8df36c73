//! Webhook delivery
//! Mission: Signed, retried, idempotency-friendly decision delivery to external endpoints

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::{params, Connection};
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{RiskAssessment, RiskLevel};

type HmacSha256 = Hmac<Sha256>;

/// Fixed retry schedule after a failed attempt: 1 min, 5 min, 15 min.
const RETRY_STEPS_SECS: [i64; 3] = [60, 300, 900];

#[derive(Debug, Clone, Serialize)]
pub struct Webhook {
    pub id: String,
    pub org_id: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    /// Event types to deliver; empty means all.
    pub event_types: Vec<String>,
    pub min_risk_level: RiskLevel,
    pub description: Option<String>,
    pub is_active: bool,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub total_deliveries: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn success_rate(&self) -> f64 {
        if self.total_deliveries == 0 {
            100.0
        } else {
            self.successful_deliveries as f64 / self.total_deliveries as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub webhook_id: String,
    pub event_id: String,
    pub attempt_number: u32,
    pub status_code: Option<u16>,
    pub is_successful: bool,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub is_final_attempt: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub request_body: String,
    pub created_at: DateTime<Utc>,
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS webhooks (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    url TEXT NOT NULL,
    secret_key TEXT NOT NULL,
    event_types TEXT NOT NULL,
    min_risk_level TEXT NOT NULL DEFAULT 'low',
    description TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    timeout_seconds INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    total_deliveries INTEGER NOT NULL DEFAULT 0,
    successful_deliveries INTEGER NOT NULL DEFAULT 0,
    failed_deliveries INTEGER NOT NULL DEFAULT 0,
    last_triggered_at TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_webhooks_org ON webhooks(org_id, is_active);

CREATE TABLE IF NOT EXISTS webhook_deliveries (
    id TEXT PRIMARY KEY,
    webhook_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    attempt_number INTEGER NOT NULL,
    status_code INTEGER,
    is_successful INTEGER NOT NULL DEFAULT 0,
    response_time_ms INTEGER,
    error_message TEXT,
    is_final_attempt INTEGER NOT NULL DEFAULT 0,
    next_retry_at TEXT,
    request_body TEXT NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_deliveries_webhook
    ON webhook_deliveries(webhook_id, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_deliveries_retry
    ON webhook_deliveries(next_retry_at) WHERE next_retry_at IS NOT NULL;
"#;

pub struct WebhookStore {
    conn: Arc<Mutex<Connection>>,
}

impl WebhookStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open webhook database: {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize webhook schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Register a webhook. The signing secret is generated server-side and
    /// returned to the caller exactly once.
    pub fn register(
        &self,
        org_id: &str,
        url: &str,
        event_types: Vec<String>,
        min_risk_level: RiskLevel,
        description: Option<String>,
        timeout_seconds: u64,
        max_retries: u32,
    ) -> Result<(Webhook, String)> {
        let mut secret_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        let secret = hex::encode(secret_bytes);

        let webhook = Webhook {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            url: url.to_string(),
            secret_key: secret.clone(),
            event_types,
            min_risk_level,
            description,
            is_active: true,
            timeout_seconds,
            max_retries,
            total_deliveries: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            last_triggered_at: None,
            created_at: Utc::now(),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO webhooks
                 (id, org_id, url, secret_key, event_types, min_risk_level, description,
                  is_active, timeout_seconds, max_retries, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?10)",
            params![
                webhook.id,
                webhook.org_id,
                webhook.url,
                webhook.secret_key,
                serde_json::to_string(&webhook.event_types)?,
                webhook.min_risk_level.as_str(),
                webhook.description,
                webhook.timeout_seconds as i64,
                webhook.max_retries as i64,
                webhook.created_at.to_rfc3339(),
            ],
        )?;

        info!(webhook_id = %webhook.id, org_id, url, "Webhook registered");
        Ok((webhook, secret))
    }

    pub fn active_for(&self, org_id: &str) -> Result<Vec<Webhook>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_WEBHOOK} WHERE org_id = ?1 AND is_active = 1"
        ))?;
        let rows = stmt.query_map(params![org_id], row_to_webhook)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn list(&self, org_id: &str) -> Result<Vec<Webhook>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{SELECT_WEBHOOK} WHERE org_id = ?1"))?;
        let rows = stmt.query_map(params![org_id], row_to_webhook)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn by_id(&self, webhook_id: &str) -> Result<Option<Webhook>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                &format!("{SELECT_WEBHOOK} WHERE id = ?1"),
                params![webhook_id],
                row_to_webhook,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(result)
    }

    /// Persist an attempt and update the webhook's counters.
    pub fn record_attempt(&self, record: &DeliveryRecord) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO webhook_deliveries
                 (id, webhook_id, event_id, attempt_number, status_code, is_successful,
                  response_time_ms, error_message, is_final_attempt, next_retry_at,
                  request_body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.id,
                record.webhook_id,
                record.event_id,
                record.attempt_number as i64,
                record.status_code.map(|c| c as i64),
                record.is_successful as i64,
                record.response_time_ms.map(|m| m as i64),
                record.error_message,
                record.is_final_attempt as i64,
                record.next_retry_at.map(|t| t.to_rfc3339()),
                record.request_body,
                record.created_at.to_rfc3339(),
            ],
        )?;

        if record.is_successful {
            tx.execute(
                "UPDATE webhooks SET total_deliveries = total_deliveries + 1,
                        successful_deliveries = successful_deliveries + 1,
                        last_triggered_at = ?2
                 WHERE id = ?1",
                params![record.webhook_id, record.created_at.to_rfc3339()],
            )?;
        } else {
            tx.execute(
                "UPDATE webhooks SET total_deliveries = total_deliveries + 1,
                        failed_deliveries = failed_deliveries + 1,
                        last_triggered_at = ?2
                 WHERE id = ?1",
                params![record.webhook_id, record.created_at.to_rfc3339()],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn deliveries(&self, webhook_id: &str, limit: usize) -> Result<Vec<DeliveryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, webhook_id, event_id, attempt_number, status_code, is_successful,
                    response_time_ms, error_message, is_final_attempt, next_retry_at,
                    request_body, created_at
             FROM webhook_deliveries WHERE webhook_id = ?1
             ORDER BY created_at ASC, attempt_number ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![webhook_id, limit as i64], row_to_delivery)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Failed attempts whose scheduled retry is due.
    pub fn due_retries(&self) -> Result<Vec<DeliveryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, webhook_id, event_id, attempt_number, status_code, is_successful,
                    response_time_ms, error_message, is_final_attempt, next_retry_at,
                    request_body, created_at
             FROM webhook_deliveries
             WHERE next_retry_at IS NOT NULL AND next_retry_at <= ?1
               AND is_successful = 0 AND is_final_attempt = 0",
        )?;
        let rows = stmt.query_map(params![Utc::now().to_rfc3339()], row_to_delivery)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Clear the retry marker once the retry has been picked up, so a slow
    /// worker pass cannot double-send.
    pub fn claim_retry(&self, delivery_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE webhook_deliveries SET next_retry_at = NULL
             WHERE id = ?1 AND next_retry_at IS NOT NULL",
            params![delivery_id],
        )?;
        Ok(updated > 0)
    }
}

const SELECT_WEBHOOK: &str =
    "SELECT id, org_id, url, secret_key, event_types, min_risk_level, description, is_active,
            timeout_seconds, max_retries, total_deliveries, successful_deliveries,
            failed_deliveries, last_triggered_at, created_at
     FROM webhooks";

fn row_to_webhook(row: &rusqlite::Row<'_>) -> rusqlite::Result<Webhook> {
    let event_types: String = row.get(4)?;
    let min_level: String = row.get(5)?;
    let last_triggered: Option<String> = row.get(13)?;
    let created_at: String = row.get(14)?;

    Ok(Webhook {
        id: row.get(0)?,
        org_id: row.get(1)?,
        url: row.get(2)?,
        secret_key: row.get(3)?,
        event_types: serde_json::from_str(&event_types).unwrap_or_default(),
        min_risk_level: RiskLevel::from_str(&min_level).unwrap_or(RiskLevel::Low),
        description: row.get(6)?,
        is_active: row.get::<_, i64>(7)? != 0,
        timeout_seconds: row.get::<_, i64>(8)? as u64,
        max_retries: row.get::<_, i64>(9)? as u32,
        total_deliveries: row.get::<_, i64>(10)? as u64,
        successful_deliveries: row.get::<_, i64>(11)? as u64,
        failed_deliveries: row.get::<_, i64>(12)? as u64,
        last_triggered_at: last_triggered.and_then(parse_ts),
        created_at: parse_ts(created_at).unwrap_or_else(Utc::now),
    })
}

fn row_to_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeliveryRecord> {
    let next_retry: Option<String> = row.get(9)?;
    let created_at: String = row.get(11)?;
    Ok(DeliveryRecord {
        id: row.get(0)?,
        webhook_id: row.get(1)?,
        event_id: row.get(2)?,
        attempt_number: row.get::<_, i64>(3)? as u32,
        status_code: row.get::<_, Option<i64>>(4)?.map(|c| c as u16),
        is_successful: row.get::<_, i64>(5)? != 0,
        response_time_ms: row.get::<_, Option<i64>>(6)?.map(|m| m as u64),
        error_message: row.get(7)?,
        is_final_attempt: row.get::<_, i64>(8)? != 0,
        next_retry_at: next_retry.and_then(parse_ts),
        request_body: row.get(10)?,
        created_at: parse_ts(created_at).unwrap_or_else(Utc::now),
    })
}

fn parse_ts(s: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// HMAC-SHA256 hex signature over the raw request body.
pub fn sign_payload(body: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Filters: event type (empty list = all) and minimum risk level.
pub fn should_deliver(webhook: &Webhook, assessment: &RiskAssessment) -> bool {
    if !webhook.is_active {
        return false;
    }
    if !webhook.event_types.is_empty()
        && !webhook.event_types.iter().any(|t| t == &assessment.event_type)
    {
        return false;
    }
    assessment.risk_level.rank() >= webhook.min_risk_level.rank()
}

/// Canonical delivery body. serde_json sorts the keys, so the signed bytes
/// are stable for a given decision and attempt.
pub fn build_payload(assessment: &RiskAssessment, attempt: u32) -> serde_json::Value {
    serde_json::json!({
        "event_id": assessment.event_id,
        "user_id": assessment.user_id,
        "risk_score": assessment.risk_score,
        "risk_level": assessment.risk_level.as_str(),
        "triggered_rules": assessment.triggered_rules,
        "recommended_action": assessment.recommended_action.as_str(),
        "timestamp": assessment.created_at.to_rfc3339(),
        "webhook_attempt": attempt,
    })
}

pub struct WebhookDispatcher {
    store: Arc<WebhookStore>,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<WebhookStore>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
        }
    }

    pub fn store(&self) -> &WebhookStore {
        &self.store
    }

    /// Fan a decision out to every matching webhook for its org. Runs off
    /// the decision path; failures are retried by the schedule.
    pub async fn dispatch(&self, assessment: &RiskAssessment) {
        let webhooks = match self.store.active_for(&assessment.org_id) {
            Ok(webhooks) => webhooks,
            Err(e) => {
                error!(error = %e, "Failed to load webhooks for dispatch");
                return;
            }
        };

        for webhook in webhooks {
            if should_deliver(&webhook, assessment) {
                let body = build_payload(assessment, 1).to_string();
                self.deliver(&webhook, &assessment.event_id, body, 1).await;
            }
        }
    }

    /// One delivery attempt: sign, POST with the webhook's timeout, record
    /// the outcome, and schedule the next retry step on failure.
    pub async fn deliver(&self, webhook: &Webhook, event_id: &str, body: String, attempt: u32) {
        let signature = sign_payload(&body, &webhook.secret_key);
        let delivery_id = format!("{}:{}:{}", webhook.id, event_id, attempt);
        let started = Instant::now();

        let response = self
            .client
            .post(&webhook.url)
            .header("Content-Type", "application/json")
            .header("X-Signature", &signature)
            .header("X-Delivery-Id", &delivery_id)
            .header("X-Timestamp", Utc::now().to_rfc3339())
            .timeout(Duration::from_secs(webhook.timeout_seconds))
            .body(body.clone())
            .send()
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let is_final = attempt >= webhook.max_retries;

        let record = match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let is_successful = resp.status().is_success();
                if is_successful {
                    debug!(
                        webhook_id = %webhook.id,
                        event_id,
                        attempt,
                        status,
                        time_ms = elapsed_ms,
                        "Webhook delivered"
                    );
                } else {
                    warn!(
                        webhook_id = %webhook.id,
                        event_id,
                        attempt,
                        status,
                        "Webhook delivery failed"
                    );
                }
                DeliveryRecord {
                    id: Uuid::new_v4().to_string(),
                    webhook_id: webhook.id.clone(),
                    event_id: event_id.to_string(),
                    attempt_number: attempt,
                    status_code: Some(status),
                    is_successful,
                    response_time_ms: Some(elapsed_ms),
                    error_message: None,
                    is_final_attempt: !is_successful && is_final,
                    next_retry_at: retry_at(is_successful, attempt, webhook.max_retries),
                    request_body: body,
                    created_at: Utc::now(),
                }
            }
            Err(e) => {
                warn!(
                    webhook_id = %webhook.id,
                    event_id,
                    attempt,
                    error = %e,
                    "Webhook delivery error"
                );
                DeliveryRecord {
                    id: Uuid::new_v4().to_string(),
                    webhook_id: webhook.id.clone(),
                    event_id: event_id.to_string(),
                    attempt_number: attempt,
                    status_code: None,
                    is_successful: false,
                    response_time_ms: Some(elapsed_ms),
                    error_message: Some(e.to_string()),
                    is_final_attempt: is_final,
                    next_retry_at: retry_at(false, attempt, webhook.max_retries),
                    request_body: body,
                    created_at: Utc::now(),
                }
            }
        };

        if record.is_final_attempt {
            metrics::increment_counter!("webhook_final_failures_total");
        }
        if let Err(e) = self.store.record_attempt(&record) {
            error!(error = %e, "Failed to record webhook delivery attempt");
        }
    }

    /// One retry-worker pass. Returns the number of retries attempted.
    pub async fn process_due_retries(&self) -> usize {
        let due = match self.store.due_retries() {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to query due webhook retries");
                return 0;
            }
        };

        let mut attempted = 0;
        for delivery in due {
            if !self.store.claim_retry(&delivery.id).unwrap_or(false) {
                continue;
            }
            let Some(webhook) = self.store.by_id(&delivery.webhook_id).ok().flatten() else {
                continue;
            };

            let next_attempt = delivery.attempt_number + 1;
            // Same decision body, bumped attempt counter.
            let body = match serde_json::from_str::<serde_json::Value>(&delivery.request_body) {
                Ok(mut payload) => {
                    payload["webhook_attempt"] = serde_json::json!(next_attempt);
                    payload.to_string()
                }
                Err(_) => delivery.request_body.clone(),
            };

            info!(
                webhook_id = %webhook.id,
                event_id = %delivery.event_id,
                attempt = next_attempt,
                "Retrying webhook delivery"
            );
            self.deliver(&webhook, &delivery.event_id, body, next_attempt)
                .await;
            attempted += 1;
        }
        attempted
    }
}

fn retry_at(is_successful: bool, attempt: u32, max_retries: u32) -> Option<DateTime<Utc>> {
    if is_successful || attempt >= max_retries {
        return None;
    }
    let step = RETRY_STEPS_SECS[((attempt - 1) as usize).min(RETRY_STEPS_SECS.len() - 1)];
    Some(Utc::now() + ChronoDuration::seconds(step))
}

/// Long-lived retry worker.
pub async fn run_retry_worker(dispatcher: Arc<WebhookDispatcher>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        ticker.tick().await;
        let attempted = dispatcher.process_due_retries().await;
        if attempted > 0 {
            debug!(attempted, "Webhook retry pass complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActorContext, Event, RecommendedAction};
    use tempfile::NamedTempFile;

    fn assessment(level: RiskLevel) -> RiskAssessment {
        let event = Event {
            event_id: "evt_1".to_string(),
            event_type: "transaction.attempted".to_string(),
            org_id: "org_1".to_string(),
            timestamp: Utc::now(),
            actor: ActorContext {
                user_id: "u_1".to_string(),
                ip_address: String::new(),
                user_agent: String::new(),
                device_fingerprint: String::new(),
                session_id: None,
            },
            context: Default::default(),
            payload: serde_json::json!({}),
        };
        let mut a = RiskAssessment::new(&event);
        a.risk_level = level;
        a.risk_score = 0.7;
        a.recommended_action = RecommendedAction::Challenge;
        a.triggered_rules = vec!["rapid_transactions".to_string()];
        a
    }

    fn store() -> (Arc<WebhookStore>, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(WebhookStore::new(file.path().to_str().unwrap()).unwrap());
        (store, file)
    }

    fn register(store: &WebhookStore, min_level: RiskLevel, event_types: Vec<String>) -> Webhook {
        store
            .register(
                "org_1",
                "http://127.0.0.1:1/hook",
                event_types,
                min_level,
                None,
                30,
                3,
            )
            .unwrap()
            .0
    }

    #[test]
    fn test_secret_is_64_hex_chars() {
        let (store, _f) = store();
        let (webhook, secret) = store
            .register("org_1", "http://example.com", vec![], RiskLevel::Low, None, 30, 3)
            .unwrap();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(webhook.secret_key, secret);
    }

    #[test]
    fn test_signature_is_stable_hmac() {
        let signature = sign_payload("{\"a\":1}", "secret");
        // Recomputing gives the same signature; a different secret does not.
        assert_eq!(signature, sign_payload("{\"a\":1}", "secret"));
        assert_ne!(signature, sign_payload("{\"a\":1}", "other"));
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn test_min_level_filter() {
        let (store, _f) = store();
        let webhook = register(&store, RiskLevel::High, vec![]);

        assert!(!should_deliver(&webhook, &assessment(RiskLevel::Low)));
        assert!(!should_deliver(&webhook, &assessment(RiskLevel::Medium)));
        assert!(should_deliver(&webhook, &assessment(RiskLevel::High)));
        assert!(should_deliver(&webhook, &assessment(RiskLevel::Critical)));
    }

    #[test]
    fn test_event_type_filter_empty_means_all() {
        let (store, _f) = store();
        let all = register(&store, RiskLevel::Low, vec![]);
        assert!(should_deliver(&all, &assessment(RiskLevel::Low)));

        let only_auth = register(
            &store,
            RiskLevel::Low,
            vec!["authentication.login".to_string()],
        );
        assert!(!should_deliver(&only_auth, &assessment(RiskLevel::Low)));
    }

    #[test]
    fn test_payload_shape() {
        let payload = build_payload(&assessment(RiskLevel::High), 2);
        assert_eq!(payload["event_id"], "evt_1");
        assert_eq!(payload["risk_level"], "high");
        assert_eq!(payload["recommended_action"], "challenge");
        assert_eq!(payload["webhook_attempt"], 2);
        assert_eq!(payload["triggered_rules"][0], "rapid_transactions");
    }

    #[test]
    fn test_retry_schedule_steps() {
        assert!(retry_at(true, 1, 3).is_none());
        assert!(retry_at(false, 3, 3).is_none());

        let first = retry_at(false, 1, 3).unwrap();
        let offset = (first - Utc::now()).num_seconds();
        assert!((59..=61).contains(&offset), "got {offset}");

        let second = retry_at(false, 2, 3).unwrap();
        let offset = (second - Utc::now()).num_seconds();
        assert!((299..=301).contains(&offset), "got {offset}");
    }

    #[tokio::test]
    async fn test_two_failures_then_success_history() {
        use axum::{extract::State, http::StatusCode, routing::post, Router};
        use std::sync::atomic::{AtomicU32, Ordering};

        // Endpoint that returns 500 twice, then 200.
        let hits = Arc::new(AtomicU32::new(0));
        let app = Router::new()
            .route(
                "/hook",
                post(|State(hits): State<Arc<AtomicU32>>| async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::OK
                    }
                }),
            )
            .with_state(hits.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (store, _f) = store();
        let (webhook, _) = store
            .register(
                "org_1",
                &format!("http://{addr}/hook"),
                vec![],
                RiskLevel::Low,
                None,
                5,
                3,
            )
            .unwrap();

        let dispatcher = WebhookDispatcher::new(store.clone());
        let assessment = assessment(RiskLevel::High);

        // Attempt 1 fails; 2 fails; 3 succeeds. The worker would space these
        // out by the retry schedule; the test drives them directly.
        for attempt in 1..=3 {
            let body = build_payload(&assessment, attempt).to_string();
            dispatcher
                .deliver(&webhook, &assessment.event_id, body, attempt)
                .await;
        }

        let history = store.deliveries(&webhook.id, 10).unwrap();
        assert_eq!(history.len(), 3);
        assert!(!history[0].is_successful);
        assert!(history[0].next_retry_at.is_some());
        assert!(!history[1].is_successful);
        assert!(history[1].next_retry_at.is_some());
        assert!(history[2].is_successful);
        assert!(history[2].next_retry_at.is_none());

        let webhook = store.by_id(&webhook.id).unwrap().unwrap();
        assert_eq!(webhook.total_deliveries, 3);
        assert_eq!(webhook.successful_deliveries, 1);
        assert_eq!(webhook.failed_deliveries, 2);
        assert!(webhook.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn test_final_attempt_stops_retrying() {
        let (store, _f) = store();
        // Unroutable port: every attempt errors.
        let (webhook, _) = store
            .register("org_1", "http://127.0.0.1:1/hook", vec![], RiskLevel::Low, None, 1, 3)
            .unwrap();

        let dispatcher = WebhookDispatcher::new(store.clone());
        let assessment = assessment(RiskLevel::High);

        for attempt in 1..=3 {
            let body = build_payload(&assessment, attempt).to_string();
            dispatcher
                .deliver(&webhook, &assessment.event_id, body, attempt)
                .await;
        }

        let history = store.deliveries(&webhook.id, 10).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[2].is_final_attempt);
        assert!(history[2].next_retry_at.is_none());
    }
}
