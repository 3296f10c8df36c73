//! Cryptographically chained audit log
//! Mission: Tamper-evident, append-only trail per organization

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Field-name substrings that are redacted from audit payloads. Structural,
/// recursive over nested maps and lists. The regex-based request-log scrubber
/// is a separate concern and must not be coupled here.
const SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "credit_card",
    "cvv",
    "ssn",
    "email",
    "phone",
    "account_number",
    "iban",
];

const REDACTED: &str = "[REDACTED]";

/// Redact any field whose name contains a sensitive substring, recursively.
pub fn scrub_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut scrubbed = serde_json::Map::new();
            for (key, val) in map {
                let lower = key.to_lowercase();
                if SENSITIVE_FIELDS.iter().any(|s| lower.contains(s)) {
                    scrubbed.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    scrubbed.insert(key.clone(), scrub_payload(val));
                }
            }
            Value::Object(scrubbed)
        }
        Value::Array(items) => Value::Array(items.iter().map(scrub_payload).collect()),
        other => other.clone(),
    }
}

/// What a subsystem submits for appending.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub actor_id: Option<String>,
    pub actor_role: Option<String>,
    pub event_type: String,
    pub resource_type: String,
    pub resource_id: String,
    pub payload: Value,
    pub shadow_mode: bool,
}

/// A persisted chain entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: String,
    pub org_id: String,
    pub sequence: i64,
    pub actor_id: Option<String>,
    pub actor_role: Option<String>,
    pub event_type: String,
    pub resource_type: String,
    pub resource_id: String,
    pub payload: Value,
    pub prev_hash: Option<String>,
    pub curr_hash: String,
    pub shadow_mode: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainAnomaly {
    pub sequence: i64,
    pub kind: AnomalyKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    HashMismatch,
    BrokenLink,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainReport {
    pub org_id: String,
    pub entries_checked: usize,
    pub intact: bool,
    pub anomalies: Vec<ChainAnomaly>,
}

/// Compliance frameworks a report can be tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Soc2,
    PciDss,
    Gdpr,
    Ofac,
}

impl ReportKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "soc2" => Some(ReportKind::Soc2),
            "pci_dss" => Some(ReportKind::PciDss),
            "gdpr" => Some(ReportKind::Gdpr),
            "ofac" => Some(ReportKind::Ofac),
            _ => None,
        }
    }

    /// Control identifiers the framework cares about.
    pub fn controls(&self) -> &'static [&'static str] {
        match self {
            ReportKind::Soc2 => &["CC6.1", "CC7.2", "CC7.3", "CC8.1"],
            ReportKind::PciDss => &["10.2", "10.3", "10.5.5"],
            ReportKind::Gdpr => &["Art.30", "Art.32", "Art.33"],
            ReportKind::Ofac => &["31CFR501.603", "31CFR501.604"],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    pub org_id: String,
    pub framework: ReportKind,
    pub controls: Vec<String>,
    pub chain_intact: bool,
    pub anomaly_count: usize,
    pub total_entries: usize,
    pub by_event_type: BTreeMap<String, u64>,
    pub by_actor: BTreeMap<String, u64>,
    pub first_entry_at: Option<DateTime<Utc>>,
    pub last_entry_at: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS audit_log (
    org_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    id TEXT NOT NULL,
    actor_id TEXT,
    actor_role TEXT,
    event_type TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    prev_hash TEXT,
    curr_hash TEXT NOT NULL,
    shadow_mode INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    PRIMARY KEY (org_id, sequence)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_audit_event_type
    ON audit_log(org_id, event_type, created_at);

CREATE INDEX IF NOT EXISTS idx_audit_actor
    ON audit_log(org_id, actor_id, created_at);
"#;

/// Append-only chained log. Appends are serialized per store (the connection
/// lock covers the tail read and the insert), which linearizes the chain per
/// organization. Verification reads a snapshot and never blocks appenders
/// beyond the row reads.
pub struct AuditChain {
    conn: Arc<Mutex<Connection>>,
}

impl AuditChain {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open audit database: {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize audit schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append an entry, chaining it to the org's current tail.
    pub fn append(&self, org_id: &str, record: AuditRecord) -> Result<AuditEntry> {
        let scrubbed = scrub_payload(&record.payload);
        let created_at = Utc::now();
        let timestamp = created_at.to_rfc3339();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let tail: Option<(i64, String)> = tx
            .query_row(
                "SELECT sequence, curr_hash FROM audit_log
                 WHERE org_id = ?1 ORDER BY sequence DESC LIMIT 1",
                params![org_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let (sequence, prev_hash) = match tail {
            Some((seq, hash)) => (seq + 1, Some(hash)),
            None => (1, None),
        };

        let canonical_payload = serde_json::to_string(&scrubbed)?;
        let curr_hash = chain_hash(
            prev_hash.as_deref(),
            record.actor_id.as_deref(),
            &record.event_type,
            &canonical_payload,
            &timestamp,
        );

        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            sequence,
            actor_id: record.actor_id,
            actor_role: record.actor_role,
            event_type: record.event_type,
            resource_type: record.resource_type,
            resource_id: record.resource_id,
            payload: scrubbed,
            prev_hash,
            curr_hash,
            shadow_mode: record.shadow_mode,
            created_at,
        };

        tx.execute(
            "INSERT INTO audit_log (org_id, sequence, id, actor_id, actor_role, event_type,
                                    resource_type, resource_id, payload, prev_hash, curr_hash,
                                    shadow_mode, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.org_id,
                entry.sequence,
                entry.id,
                entry.actor_id,
                entry.actor_role,
                entry.event_type,
                entry.resource_type,
                entry.resource_id,
                canonical_payload,
                entry.prev_hash,
                entry.curr_hash,
                entry.shadow_mode as i64,
                timestamp,
            ],
        )?;
        tx.commit()?;

        debug!(
            org_id = %entry.org_id,
            sequence = entry.sequence,
            event_type = %entry.event_type,
            "Audit entry appended"
        );
        Ok(entry)
    }

    /// Walk the org's chain and recompute every hash. Reports each mismatch
    /// and broken link by sequence; safe to run concurrently with appends.
    pub fn verify(&self, org_id: &str) -> Result<ChainReport> {
        let entries = self.entries_in_order(org_id)?;
        let mut anomalies = Vec::new();
        // The verifier trusts nothing stored: links are checked against the
        // recomputed hash of the prior entry, so tampering with entry N also
        // surfaces N+1 as chain-broken.
        let mut recomputed_prev: Option<String> = None;

        for entry in &entries {
            let canonical_payload = serde_json::to_string(&entry.payload)?;
            let expected = chain_hash(
                entry.prev_hash.as_deref(),
                entry.actor_id.as_deref(),
                &entry.event_type,
                &canonical_payload,
                &entry.created_at.to_rfc3339(),
            );

            if expected != entry.curr_hash {
                anomalies.push(ChainAnomaly {
                    sequence: entry.sequence,
                    kind: AnomalyKind::HashMismatch,
                    detail: format!(
                        "stored hash {} does not match recomputed {}",
                        &entry.curr_hash[..12.min(entry.curr_hash.len())],
                        &expected[..12]
                    ),
                });
            }

            if let Some(prev) = &recomputed_prev {
                if entry.prev_hash.as_deref() != Some(prev.as_str()) {
                    anomalies.push(ChainAnomaly {
                        sequence: entry.sequence,
                        kind: AnomalyKind::BrokenLink,
                        detail: "prev_hash does not match recomputed hash of prior entry"
                            .to_string(),
                    });
                }
            } else if entry.prev_hash.is_some() && entry.sequence != 1 {
                // First stored entry claims a predecessor we cannot see.
                anomalies.push(ChainAnomaly {
                    sequence: entry.sequence,
                    kind: AnomalyKind::BrokenLink,
                    detail: "chain does not start at sequence 1".to_string(),
                });
            }

            // What the NEXT entry's prev_hash should be.
            recomputed_prev = Some(expected);
        }

        if !anomalies.is_empty() {
            warn!(
                org_id,
                anomalies = anomalies.len(),
                "Audit chain verification found anomalies"
            );
            metrics::increment_counter!("audit_chain_anomalies_total");
        }

        Ok(ChainReport {
            org_id: org_id.to_string(),
            entries_checked: entries.len(),
            intact: anomalies.is_empty(),
            anomalies,
        })
    }

    /// Like [`verify`], but a broken chain surfaces as the typed
    /// `IntegrityBreach` error kind. Used by the background chain monitor;
    /// the HTTP verify endpoint keeps returning the full anomaly list.
    ///
    /// [`verify`]: AuditChain::verify
    pub fn verify_strict(&self, org_id: &str) -> EngineResult<ChainReport> {
        let report = self
            .verify(org_id)
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        if report.intact {
            return Ok(report);
        }

        let first = report
            .anomalies
            .first()
            .map(|a| a.sequence)
            .unwrap_or_default();
        Err(EngineError::IntegrityBreach(format!(
            "org {org_id}: {} anomalies, first at sequence {first}",
            report.anomalies.len()
        )))
    }

    /// Organizations with at least one chain entry.
    pub fn org_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT org_id FROM audit_log ORDER BY org_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Recent entries with optional filters, newest first.
    pub fn recent(
        &self,
        org_id: &str,
        event_type: Option<&str>,
        actor_id: Option<&str>,
        resource_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT org_id, sequence, id, actor_id, actor_role, event_type, resource_type,
                    resource_id, payload, prev_hash, curr_hash, shadow_mode, created_at
             FROM audit_log WHERE org_id = ?1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(org_id.to_string())];

        if let Some(et) = event_type {
            args.push(Box::new(et.to_string()));
            sql.push_str(&format!(" AND event_type = ?{}", args.len()));
        }
        if let Some(actor) = actor_id {
            args.push(Box::new(actor.to_string()));
            sql.push_str(&format!(" AND actor_id = ?{}", args.len()));
        }
        if let Some(rt) = resource_type {
            args.push(Box::new(rt.to_string()));
            sql.push_str(&format!(" AND resource_type = ?{}", args.len()));
        }
        args.push(Box::new(limit as i64));
        sql.push_str(&format!(
            " ORDER BY sequence DESC LIMIT ?{}",
            args.len()
        ));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            row_to_entry,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Chain status plus per-event-type and per-actor counts, tagged with the
    /// framework's control identifiers.
    pub fn compliance_report(&self, org_id: &str, kind: ReportKind) -> Result<ComplianceReport> {
        let chain = self.verify(org_id)?;
        let conn = self.conn.lock();

        let mut by_event_type = BTreeMap::new();
        let mut stmt = conn.prepare(
            "SELECT event_type, COUNT(*) FROM audit_log WHERE org_id = ?1 GROUP BY event_type",
        )?;
        let rows = stmt.query_map(params![org_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (event_type, count) = row?;
            by_event_type.insert(event_type, count);
        }

        let mut by_actor = BTreeMap::new();
        let mut stmt = conn.prepare(
            "SELECT COALESCE(actor_id, 'system'), COUNT(*) FROM audit_log
             WHERE org_id = ?1 GROUP BY COALESCE(actor_id, 'system')",
        )?;
        let rows = stmt.query_map(params![org_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (actor, count) = row?;
            by_actor.insert(actor, count);
        }

        let span: (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(created_at), MAX(created_at) FROM audit_log WHERE org_id = ?1",
            params![org_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(ComplianceReport {
            org_id: org_id.to_string(),
            framework: kind,
            controls: kind.controls().iter().map(|c| c.to_string()).collect(),
            chain_intact: chain.intact,
            anomaly_count: chain.anomalies.len(),
            total_entries: chain.entries_checked,
            by_event_type,
            by_actor,
            first_entry_at: span.0.and_then(parse_ts),
            last_entry_at: span.1.and_then(parse_ts),
            generated_at: Utc::now(),
        })
    }

    fn entries_in_order(&self, org_id: &str) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT org_id, sequence, id, actor_id, actor_role, event_type, resource_type,
                    resource_id, payload, prev_hash, curr_hash, shadow_mode, created_at
             FROM audit_log WHERE org_id = ?1 ORDER BY sequence ASC",
        )?;
        let rows = stmt.query_map(params![org_id], row_to_entry)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Test and tamper-detection hook: raw write access used only by tests.
    #[cfg(test)]
    fn raw_conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

/// Background compliance verifier: periodically re-walks every org's chain.
/// A breach is reported and counted but never halts the service.
pub async fn run_chain_verifier(chain: Arc<AuditChain>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let orgs = match chain.org_ids() {
            Ok(orgs) => orgs,
            Err(e) => {
                error!(error = %e, "Chain verifier could not list organizations");
                continue;
            }
        };

        for org in orgs {
            match chain.verify_strict(&org) {
                Ok(report) => {
                    debug!(org_id = %org, entries = report.entries_checked, "Chain verified")
                }
                Err(EngineError::IntegrityBreach(detail)) => {
                    metrics::increment_counter!("audit_chain_breaches_total");
                    error!(org_id = %org, detail = %detail, "⛓️  Audit chain integrity breach");
                }
                Err(e) => error!(org_id = %org, error = %e, "Chain verification failed"),
            }
        }
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let payload_text: String = row.get(8)?;
    let created_at_text: String = row.get(12)?;
    Ok(AuditEntry {
        org_id: row.get(0)?,
        sequence: row.get(1)?,
        id: row.get(2)?,
        actor_id: row.get(3)?,
        actor_role: row.get(4)?,
        event_type: row.get(5)?,
        resource_type: row.get(6)?,
        resource_id: row.get(7)?,
        payload: serde_json::from_str(&payload_text).unwrap_or(Value::Null),
        prev_hash: row.get(9)?,
        curr_hash: row.get(10)?,
        shadow_mode: row.get::<_, i64>(11)? != 0,
        created_at: parse_ts(created_at_text).unwrap_or_else(Utc::now),
    })
}

fn parse_ts(s: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// `curr_hash = sha256(prev_hash || actor_id || event_type || payload || timestamp)`,
/// absent fields contributing the empty string.
fn chain_hash(
    prev_hash: Option<&str>,
    actor_id: Option<&str>,
    event_type: &str,
    canonical_payload: &str,
    timestamp: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.unwrap_or(""));
    hasher.update(actor_id.unwrap_or(""));
    hasher.update(event_type);
    hasher.update(canonical_payload);
    hasher.update(timestamp);
    hex::encode(hasher.finalize())
}
