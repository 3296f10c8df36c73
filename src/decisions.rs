//! Risk decision storage
//! Mission: One immutable decision row per event, with its rule-evaluation trace

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::models::{
    RecommendedAction, RiskAssessment, RiskLevel, RuleCategory, RuleEvaluationRecord,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS risk_decisions (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL UNIQUE,
    event_type TEXT NOT NULL,
    org_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    risk_score REAL NOT NULL,
    risk_level TEXT NOT NULL,
    recommended_action TEXT NOT NULL,
    triggered_rules TEXT NOT NULL,
    hard_rules_triggered TEXT NOT NULL,
    velocity_alerts TEXT NOT NULL,
    behavioral_flags TEXT NOT NULL,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_decisions_user_time
    ON risk_decisions(org_id, user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS rule_evaluations (
    id TEXT PRIMARY KEY,
    decision_id TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    rule_name TEXT NOT NULL,
    rule_category TEXT NOT NULL,
    matched INTEGER NOT NULL,
    score_contribution REAL NOT NULL,
    condition_snapshot TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_rule_evals_decision
    ON rule_evaluations(decision_id);
"#;

pub struct DecisionStore {
    conn: Arc<Mutex<Connection>>,
}

impl DecisionStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open decisions database: {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize decisions schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Persist a decision with its evaluation trace in one transaction.
    /// A second decision for the same event is rejected by the unique
    /// constraint, which keeps consumers idempotent on `event_id`.
    pub fn insert(
        &self,
        assessment: &RiskAssessment,
        evaluations: &[RuleEvaluationRecord],
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO risk_decisions
                 (id, event_id, event_type, org_id, user_id, risk_score, risk_level,
                  recommended_action, triggered_rules, hard_rules_triggered,
                  velocity_alerts, behavioral_flags, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                assessment.id,
                assessment.event_id,
                assessment.event_type,
                assessment.org_id,
                assessment.user_id,
                assessment.risk_score,
                assessment.risk_level.as_str(),
                assessment.recommended_action.as_str(),
                serde_json::to_string(&assessment.triggered_rules)?,
                serde_json::to_string(&assessment.hard_rules_triggered)?,
                serde_json::to_string(&assessment.velocity_alerts)?,
                serde_json::to_string(&assessment.behavioral_flags)?,
                assessment.confidence,
                assessment.created_at.to_rfc3339(),
            ],
        )?;

        if inserted == 0 {
            // Duplicate delivery of the same event; drop the trace too.
            tx.commit()?;
            return Ok(false);
        }

        let now = Utc::now().to_rfc3339();
        for eval in evaluations {
            tx.execute(
                "INSERT INTO rule_evaluations
                     (id, decision_id, rule_id, rule_name, rule_category, matched,
                      score_contribution, condition_snapshot, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    Uuid::new_v4().to_string(),
                    assessment.id,
                    eval.rule_id,
                    eval.rule_name,
                    eval.category.as_str(),
                    eval.matched as i64,
                    eval.score_contribution,
                    serde_json::to_string(&eval.condition_snapshot)?,
                    now,
                ],
            )?;
        }
        tx.commit()?;

        debug!(
            event_id = %assessment.event_id,
            action = assessment.recommended_action.as_str(),
            score = assessment.risk_score,
            "Decision recorded"
        );
        Ok(true)
    }

    pub fn by_event_id(&self, event_id: &str) -> Result<Option<RiskAssessment>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT id, event_id, event_type, org_id, user_id, risk_score, risk_level,
                        recommended_action, triggered_rules, hard_rules_triggered,
                        velocity_alerts, behavioral_flags, confidence, created_at
                 FROM risk_decisions WHERE event_id = ?1",
                params![event_id],
                row_to_assessment,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(result)
    }

    pub fn recent(
        &self,
        org_id: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RiskAssessment>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();

        if let Some(user) = user_id {
            let mut stmt = conn.prepare(
                "SELECT id, event_id, event_type, org_id, user_id, risk_score, risk_level,
                        recommended_action, triggered_rules, hard_rules_triggered,
                        velocity_alerts, behavioral_flags, confidence, created_at
                 FROM risk_decisions WHERE org_id = ?1 AND user_id = ?2
                 ORDER BY created_at DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![org_id, user, limit as i64], row_to_assessment)?;
            for row in rows {
                out.push(row?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, event_id, event_type, org_id, user_id, risk_score, risk_level,
                        recommended_action, triggered_rules, hard_rules_triggered,
                        velocity_alerts, behavioral_flags, confidence, created_at
                 FROM risk_decisions WHERE org_id = ?1
                 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![org_id, limit as i64], row_to_assessment)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    /// Most recent risk level for a user, used for graph badges.
    pub fn latest_level(&self, org_id: &str, user_id: &str) -> Result<Option<RiskLevel>> {
        let conn = self.conn.lock();
        let level = conn
            .query_row(
                "SELECT risk_level FROM risk_decisions
                 WHERE org_id = ?1 AND user_id = ?2
                 ORDER BY created_at DESC LIMIT 1",
                params![org_id, user_id],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(level.and_then(|l| RiskLevel::from_str(&l)))
    }

    pub fn evaluations_for(&self, decision_id: &str) -> Result<Vec<RuleEvaluationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT rule_id, rule_name, rule_category, matched, score_contribution,
                    condition_snapshot
             FROM rule_evaluations WHERE decision_id = ?1",
        )?;
        let rows = stmt.query_map(params![decision_id], |row| {
            let category: String = row.get(2)?;
            let snapshot: Option<String> = row.get(5)?;
            Ok(RuleEvaluationRecord {
                rule_id: row.get(0)?,
                rule_name: row.get(1)?,
                category: match category.as_str() {
                    "hard" => RuleCategory::Hard,
                    "velocity" => RuleCategory::Velocity,
                    _ => RuleCategory::Behavioral,
                },
                matched: row.get::<_, i64>(3)? != 0,
                score_contribution: row.get(4)?,
                condition_snapshot: snapshot
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or(serde_json::Value::Null),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

fn row_to_assessment(row: &rusqlite::Row<'_>) -> rusqlite::Result<RiskAssessment> {
    let parse_list = |s: String| -> Vec<String> {
        serde_json::from_str(&s).unwrap_or_default()
    };
    let created_at: String = row.get(13)?;

    Ok(RiskAssessment {
        id: row.get(0)?,
        event_id: row.get(1)?,
        event_type: row.get(2)?,
        org_id: row.get(3)?,
        user_id: row.get(4)?,
        risk_score: row.get(5)?,
        risk_level: RiskLevel::from_str(&row.get::<_, String>(6)?).unwrap_or(RiskLevel::Low),
        recommended_action: RecommendedAction::from_str(&row.get::<_, String>(7)?)
            .unwrap_or(RecommendedAction::Allow),
        triggered_rules: parse_list(row.get(8)?),
        hard_rules_triggered: parse_list(row.get(9)?),
        velocity_alerts: parse_list(row.get(10)?),
        behavioral_flags: parse_list(row.get(11)?),
        confidence: row.get(12)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActorContext, Event};
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn assessment(event_id: &str, user_id: &str) -> RiskAssessment {
        let event = Event {
            event_id: event_id.to_string(),
            event_type: "transaction.attempted".to_string(),
            org_id: "org_1".to_string(),
            timestamp: Utc::now(),
            actor: ActorContext {
                user_id: user_id.to_string(),
                ip_address: String::new(),
                user_agent: String::new(),
                device_fingerprint: String::new(),
                session_id: None,
            },
            context: Default::default(),
            payload: json!({}),
        };
        let mut a = RiskAssessment::new(&event);
        a.risk_score = 0.65;
        a.risk_level = RiskLevel::High;
        a.recommended_action = RecommendedAction::Challenge;
        a.triggered_rules = vec!["rapid_transactions".to_string()];
        a
    }

    fn store() -> (DecisionStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = DecisionStore::new(file.path().to_str().unwrap()).unwrap();
        (store, file)
    }

    #[test]
    fn test_insert_and_fetch() {
        let (store, _f) = store();
        let a = assessment("evt_1", "u_1");
        let evals = vec![RuleEvaluationRecord {
            rule_id: "rapid_transactions".to_string(),
            rule_name: "Rapid transactions".to_string(),
            category: RuleCategory::Velocity,
            matched: true,
            score_contribution: 0.7,
            condition_snapshot: json!({"hourly_count": 21}),
        }];

        assert!(store.insert(&a, &evals).unwrap());

        let fetched = store.by_event_id("evt_1").unwrap().unwrap();
        assert_eq!(fetched.risk_level, RiskLevel::High);
        assert_eq!(fetched.triggered_rules, vec!["rapid_transactions"]);

        let trace = store.evaluations_for(&fetched.id).unwrap();
        assert_eq!(trace.len(), 1);
        assert!(trace[0].matched);
        assert_eq!(trace[0].condition_snapshot["hourly_count"], 21);
    }

    #[test]
    fn test_duplicate_event_is_idempotent() {
        let (store, _f) = store();
        let a = assessment("evt_1", "u_1");
        assert!(store.insert(&a, &[]).unwrap());

        let replay = assessment("evt_1", "u_1");
        assert!(!store.insert(&replay, &[]).unwrap());
        assert_eq!(store.recent("org_1", None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_latest_level_for_user() {
        let (store, _f) = store();
        assert!(store.latest_level("org_1", "u_1").unwrap().is_none());

        store.insert(&assessment("evt_1", "u_1"), &[]).unwrap();
        assert_eq!(
            store.latest_level("org_1", "u_1").unwrap(),
            Some(RiskLevel::High)
        );
    }

    #[test]
    fn test_recent_scoped_by_user() {
        let (store, _f) = store();
        store.insert(&assessment("evt_1", "u_1"), &[]).unwrap();
        store.insert(&assessment("evt_2", "u_2"), &[]).unwrap();

        assert_eq!(store.recent("org_1", Some("u_1"), 10).unwrap().len(), 1);
        assert_eq!(store.recent("org_1", None, 10).unwrap().len(), 2);
        assert_eq!(store.recent("org_other", None, 10).unwrap().len(), 0);
    }
}
