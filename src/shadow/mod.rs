//! Shadow-mode rule evaluation
//! Mission: Measure candidate rules against labeled ground truth without touching live decisions

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize)]
pub struct ShadowResult {
    pub id: String,
    pub org_id: String,
    pub rule_id: String,
    pub event_id: String,
    pub user_id: String,
    pub would_have_blocked: bool,
    /// 0-100 confidence reported by the shadow rule.
    pub confidence: f64,
    pub actual_fraud: Option<bool>,
    pub labeled_at: Option<DateTime<Utc>>,
    pub labeled_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What to do with a shadow rule based on measured f1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Promote,
    Tune,
    KeepInShadow,
}

impl Recommendation {
    fn from_f1(f1: f64) -> Self {
        if f1 >= 0.92 {
            Recommendation::Promote
        } else if f1 >= 0.80 {
            Recommendation::Tune
        } else {
            Recommendation::KeepInShadow
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccuracyReport {
    pub rule_id: String,
    pub window_hours: i64,
    pub labeled: usize,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub true_negatives: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub rule_a: AccuracyReport,
    pub rule_b: AccuracyReport,
    /// The decisively better rule id, when `|Δf1| > 0.05`.
    pub winner: Option<String>,
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS shadow_results (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    rule_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    would_have_blocked INTEGER NOT NULL,
    confidence REAL NOT NULL,
    actual_fraud INTEGER,
    labeled_at TEXT,
    labeled_by TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_shadow_rule_time
    ON shadow_results(org_id, rule_id, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_shadow_pending
    ON shadow_results(org_id, created_at DESC) WHERE actual_fraud IS NULL;
"#;

pub struct ShadowStore {
    conn: Arc<Mutex<Connection>>,
}

impl ShadowStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open shadow database: {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize shadow schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Record a shadow evaluation outcome.
    pub fn log_shadow(
        &self,
        org_id: &str,
        rule_id: &str,
        event_id: &str,
        user_id: &str,
        would_have_blocked: bool,
        confidence: f64,
    ) -> Result<ShadowResult> {
        let result = ShadowResult {
            id: Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            rule_id: rule_id.to_string(),
            event_id: event_id.to_string(),
            user_id: user_id.to_string(),
            would_have_blocked,
            confidence: confidence.clamp(0.0, 100.0),
            actual_fraud: None,
            labeled_at: None,
            labeled_by: None,
            created_at: Utc::now(),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO shadow_results
                 (id, org_id, rule_id, event_id, user_id, would_have_blocked,
                  confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                result.id,
                result.org_id,
                result.rule_id,
                result.event_id,
                result.user_id,
                result.would_have_blocked as i64,
                result.confidence,
                result.created_at.to_rfc3339(),
            ],
        )?;

        debug!(rule_id, event_id, would_have_blocked, "Shadow result logged");
        Ok(result)
    }

    /// Set ground truth exactly once. A second label is a `Conflict`.
    pub fn label(
        &self,
        result_id: &str,
        actual_fraud: bool,
        analyst: &str,
    ) -> EngineResult<ShadowResult> {
        let conn = self.conn.lock();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT actual_fraud FROM shadow_results WHERE id = ?1",
                params![result_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("shadow result {result_id}"))
                }
                other => EngineError::Transient(other.to_string()),
            })?;

        if existing.is_some() {
            return Err(EngineError::Conflict(format!(
                "shadow result {result_id} is already labeled"
            )));
        }

        conn.execute(
            "UPDATE shadow_results
             SET actual_fraud = ?2, labeled_at = ?3, labeled_by = ?4
             WHERE id = ?1",
            params![
                result_id,
                actual_fraud as i64,
                Utc::now().to_rfc3339(),
                analyst,
            ],
        )
        .map_err(|e| EngineError::Transient(e.to_string()))?;

        info!(result_id, actual_fraud, analyst, "Shadow result labeled");
        self.by_id(result_id)
            .map_err(|e| EngineError::Transient(e.to_string()))?
            .ok_or_else(|| EngineError::NotFound(format!("shadow result {result_id}")))
    }

    pub fn by_id(&self, result_id: &str) -> Result<Option<ShadowResult>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT id, org_id, rule_id, event_id, user_id, would_have_blocked,
                        confidence, actual_fraud, labeled_at, labeled_by, created_at
                 FROM shadow_results WHERE id = ?1",
                params![result_id],
                row_to_result,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(result)
    }

    /// TP/FP/FN/TN over labeled results in the window, with derived
    /// precision, recall, f1 (0/0 = 0) and a promotion recommendation.
    pub fn accuracy(
        &self,
        org_id: &str,
        rule_id: &str,
        window_hours: i64,
    ) -> Result<AccuracyReport> {
        let cutoff = Utc::now() - ChronoDuration::hours(window_hours);
        let labeled = self.labeled_since(org_id, rule_id, cutoff)?;
        Ok(build_accuracy(rule_id, window_hours, &labeled))
    }

    /// Per-day accuracy over the trailing `days`.
    pub fn trends(&self, org_id: &str, rule_id: &str, days: i64) -> Result<Vec<AccuracyReport>> {
        let mut out = Vec::new();
        let now = Utc::now();

        for day in (0..days).rev() {
            let end = now - ChronoDuration::days(day);
            let start = end - ChronoDuration::days(1);
            let labeled: Vec<(bool, bool)> = self
                .labeled_since(org_id, rule_id, start)?
                .into_iter()
                .filter(|(_, _, created)| *created < end)
                .map(|(blocked, fraud, _)| (blocked, fraud))
                .collect();

            let mut report = build_accuracy_pairs(rule_id, 24, &labeled);
            report.window_hours = 24;
            out.push(report);
        }
        Ok(out)
    }

    /// Side-by-side accuracy; winner requires a decisive f1 gap.
    pub fn compare(
        &self,
        org_id: &str,
        rule_a: &str,
        rule_b: &str,
        window_hours: i64,
    ) -> Result<ComparisonReport> {
        let a = self.accuracy(org_id, rule_a, window_hours)?;
        let b = self.accuracy(org_id, rule_b, window_hours)?;

        let winner = if (a.f1 - b.f1).abs() > 0.05 {
            Some(if a.f1 > b.f1 {
                rule_a.to_string()
            } else {
                rule_b.to_string()
            })
        } else {
            None
        };

        Ok(ComparisonReport {
            rule_a: a,
            rule_b: b,
            winner,
        })
    }

    /// Unlabeled results awaiting analyst review, newest first.
    pub fn pending_labels(&self, org_id: &str, limit: usize) -> Result<Vec<ShadowResult>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, org_id, rule_id, event_id, user_id, would_have_blocked,
                    confidence, actual_fraud, labeled_at, labeled_by, created_at
             FROM shadow_results
             WHERE org_id = ?1 AND actual_fraud IS NULL
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![org_id, limit as i64], row_to_result)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Labeled `(would_have_blocked, actual_fraud, created_at)` triples since
    /// the cutoff.
    fn labeled_since(
        &self,
        org_id: &str,
        rule_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(bool, bool, DateTime<Utc>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT would_have_blocked, actual_fraud, created_at
             FROM shadow_results
             WHERE org_id = ?1 AND rule_id = ?2 AND actual_fraud IS NOT NULL
               AND created_at >= ?3",
        )?;
        let rows = stmt.query_map(
            params![org_id, rule_id, cutoff.to_rfc3339()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? != 0,
                    row.get::<_, i64>(1)? != 0,
                    row.get::<_, String>(2)?,
                ))
            },
        )?;

        let mut out = Vec::new();
        for row in rows {
            let (blocked, fraud, created) = row?;
            let created = DateTime::parse_from_rfc3339(&created)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            out.push((blocked, fraud, created));
        }
        Ok(out)
    }
}

fn build_accuracy(
    rule_id: &str,
    window_hours: i64,
    labeled: &[(bool, bool, DateTime<Utc>)],
) -> AccuracyReport {
    let pairs: Vec<(bool, bool)> = labeled.iter().map(|(b, f, _)| (*b, *f)).collect();
    build_accuracy_pairs(rule_id, window_hours, &pairs)
}

fn build_accuracy_pairs(
    rule_id: &str,
    window_hours: i64,
    labeled: &[(bool, bool)],
) -> AccuracyReport {
    let mut tp = 0;
    let mut fp = 0;
    let mut fn_ = 0;
    let mut tn = 0;
    for &(blocked, fraud) in labeled {
        match (blocked, fraud) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => tn += 1,
        }
    }

    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    AccuracyReport {
        rule_id: rule_id.to_string(),
        window_hours,
        labeled: labeled.len(),
        true_positives: tp,
        false_positives: fp,
        false_negatives: fn_,
        true_negatives: tn,
        precision,
        recall,
        f1,
        recommendation: Recommendation::from_f1(f1),
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn row_to_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShadowResult> {
    let labeled_at: Option<String> = row.get(8)?;
    let created_at: String = row.get(10)?;
    Ok(ShadowResult {
        id: row.get(0)?,
        org_id: row.get(1)?,
        rule_id: row.get(2)?,
        event_id: row.get(3)?,
        user_id: row.get(4)?,
        would_have_blocked: row.get::<_, i64>(5)? != 0,
        confidence: row.get(6)?,
        actual_fraud: row.get::<_, Option<i64>>(7)?.map(|v| v != 0),
        labeled_at: labeled_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }),
        labeled_by: row.get(9)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Per-day trend rows keyed by date, for the trends endpoint response shape.
pub fn trend_map(reports: &[AccuracyReport]) -> BTreeMap<String, &AccuracyReport> {
    let now = Utc::now();
    reports
        .iter()
        .enumerate()
        .map(|(i, report)| {
            let date = now - ChronoDuration::days((reports.len() - 1 - i) as i64);
            (date.format("%Y-%m-%d").to_string(), report)
        })
        .collect()
}
