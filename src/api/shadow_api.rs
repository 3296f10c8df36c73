//! Shadow-mode endpoints
//! Mission: Log shadow evaluations, label ground truth, and read accuracy reports

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::api::AppState;
use crate::audit::AuditRecord;
use crate::auth::{require_role, Claims, Role};
use crate::error::{EngineError, EngineResult};
use crate::shadow::trend_map;

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub rule_id: String,
    pub event_id: String,
    pub user_id: String,
    pub would_have_blocked: bool,
    /// 0-100.
    #[serde(default)]
    pub confidence: f64,
}

pub async fn evaluate(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(request): Json<EvaluateRequest>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let result = state
        .shadow
        .log_shadow(
            &claims.org_id,
            &request.rule_id,
            &request.event_id,
            &request.user_id,
            request.would_have_blocked,
            request.confidence,
        )
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok(Json(json!({
        "status": "logged",
        "result": result,
    })))
}

#[derive(Debug, Deserialize)]
pub struct LabelRequest {
    pub actual_fraud: bool,
}

pub async fn label(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<String>,
    Json(request): Json<LabelRequest>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let result = state.shadow.label(&id, request.actual_fraud, &claims.username)?;

    let record = AuditRecord {
        actor_id: Some(claims.sub.clone()),
        actor_role: Some(claims.role.as_str().to_string()),
        event_type: "shadow.labeled".to_string(),
        resource_type: "shadow_result".to_string(),
        resource_id: id,
        payload: json!({
            "rule_id": result.rule_id,
            "event_id": result.event_id,
            "actual_fraud": request.actual_fraud,
        }),
        shadow_mode: true,
    };
    if let Err(e) = state.audit.append(&claims.org_id, record) {
        warn!(error = %e, "Failed to audit shadow label");
    }

    Ok(Json(json!({
        "status": "labeled",
        "result": result,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AccuracyQuery {
    pub window_hours: Option<i64>,
}

pub async fn accuracy(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(rule_id): Path<String>,
    Query(query): Query<AccuracyQuery>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let report = state
        .shadow
        .accuracy(&claims.org_id, &rule_id, query.window_hours.unwrap_or(168))
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok(Json(serde_json::to_value(report).map_err(|e| {
        EngineError::Transient(e.to_string())
    })?))
}

#[derive(Debug, Deserialize)]
pub struct TrendsQuery {
    pub days: Option<i64>,
}

pub async fn trends(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(rule_id): Path<String>,
    Query(query): Query<TrendsQuery>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let reports = state
        .shadow
        .trends(&claims.org_id, &rule_id, query.days.unwrap_or(7).clamp(1, 90))
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok(Json(json!({
        "rule_id": rule_id,
        "days": reports.len(),
        "daily": trend_map(&reports),
    })))
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub rule_a: String,
    pub rule_b: String,
    pub window_hours: Option<i64>,
}

pub async fn compare(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<CompareQuery>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let report = state
        .shadow
        .compare(
            &claims.org_id,
            &query.rule_a,
            &query.rule_b,
            query.window_hours.unwrap_or(168),
        )
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok(Json(serde_json::to_value(report).map_err(|e| {
        EngineError::Transient(e.to_string())
    })?))
}

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub limit: Option<usize>,
}

pub async fn pending_labels(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<PendingQuery>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let pending = state
        .shadow
        .pending_labels(&claims.org_id, query.limit.unwrap_or(50).min(500))
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok(Json(json!({
        "count": pending.len(),
        "pending": pending,
    })))
}
