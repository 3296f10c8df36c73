//! Audit & compliance endpoints
//! Mission: Read-only access to the chain, its verifier, and compliance reports

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::audit::ReportKind;
use crate::auth::{require_role, Claims, Role};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub event_type: Option<String>,
    pub actor_id: Option<String>,
    pub resource_type: Option<String>,
    pub limit: Option<usize>,
}

pub async fn logs(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<LogsQuery>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let entries = state
        .audit
        .recent(
            &claims.org_id,
            query.event_type.as_deref(),
            query.actor_id.as_deref(),
            query.resource_type.as_deref(),
            query.limit.unwrap_or(100).min(1000),
        )
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok(Json(json!({
        "count": entries.len(),
        "entries": entries,
    })))
}

pub async fn verify(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let report = state
        .audit
        .verify(&claims.org_id)
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok(Json(json!({
        "org_id": report.org_id,
        "entries_checked": report.entries_checked,
        "intact": report.intact,
        "anomalies": report.anomalies,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub report_type: Option<String>,
}

pub async fn compliance_report(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ReportQuery>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let kind_str = query.report_type.as_deref().unwrap_or("soc2");
    let kind = ReportKind::from_str(kind_str)
        .ok_or_else(|| EngineError::InvalidInput(format!("unknown report_type: {kind_str}")))?;

    let report = state
        .audit
        .compliance_report(&claims.org_id, kind)
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok(Json(serde_json::to_value(report).map_err(|e| {
        EngineError::Transient(e.to_string())
    })?))
}
