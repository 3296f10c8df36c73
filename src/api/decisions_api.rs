//! Decision query endpoints
//! Mission: Review recorded decisions and the rule trace behind them

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::auth::{require_role, Claims, Role};
use crate::error::{EngineError, EngineResult};

pub async fn get_decision(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(event_id): Path<String>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let decision = state
        .decisions
        .by_event_id(&event_id)
        .map_err(|e| EngineError::Transient(e.to_string()))?
        .ok_or_else(|| EngineError::NotFound(format!("decision for event {event_id}")))?;

    if decision.org_id != claims.org_id {
        return Err(EngineError::NotFound(format!("decision for event {event_id}")));
    }

    let trace = state
        .decisions
        .evaluations_for(&decision.id)
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok(Json(json!({
        "decision": decision,
        "rule_evaluations": trace,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_decisions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ListQuery>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let decisions = state
        .decisions
        .recent(
            &claims.org_id,
            query.user_id.as_deref(),
            query.limit.unwrap_or(100).min(1000),
        )
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok(Json(json!({
        "count": decisions.len(),
        "decisions": decisions,
    })))
}
