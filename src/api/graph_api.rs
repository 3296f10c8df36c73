//! Link-analysis endpoints
//! Mission: Expose ring structure, hubs, and graph views to analysts

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

#[derive(Debug, Deserialize)]
pub struct DepthQuery {
    pub max_depth: Option<usize>,
}

pub async fn user_connections(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<String>,
    Query(query): Query<DepthQuery>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let depth = query.max_depth.unwrap_or(3).clamp(1, 6);
    let mut connected: Vec<String> = state
        .graph
        .connected(&claims.org_id, &user_id, depth)
        .map_err(|e| EngineError::Transient(e.to_string()))?
        .into_iter()
        .collect();
    connected.sort();

    Ok(Json(json!({
        "user_id": user_id,
        "max_depth": depth,
        "count": connected.len(),
        "connected_users": connected,
    })))
}

pub async fn ring(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<String>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let analysis = state
        .graph
        .ring_analysis(&claims.org_id, &user_id)
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok(Json(serde_json::to_value(analysis).map_err(|e| {
        EngineError::Transient(e.to_string())
    })?))
}

#[derive(Debug, Deserialize)]
pub struct HubsQuery {
    pub limit: Option<usize>,
}

pub async fn hubs(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<HubsQuery>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let hubs = state
        .graph
        .top_hubs(&claims.org_id, query.limit.unwrap_or(10).min(100))
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok(Json(json!({
        "count": hubs.len(),
        "hubs": hubs,
    })))
}

pub async fn graph_data(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(user_id): Path<String>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    let data = state
        .graph
        .graph_data(&claims.org_id, &user_id, &state.decisions)
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok(Json(serde_json::to_value(data).map_err(|e| {
        EngineError::Transient(e.to_string())
    })?))
}

#[derive(Debug, Deserialize)]
pub struct FlagRingRequest {
    pub users: Vec<String>,
    pub reason: String,
}

pub async fn flag_ring(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(request): Json<FlagRingRequest>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;

    if request.users.len() < 2 {
        return Err(EngineError::InvalidInput(
            "a ring needs at least two users".to_string(),
        ));
    }

    let flagged = state
        .graph
        .flag_ring(&claims.org_id, &request.users, &request.reason)
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    let record = AuditRecord {
        actor_id: Some(claims.sub.clone()),
        actor_role: Some(claims.role.as_str().to_string()),
        event_type: "link_analysis.ring_flagged".to_string(),
        resource_type: "user_connection".to_string(),
        resource_id: request.users.join(","),
        payload: json!({
            "users": request.users,
            "reason": request.reason,
            "edges_flagged": flagged,
        }),
        shadow_mode: false,
    };
    if let Err(e) = state.audit.append(&claims.org_id, record) {
        warn!(error = %e, "Failed to audit ring flag");
    }

    Ok(Json(json!({
        "status": "flagged",
        "edges_flagged": flagged,
    })))
}
