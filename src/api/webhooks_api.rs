//! Webhook management endpoints
//! Mission: Register endpoints (secret issued once), inspect stats and history

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::auth::{require_role, Claims, Role};
use crate::error::{EngineError, EngineResult};
use crate::models::RiskLevel;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub url: String,
    #[serde(default)]
    pub event_types: Vec<String>,
    pub min_risk_level: Option<String>,
    pub description: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
}

/// Register a webhook. The signing secret is generated server-side and
/// appears only in this response.
pub async fn register(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(request): Json<RegisterRequest>,
) -> EngineResult<(StatusCode, Json<Value>)> {
    require_role(&claims, Role::Admin)?;

    if !request.url.starts_with("http://") && !request.url.starts_with("https://") {
        return Err(EngineError::InvalidInput(
            "url must be http(s)".to_string(),
        ));
    }

    let min_level = match request.min_risk_level.as_deref() {
        None => RiskLevel::Low,
        Some(s) => RiskLevel::from_str(s)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown risk level: {s}")))?,
    };

    let (webhook, secret) = state
        .webhooks
        .register(
            &claims.org_id,
            &request.url,
            request.event_types,
            min_level,
            request.description,
            request.timeout_seconds.unwrap_or(state.config.webhook_timeout_secs),
            request.max_retries.unwrap_or(state.config.webhook_max_retries),
        )
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "webhook": webhook,
            // Shown exactly once; store it now.
            "secret": secret,
        })),
    ))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Admin)?;

    let webhooks = state
        .webhooks
        .list(&claims.org_id)
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    let summaries: Vec<Value> = webhooks
        .iter()
        .map(|w| {
            json!({
                "webhook": w,
                "success_rate": w.success_rate(),
            })
        })
        .collect();

    Ok(Json(json!({
        "count": summaries.len(),
        "webhooks": summaries,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeliveriesQuery {
    pub limit: Option<usize>,
}

pub async fn deliveries(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(webhook_id): Path<String>,
    Query(query): Query<DeliveriesQuery>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Admin)?;

    let webhook = state
        .webhooks
        .by_id(&webhook_id)
        .map_err(|e| EngineError::Transient(e.to_string()))?
        .ok_or_else(|| EngineError::NotFound(format!("webhook {webhook_id}")))?;

    // Org isolation: no cross-tenant reads.
    if webhook.org_id != claims.org_id {
        return Err(EngineError::NotFound(format!("webhook {webhook_id}")));
    }

    let history = state
        .webhooks
        .deliveries(&webhook_id, query.limit.unwrap_or(100).min(1000))
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    Ok(Json(json!({
        "webhook_id": webhook_id,
        "count": history.len(),
        "deliveries": history,
    })))
}
