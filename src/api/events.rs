//! Event ingress endpoints
//! Mission: Validate, enrich, and durably queue events; 202 means "will be processed"

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tracing::info;
use uuid::Uuid;

use crate::api::AppState;
use crate::auth::{require_role, Claims, Role};
use crate::error::{EngineError, EngineResult};
use crate::models::{ActorContext, Event, GeoContext};

/// Canonical ingest: full Event body, enriched server-side with the request
/// IP and user-agent. 202 is returned only after the outbox transaction
/// commits.
pub async fn ingest(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> EngineResult<(StatusCode, Json<Value>)> {
    let mut event: Event = serde_json::from_value(body)
        .map_err(|e| EngineError::InvalidInput(format!("malformed event: {e}")))?;

    enrich(&mut event, addr, &headers);
    state.outbox.ingest(&event)?;

    info!(
        event_id = %event.event_id,
        event_type = %event.event_type,
        user_id = %event.actor.user_id,
        "Event accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "event_id": event.event_id,
        })),
    ))
}

/// Convenience endpoint for authentication events: flat payload promoted to
/// the canonical Event shape.
pub async fn ingest_auth(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> EngineResult<(StatusCode, Json<Value>)> {
    let event = promote(&body, "authentication.login")?;
    ingest_promoted(state, addr, headers, event).await
}

/// Convenience endpoint for transaction events.
pub async fn ingest_transaction(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> EngineResult<(StatusCode, Json<Value>)> {
    let event = promote(&body, "transaction.attempted")?;
    ingest_promoted(state, addr, headers, event).await
}

async fn ingest_promoted(
    state: AppState,
    addr: SocketAddr,
    headers: HeaderMap,
    mut event: Event,
) -> EngineResult<(StatusCode, Json<Value>)> {
    enrich(&mut event, addr, &headers);
    state.outbox.ingest(&event)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "event_id": event.event_id,
        })),
    ))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "rule_version": state.registry.version(),
    }))
}

pub async fn outbox_stats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Analyst)?;
    let stats = state
        .outbox
        .stats()
        .map_err(|e| EngineError::Transient(e.to_string()))?;
    Ok(Json(json!({ "outbox": stats })))
}

fn enrich(event: &mut Event, addr: SocketAddr, headers: &HeaderMap) {
    event.actor.ip_address = addr.ip().to_string();
    event.actor.user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    event.timestamp = Utc::now();
}

/// Build a canonical Event from a flat convenience payload.
fn promote(body: &Value, default_type: &str) -> EngineResult<Event> {
    let user_id = body
        .get("user_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::InvalidInput("user_id is required".to_string()))?;

    let event_type = body
        .get("event_type")
        .and_then(|v| v.as_str())
        .unwrap_or(default_type);

    Ok(Event {
        event_id: body
            .get("event_id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        event_type: event_type.to_string(),
        org_id: body
            .get("org_id")
            .and_then(|v| v.as_str())
            .unwrap_or("default")
            .to_string(),
        timestamp: Utc::now(),
        actor: ActorContext {
            user_id: user_id.to_string(),
            ip_address: String::new(),
            user_agent: String::new(),
            device_fingerprint: body
                .get("device_fingerprint")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            session_id: body
                .get("session_id")
                .and_then(|v| v.as_str())
                .map(String::from),
        },
        context: GeoContext {
            geo_lat: body.get("geo_lat").and_then(|v| v.as_f64()).unwrap_or(0.0),
            geo_lon: body.get("geo_lon").and_then(|v| v.as_f64()).unwrap_or(0.0),
            country_code: body
                .get("country_code")
                .and_then(|v| v.as_str())
                .map(String::from),
            city: body.get("city").and_then(|v| v.as_str()).map(String::from),
        },
        payload: body.get("payload").cloned().unwrap_or(json!({})),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promote_requires_user_id() {
        let err = promote(&json!({"event_type": "authentication.login"}), "authentication.login")
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_promote_fills_defaults() {
        let event = promote(
            &json!({
                "user_id": "u_1",
                "geo_lat": 40.7,
                "geo_lon": -74.0,
                "country_code": "US",
                "payload": {"success": true}
            }),
            "authentication.login",
        )
        .unwrap();

        assert_eq!(event.event_type, "authentication.login");
        assert_eq!(event.org_id, "default");
        assert!(!event.event_id.is_empty());
        assert_eq!(event.context.country_code.as_deref(), Some("US"));
        assert_eq!(event.payload["success"], true);
    }

    #[test]
    fn test_promote_honors_explicit_type() {
        let event = promote(
            &json!({"user_id": "u_1", "event_type": "authentication.failed"}),
            "authentication.login",
        )
        .unwrap();
        assert_eq!(event.event_type, "authentication.failed");
    }
}
