//! Rule management endpoints
//! Mission: Hot reload, rollback, and inspection of the live rule set (admin only)

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::api::AppState;
use crate::audit::AuditRecord;
use crate::auth::{require_role, Claims, Role};
use crate::error::EngineResult;

#[derive(Debug, Default, Deserialize)]
pub struct ReloadRequest {
    #[serde(default)]
    pub force: bool,
}

pub async fn reload(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Option<Json<ReloadRequest>>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Admin)?;
    let force = body.map(|Json(r)| r.force).unwrap_or(false);

    let report = state.registry.reload(force)?;

    audit_rule_change(
        &state,
        &claims,
        "rules.reloaded",
        json!({
            "status": report.status,
            "version": report.version,
            "hash": report.hash,
            "changes": report.changes,
            "force": force,
        }),
    );

    Ok(Json(json!({
        "status": report.status,
        "version": report.version,
        "hash": report.hash,
        "changes": report.changes,
        "rule_count": report.rule_count,
    })))
}

pub async fn rollback(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(version): Path<String>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Admin)?;

    let report = state.registry.rollback(&version)?;
    warn!(
        version = %version,
        operator = %claims.username,
        "Rules rolled back via API"
    );

    audit_rule_change(
        &state,
        &claims,
        "rules.rolled_back",
        json!({
            "rolled_back_to": report.rolled_back_to,
            "from_version": report.from_version,
        }),
    );

    Ok(Json(json!({
        "status": "success",
        "rolled_back_to": report.rolled_back_to,
        "from_version": report.from_version,
    })))
}

pub async fn current(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Admin)?;
    let ruleset = state.registry.current();

    Ok(Json(json!({
        "status": "success",
        "version": ruleset.version,
        "hash": ruleset.hash,
        "loaded_at": ruleset.loaded_at.to_rfc3339(),
        "rules": ruleset.file,
    })))
}

pub async fn history(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Admin)?;
    Ok(Json(json!({
        "status": "success",
        "current": state.registry.version(),
        "history": state.registry.history(),
    })))
}

pub async fn stats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Admin)?;
    Ok(Json(json!({
        "status": "success",
        "stats": state.registry.stats(),
    })))
}

pub async fn validate(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> EngineResult<Json<Value>> {
    require_role(&claims, Role::Admin)?;
    let issues = state.registry.validate_source()?;

    Ok(Json(json!({
        "status": "success",
        "valid": issues.is_empty(),
        "errors": issues,
        "current_version": state.registry.version(),
    })))
}

fn audit_rule_change(state: &AppState, claims: &Claims, event_type: &str, payload: Value) {
    let record = AuditRecord {
        actor_id: Some(claims.sub.clone()),
        actor_role: Some(claims.role.as_str().to_string()),
        event_type: event_type.to_string(),
        resource_type: "rule_set".to_string(),
        resource_id: state.registry.version(),
        payload,
        shadow_mode: false,
    };
    if let Err(e) = state.audit.append(&claims.org_id, record) {
        warn!(error = %e, "Failed to audit rule change");
    }
}
