//! Authentication endpoints
//! Mission: Issue JWTs for the admin surface

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::AppState;
use crate::error::EngineError;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub token_type: &'static str,
    pub expires_in: usize,
    pub role: String,
    pub org_id: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, EngineError> {
    let operator = state
        .operators
        .verify_password(&request.username, &request.password)
        .map_err(|e| EngineError::Transient(e.to_string()))?
        .ok_or_else(|| {
            warn!(username = %request.username, "Login failed");
            EngineError::Unauthorized
        })?;

    let (token, expires_in) = state
        .jwt
        .generate_token(&operator)
        .map_err(EngineError::Internal)?;

    info!(username = %operator.username, role = operator.role.as_str(), "Operator logged in");

    Ok(Json(LoginResponse {
        token,
        token_type: "Bearer",
        expires_in,
        role: operator.role.as_str().to_string(),
        org_id: operator.org_id,
    }))
}
