//! Authentication middleware
//! Mission: Validate bearer tokens and gate admin endpoints by role

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::auth::jwt::JwtHandler;
use crate::auth::models::{Claims, Role};
use crate::error::EngineError;

/// Validates the `Authorization: Bearer` header and stashes the claims in
/// request extensions for handlers to pick up.
pub async fn auth_middleware(
    State(jwt_handler): State<Arc<JwtHandler>>,
    mut req: Request,
    next: Next,
) -> Result<Response, EngineError> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.to_string())
        .ok_or(EngineError::Unauthorized)?;

    let claims = jwt_handler
        .validate_token(&token)
        .map_err(|_| EngineError::Unauthorized)?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Role gate used inside handlers after `auth_middleware` ran.
pub fn require_role(claims: &Claims, required: Role) -> Result<(), EngineError> {
    if claims.role.at_least(required) {
        Ok(())
    } else {
        Err(EngineError::Forbidden(format!(
            "requires {} role",
            required.as_str()
        )))
    }
}
