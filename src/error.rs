//! Error kinds surfaced independently of transport
//! Mission: One place that decides which failures are permanent, retryable, or silent

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Domain error kinds. The HTTP mapping lives in `IntoResponse` below so the
/// core never reasons about status codes.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed event, validation failure, unknown rule version. Permanent.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Re-label of a labeled shadow result, rollback to an unknown version.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Downstream store unavailable, deadline exceeded, publish failed. Retryable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Audit-chain verification failure. Reported, never halts service.
    #[error("integrity breach: {0}")]
    IntegrityBreach(String),

    /// Rule install aborted; the current rule set is unchanged.
    #[error("rule validation failed")]
    RuleValidationFailed(Vec<String>),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Unauthorized => "unauthorized",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Transient(_) => "transient",
            EngineError::IntegrityBreach(_) => "integrity_breach",
            EngineError::RuleValidationFailed(_) => "rule_validation_failed",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Transient(e.to_string())
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EngineError::Unauthorized => StatusCode::UNAUTHORIZED,
            EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::IntegrityBreach(_) => StatusCode::OK,
            EngineError::RuleValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self {
            EngineError::RuleValidationFailed(issues) => serde_json::json!({
                "error": self.kind(),
                "message": "rule validation failed",
                "issues": issues,
            }),
            _ => serde_json::json!({
                "error": self.kind(),
                "message": self.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                EngineError::InvalidInput("x".into()).into_response().status(),
                StatusCode::BAD_REQUEST,
            ),
            (
                EngineError::Conflict("x".into()).into_response().status(),
                StatusCode::CONFLICT,
            ),
            (
                EngineError::Transient("x".into()).into_response().status(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                EngineError::RuleValidationFailed(vec!["bad".into()])
                    .into_response()
                    .status(),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        ];

        for (got, want) in cases {
            assert_eq!(got, want);
        }
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(EngineError::Unauthorized.kind(), "unauthorized");
        assert_eq!(
            EngineError::NotFound("decision".into()).kind(),
            "not_found"
        );
    }
}
