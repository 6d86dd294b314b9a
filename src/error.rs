//! Error types shared across the engine and the HTTP surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::validation::ValidationError;

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness invariant rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be decoded into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Failures talking to the messaging gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("gateway payload error: {0}")]
    Payload(String),
}

/// Failures talking to the AI collaborator (completion or transcription).
#[derive(Debug, Error)]
pub enum AiError {
    #[error("ai request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ai provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("ai response was empty")]
    Empty,

    #[error("ai response malformed: {0}")]
    Malformed(String),
}

/// Startup configuration problems. Only ever raised before the server binds.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Anything that stops the server from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced through HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("unknown instance '{0}'")]
    UnknownInstance(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::UnknownInstance(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Gateway(_) => StatusCode::BAD_GATEWAY,
            Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            Self::Validation(err) => json!({
                "error": "validation failed",
                "field": err.path,
                "message": err.message,
            }),
            other => {
                if status.is_server_error() {
                    tracing::error!(error = %other, "request failed");
                }
                json!({ "error": other.to_string() })
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_http_contract() {
        let validation = AppError::from(ValidationError::new("payload.id", "required"));
        assert_eq!(validation.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::UnknownInstance("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            AppError::Store(StoreError::NotFound("lead".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Internal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::Missing("WEBHOOK_SECRET");
        assert_eq!(
            err.to_string(),
            "missing required environment variable WEBHOOK_SECRET"
        );
    }
}
