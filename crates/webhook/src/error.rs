//! Webhook error taxonomy with its HTTP status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("unknown provider")]
    UnknownProvider,

    #[error("invalid repository name")]
    InvalidRepoName,

    #[error("missing signature")]
    MissingSignature,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("unsupported event: {0}")]
    UnsupportedEvent(String),

    #[error("invalid commit sha")]
    InvalidCommitSha,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Refuse to verify against an empty secret.
    #[error("webhook secret not configured")]
    NotConfigured,
}

impl WebhookError {
    /// Stable error code carried in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            WebhookError::UnknownProvider => "unknown_provider",
            WebhookError::InvalidRepoName => "invalid_repo_name",
            WebhookError::MissingSignature => "missing_signature",
            WebhookError::InvalidSignature => "invalid_signature",
            WebhookError::UnsupportedEvent(_) => "unsupported_event",
            WebhookError::InvalidCommitSha => "invalid_commit_sha",
            WebhookError::InvalidPayload(_) => "invalid_payload",
            WebhookError::NotConfigured => "webhook_not_configured",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::MissingSignature | WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::NotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        // The body never echoes payload or secret material, only the code.
        (self.status_code(), Json(serde_json::json!({ "error": self.code() }))).into_response()
    }
}
