use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failures reported by a [`crate::store::RemoteStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remote entry not found: {0}")]
    NotFound(String),

    #[error("remote store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        // Every redis failure is treated as transient; the scheduler retries
        // and read-through callers see RemoteUnavailable.
        StoreError::Unavailable(e.to_string())
    }
}

impl From<object_store::Error> for StoreError {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => StoreError::NotFound(path),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Errors surfaced by the token state API.
#[derive(Debug, Error)]
pub enum TokenStateError {
    #[error("token not found: {0}")]
    TokenNotFound(String),

    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("invalid token id: {0}")]
    InvalidTokenId(String),

    #[error("renewal of {token} would exceed its max lifetime")]
    RenewalLimitExceeded { token: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for TokenStateError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(path) => TokenStateError::TokenNotFound(path),
            StoreError::Unavailable(msg) => TokenStateError::RemoteUnavailable(msg),
        }
    }
}

impl IntoResponse for TokenStateError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            TokenStateError::TokenNotFound(_) => (StatusCode::NOT_FOUND, "token_not_found"),
            TokenStateError::RemoteUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "remote_unavailable")
            }
            TokenStateError::InvalidTokenId(_) => (StatusCode::BAD_REQUEST, "invalid_token_id"),
            TokenStateError::RenewalLimitExceeded { .. } => {
                (StatusCode::CONFLICT, "renewal_limit_exceeded")
            }
            TokenStateError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_server_error")
            }
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}
