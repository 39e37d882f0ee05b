use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failures of the key lifecycle core.
///
/// Validation outcomes (`Expired`, `HwidMismatch`) are not errors; they are
/// carried by [`crate::models::key::Decision`]. Only `StoreUnavailable` is fatal
/// for the operation that hit it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key not found")]
    NotFound,

    #[error("key already exists")]
    DuplicateKey,

    #[error("key length must be between {min} and {max} characters (got {length})", min = crate::issuer::MIN_KEY_LENGTH, max = crate::issuer::MAX_KEY_LENGTH)]
    InvalidLength { length: usize },

    #[error("invalid key duration")]
    InvalidDuration,

    #[error("key store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Errors rendered by the HTTP transport.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid request")]
    InvalidRequest,

    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "unauthorized",
                "invalid or missing key".to_string(),
            ),
            AppError::InvalidRequest => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_request",
                "invalid request".to_string(),
            ),
            AppError::RateLimitExceeded { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "rate_limit_exceeded",
                "rate limit exceeded".to_string(),
            ),
            AppError::Key(KeyError::NotFound) => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                "key_not_found",
                "key not found".to_string(),
            ),
            AppError::Key(KeyError::DuplicateKey) => (
                StatusCode::CONFLICT,
                "conflict_error",
                "duplicate_key",
                "key already exists".to_string(),
            ),
            AppError::Key(e @ KeyError::InvalidLength { .. }) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_length",
                e.to_string(),
            ),
            AppError::Key(KeyError::InvalidDuration) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_duration",
                "invalid key duration".to_string(),
            ),
            AppError::Key(KeyError::StoreUnavailable(e)) => {
                tracing::error!("Key store error: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "internal_error",
                    "store_unavailable",
                    "key store unavailable".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        if let AppError::RateLimitExceeded { retry_after_secs } = self {
            if let Ok(v) = axum::http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("retry-after", v);
            }
        }

        response
    }
}
