//! Shared-secret gates in front of the key routes.
//!
//! Clients present `X-API-Key`; operators present `X-Admin-Key` (or
//! `Authorization: Bearer`). Secrets are compared in constant time and never
//! logged in full.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::api::AppState;
use crate::errors::AppError;

fn secrets_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn mask(k: &str) -> String {
    crate::models::key::mask_token(k)
}

/// Middleware: validates `X-API-Key` against the configured client key.
/// Clients get the same `{"status": ...}` body shape as the validation routes.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let authorized = match req.headers().get("x-api-key").and_then(|v| v.to_str().ok()) {
        Some(k) if secrets_match(k, &state.config.api_key) => true,
        Some(k) => {
            tracing::warn!("client API: invalid key (provided: '{}')", mask(k));
            false
        }
        None => {
            tracing::warn!("client API: missing X-API-Key header");
            false
        }
    };

    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "status": "unauthorized" }))).into_response();
    }
    next.run(req).await
}

fn admin_key_from(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| t.trim())
        })
}

/// Middleware: validates the admin key for the management routes.
pub async fn require_admin_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    match admin_key_from(req.headers()) {
        Some(k) if secrets_match(k, state.config.admin_key()) => {}
        Some(k) => {
            tracing::warn!("admin API: invalid key (provided: '{}')", mask(k));
            return Err(AppError::Unauthorized);
        }
        None => {
            tracing::warn!("admin API: missing X-Admin-Key header");
            return Err(AppError::Unauthorized);
        }
    }
    Ok(next.run(req).await)
}
