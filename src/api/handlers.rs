use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::key::{AllowReason, Decision, IssueRequest, KeyRecord, KeyStatus};
use crate::api::AppState;

// ── Request / Response DTOs ──────────────────────────────────

/// Body of `/auth` and `/verify_key`. Non-string values are rejected by
/// deserialization; empty strings are rejected by the handler.
#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub key: Option<String>,
    pub hwid: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ValidateResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

impl ValidateResponse {
    fn status(status: &'static str) -> Self {
        Self {
            status,
            message: None,
        }
    }
}

type ClientReply = (StatusCode, Json<ValidateResponse>);

fn invalid_request() -> ClientReply {
    (
        StatusCode::BAD_REQUEST,
        Json(ValidateResponse::status("invalid request")),
    )
}

fn allowed(reason: AllowReason) -> ClientReply {
    let message = match reason {
        AllowReason::Linked => "HWID linked",
        AllowReason::Verified => "HWID verified",
    };
    (
        StatusCode::OK,
        Json(ValidateResponse {
            status: "allowed",
            message: Some(message),
        }),
    )
}

/// Full rendering: every outcome is distinguishable.
pub fn render_auth(decision: Decision) -> ClientReply {
    match decision {
        Decision::Allowed(reason) => allowed(reason),
        Decision::HwidMismatch => (
            StatusCode::FORBIDDEN,
            Json(ValidateResponse::status("hwid mismatch")),
        ),
        Decision::Expired => (
            StatusCode::FORBIDDEN,
            Json(ValidateResponse::status("expired")),
        ),
        Decision::NotFound => (
            StatusCode::FORBIDDEN,
            Json(ValidateResponse::status("invalid key")),
        ),
    }
}

/// Coarse rendering: unknown and expired keys are indistinguishable.
pub fn render_verify(decision: Decision) -> ClientReply {
    match decision {
        Decision::Allowed(reason) => allowed(reason),
        Decision::HwidMismatch => (
            StatusCode::FORBIDDEN,
            Json(ValidateResponse::status("hwid mismatch")),
        ),
        Decision::Expired | Decision::NotFound => (
            StatusCode::FORBIDDEN,
            Json(ValidateResponse::status("not allowed or expired")),
        ),
    }
}

/// Pull non-empty `key` and `hwid` out of the body. The HWID may be omitted
/// when binding is disabled.
fn credentials(
    state: &AppState,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> Option<(String, String)> {
    let Json(body) = payload.ok()?;
    let key = body.key.filter(|k| !k.is_empty())?;
    let hwid = match body.hwid.filter(|h| !h.is_empty()) {
        Some(h) => h,
        None if !state.engine.enforces_hwid() => String::new(),
        None => return None,
    };
    Some((key, hwid))
}

async fn decide(
    state: &AppState,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> Result<Option<Decision>, AppError> {
    let Some((key, hwid)) = credentials(state, payload) else {
        return Ok(None);
    };
    let decision = state.engine.validate(&key, &hwid).await?;
    state.metrics.record_decision(&decision);
    Ok(Some(decision))
}

// ── Client handlers ──────────────────────────────────────────

/// POST /auth — validate a key and bind it on first use.
pub async fn auth(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> Result<ClientReply, AppError> {
    Ok(match decide(&state, payload).await? {
        Some(decision) => render_auth(decision),
        None => invalid_request(),
    })
}

/// POST /verify_key — same decision as `/auth` with coarse failures.
pub async fn verify_key(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ValidateRequest>, JsonRejection>,
) -> Result<ClientReply, AppError> {
    Ok(match decide(&state, payload).await? {
        Some(decision) => render_verify(decision),
        None => invalid_request(),
    })
}

// ── Admin handlers ───────────────────────────────────────────

/// POST /api/v1/keys — generate a key
pub async fn generate_key(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<IssueRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<KeyRecord>), AppError> {
    let Json(req) = payload.map_err(|e| {
        tracing::warn!("generate_key: bad body: {}", e);
        AppError::InvalidRequest
    })?;
    let record = state.issuer.issue(req).await?;
    state.metrics.record_issued();
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /api/v1/keys — list all keys
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<KeyRecord>>, AppError> {
    Ok(Json(state.admin.list().await?.keys))
}

/// GET /api/v1/keys/:key — read-only status
pub async fn check_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<(StatusCode, Json<KeyStatus>), AppError> {
    let status = state.admin.check_status(&key).await?;
    let code = match status {
        KeyStatus::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    Ok((code, Json(status)))
}

/// DELETE /api/v1/keys/:key — revoke
pub async fn remove_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<StatusCode, AppError> {
    state.admin.revoke(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/keys/:key/reset-hwid — clear the hardware binding
pub async fn reset_hwid(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<StatusCode, AppError> {
    state.admin.reset_binding(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}
