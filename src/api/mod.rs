use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::admin::AdminOps;
use crate::binding::BindingEngine;
use crate::clock::Clock;
use crate::config::Config;
use crate::issuer::Issuer;
use crate::middleware::auth;
use crate::middleware::metrics::PrometheusRecorder;
use crate::middleware::rate_limit::{self, RateLimiter};
use crate::store::KeyStore;

pub mod handlers;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn KeyStore>,
    pub engine: BindingEngine,
    pub issuer: Issuer,
    pub admin: AdminOps,
    pub limiter: RateLimiter,
    pub metrics: Arc<PrometheusRecorder>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let engine = BindingEngine::new(store.clone(), clock.clone())
            .with_hwid_enforcement(config.hwid_binding);
        Ok(Self {
            engine,
            issuer: Issuer::new(store.clone(), clock.clone()),
            admin: AdminOps::new(store.clone(), clock),
            limiter: RateLimiter::new(config.rate_limits.clone()),
            metrics: Arc::new(PrometheusRecorder::new()?),
            store,
            config,
        })
    }
}

/// Build the full HTTP application.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health endpoints (no auth)
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(metrics))
        .merge(client_router(state.clone()))
        .nest("/api/v1", admin_router(state.clone()))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
}

/// Validation routes used by client applications.
/// The rate limiter runs first, then the API-key gate.
fn client_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth", post(handlers::auth))
        .route("/verify_key", post(handlers::verify_key))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_api_key))
        .layer(middleware::from_fn_with_state(state, rate_limit::enforce))
}

/// Management routes, relative to `/api/v1`.
fn admin_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/keys",
            get(handlers::list_keys).post(handlers::generate_key),
        )
        .route(
            "/keys/:key",
            get(handlers::check_key).delete(handlers::remove_key),
        )
        .route("/keys/:key/reset-hwid", post(handlers::reset_hwid))
        .layer(middleware::from_fn_with_state(state, auth::require_admin_key))
        .fallback(fallback_404)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn readiness_check(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.store.get("readyz-probe").await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!("readiness check failed: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Middleware: injects a unique X-Request-Id into every response.
/// This allows clients to correlate errors with server logs.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: injects security headers into every response.
async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    // Keys and bindings must never sit in a shared cache.
    headers.insert("Cache-Control", HeaderValue::from_static("no-store"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.remove("Server");

    resp
}
