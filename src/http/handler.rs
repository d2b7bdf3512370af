//! Main axum router and the locally answered endpoints.
//!
//! Routes:
//! - `GET /stats`           - Backup store size and approximate memory as JSON
//! - `GET /_aegis/healthz`  - Upstream reachability and store summary
//! - `GET /_aegis/metrics`  - Prometheus metrics
//! - everything else        - proxied through the [`Gateway`](super::gateway::Gateway)
//!
//! Non-GET requests to the local paths are proxied like any other request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tracing::error;

use super::gateway::RequestDeadline;
use crate::cache::Store;
use crate::AppState;

/// Paths the proxy answers itself live under this prefix so the upstream's
/// own `/healthz` or `/metrics` stay reachable.
pub const LOCAL_PREFIX: &str = "/_aegis";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/stats", get(handle_stats).fallback(handle_proxy))
        .route(
            &format!("{LOCAL_PREFIX}/healthz"),
            get(handle_health).fallback(handle_proxy),
        )
        .route(
            &format!("{LOCAL_PREFIX}/metrics"),
            get(handle_metrics).fallback(handle_proxy),
        )
        .fallback(handle_proxy)
        .with_state(Arc::clone(&state));

    if let Some(budget) = state.config.server.request_timeout {
        router = router.layer(middleware::from_fn_with_state(budget, stamp_deadline));
    }

    let logging = &state.config.logging;
    if logging.enabled && logging.access_log {
        router = router.layer(middleware::from_fn(super::access_log::access_log));
    }
    router
}

/// Attach the request's absolute deadline, measured from arrival.
async fn stamp_deadline(State(budget): State<Duration>, mut req: Request, next: Next) -> Response {
    if let Some(deadline) = Instant::now().checked_add(budget) {
        req.extensions_mut().insert(RequestDeadline(deadline));
    }
    next.run(req).await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_proxy(State(state): State<Arc<AppState>>, req: Request) -> Response {
    state.gateway.handle(req).await
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub cache_size: usize,
    pub memory_bytes: u64,
    pub memory_kb: f64,
    pub memory_mb: f64,
}

impl StatsResponse {
    pub fn from_store(store: &Store) -> Self {
        let memory_bytes = store.memory_usage();
        let kb = memory_bytes as f64 / 1024.0;
        Self {
            cache_size: store.len(),
            memory_bytes,
            memory_kb: round2(kb),
            memory_mb: round2(kb / 1024.0),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// `GET /stats`
async fn handle_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse::from_store(&state.store))
}

/// `GET /_aegis/healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        gateway: Arc::clone(&state.gateway),
    };
    crate::health::health_handler(State(health_state)).await
}

/// `GET /_aegis/metrics`
///
/// Store gauges are refreshed on every scrape.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let metrics = &state.metrics.metrics;
    metrics.store_entries.set(state.store.len() as i64);
    metrics.store_bytes.set(state.store.memory_usage() as i64);

    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from the locally answered endpoints.  Proxied requests never
/// produce one; the gateway always builds its own response.
#[derive(Debug)]
pub enum AppError {
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
