use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use reqwest::Url;
use serde::Serialize;

use crate::cache::Store;
use crate::http::gateway::Gateway;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

/// The proxy keeps serving backups while the upstream is down, so an
/// unreachable upstream only degrades it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub upstream: CheckResult,
    pub store: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: Option<String>) -> Self {
        Self { ok: true, detail }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HealthState {
    pub gateway: Arc<Gateway>,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_upstream(client: &reqwest::Client, url: &Url, timeout: Duration) -> CheckResult {
    match client.head(url.clone()).timeout(timeout).send().await {
        Ok(resp) if !resp.status().is_server_error() => CheckResult::healthy(None),
        Ok(resp) => CheckResult::unhealthy(format!("HEAD {} returned {}", url, resp.status())),
        Err(e) => CheckResult::unhealthy(format!("HEAD {} failed: {e}", url)),
    }
}

fn check_store(store: &Store) -> CheckResult {
    CheckResult::healthy(Some(format!(
        "{} entries, ~{} bytes",
        store.len(),
        store.memory_usage()
    )))
}

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if checks.upstream.ok && checks.store.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Always 200; the body carries the detail.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let gateway = &state.gateway;
    let upstream = check_upstream(gateway.client(), gateway.upstream(), gateway.timeout()).await;
    let store = check_store(gateway.store());

    let checks = HealthChecks { upstream, store };
    let status = aggregate_status(&checks);
    (StatusCode::OK, Json(HealthResponse { status, checks }))
}
