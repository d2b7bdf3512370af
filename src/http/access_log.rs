//! One structured access-log event per request.

use std::net::SocketAddr;
use std::time::Instant;

use axum::body::HttpBody;
use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

use super::gateway::X_CACHE;

/// Middleware emitting an event with target `aegis::access` after the
/// response is produced.
pub async fn access_log(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());

    let resp = next.run(req).await;

    let cache = resp
        .headers()
        .get(X_CACHE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    info!(
        target: "aegis::access",
        %remote,
        %method,
        %path,
        status = resp.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        cache,
        bytes = resp.body().size_hint().exact(),
        "access"
    );
    resp
}
