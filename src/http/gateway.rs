//! Forwarding and failover decisions for every proxied request.
//!
//! Each inbound request gets exactly one upstream attempt.  The outcome is
//! classified as follows:
//!
//! | Upstream result                         | GET / HEAD                      | other methods |
//! |-----------------------------------------|---------------------------------|---------------|
//! | 2xx                                     | stored, `X-Cache: MISS`         | `BYPASS`      |
//! | 1xx / 3xx / 4xx                         | passed through, `PASS`          | `BYPASS`      |
//! | 5xx, timeout, transport or build error  | backup (`HIT-BACKUP`) or 502    | 502, `BYPASS` |
//!
//! Redirects are not followed; the client sees them as the upstream sent them.
//! The inbound body is streamed to the upstream, so a slow uploader spends the
//! same budget as a slow upstream.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use axum::body::{Body, HttpBody};
use axum::extract::Request;
use axum::http::header::{HeaderName, HeaderValue, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use chrono::SecondsFormat;
use percent_encoding::percent_decode_str;
use reqwest::Url;
use tracing::{debug, info, instrument, warn};

use super::headers;
use crate::cache::{Store, StoredResponse};
use crate::config::{parse_upstream, Config};
use crate::metrics::{CacheOutcome, FailureKind, Metrics};

pub const X_SERVED_BY: HeaderName = HeaderName::from_static("x-served-by");
pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_BACKUP_SAVED_AT: HeaderName = HeaderName::from_static("x-backup-saved-at");

/// Absolute deadline of the inbound request, carried as a request extension.
///
/// When present, the upstream attempt never outlives it.  The router stamps
/// it from `server.request_timeout`; code embedding a [`Gateway`] directly
/// may insert its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDeadline(pub Instant);

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub upstream: Url,
    pub timeout: Duration,
    pub ttl: Duration,
    pub key_headers: Vec<String>,
    pub name: String,
}

impl GatewayOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            upstream: parse_upstream(&config.server.upstream)?,
            timeout: config.server.timeout,
            ttl: config.cache.ttl,
            key_headers: config.cache.key_headers.clone(),
            name: config.server.name.clone(),
        })
    }
}

/// Shared upstream client.  Pool settings are fixed; the per-request budget
/// is enforced by the gateway.
pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(100)
        .tcp_keepalive(Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build upstream HTTP client")
}

// ---------------------------------------------------------------------------
// Upstream errors
// ---------------------------------------------------------------------------

/// Why an upstream attempt counts as failed.
#[derive(Debug)]
pub enum UpstreamError {
    /// The outbound request could not be assembled.
    Build(anyhow::Error),
    /// DNS, connect, TLS or protocol failure.
    Transport(reqwest::Error),
    /// The attempt exceeded its budget.
    Timeout(Duration),
    /// The response body could not be read completely.
    Body(reqwest::Error),
    /// The upstream answered with a 5xx status.
    Status(StatusCode),
}

impl UpstreamError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Build(_) => FailureKind::Build,
            Self::Transport(_) => FailureKind::Transport,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Body(_) => FailureKind::Body,
            Self::Status(_) => FailureKind::Status,
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build(e) => write!(f, "build request: {e:#}"),
            Self::Transport(e) => {
                write!(f, "upstream request: ")?;
                write_chain(f, e)
            }
            Self::Timeout(budget) => write!(f, "upstream timed out after {}ms", budget.as_millis()),
            Self::Body(e) => {
                write!(f, "read upstream body: ")?;
                write_chain(f, e)
            }
            Self::Status(status) => write!(f, "upstream status {}", status.as_u16()),
        }
    }
}

impl StdError for UpstreamError {}

fn write_chain(f: &mut fmt::Formatter<'_>, err: &dyn StdError) -> fmt::Result {
    write!(f, "{err}")?;
    let mut source = err.source();
    while let Some(inner) = source {
        write!(f, ": {inner}")?;
        source = inner.source();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

struct UpstreamReply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

pub struct Gateway {
    upstream: Url,
    client: reqwest::Client,
    store: Arc<Store>,
    metrics: Arc<Metrics>,
    timeout: Duration,
    ttl: Duration,
    /// Configured spelling paired with the parsed name used for lookup.
    key_headers: Vec<(String, HeaderName)>,
    served_by: HeaderValue,
}

impl Gateway {
    pub fn new(
        options: GatewayOptions,
        client: reqwest::Client,
        store: Arc<Store>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let key_headers = options
            .key_headers
            .into_iter()
            .map(|label| {
                let name = HeaderName::from_bytes(label.as_bytes())
                    .with_context(|| format!("invalid cache key header: {label:?}"))?;
                Ok((label, name))
            })
            .collect::<Result<Vec<_>>>()?;
        let served_by = HeaderValue::from_str(&options.name)
            .with_context(|| format!("invalid proxy name: {:?}", options.name))?;

        Ok(Self {
            upstream: options.upstream,
            client,
            store,
            metrics,
            timeout: options.timeout,
            ttl: options.ttl,
            key_headers,
            served_by,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `"<METHOD> <path>?<query>"` with the path percent-decoded, followed by `"|<Header>:<value>"` for each
    /// configured header the request carries with a non-empty value.
    pub fn cache_key(&self, method: &Method, uri: &Uri, headers: &HeaderMap) -> String {
        let path = percent_decode_str(uri.path()).decode_utf8_lossy();
        let mut key = format!("{} {}?{}", method, path, uri.query().unwrap_or(""));
        for (label, name) in &self.key_headers {
            let Some(value) = headers.get(name) else {
                continue;
            };
            let value = String::from_utf8_lossy(value.as_bytes());
            if value.is_empty() {
                continue;
            }
            key.push('|');
            key.push_str(label);
            key.push(':');
            key.push_str(&value);
        }
        key
    }

    /// Proxy one request.  Always produces a response.
    #[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
    pub async fn handle(&self, req: Request) -> Response {
        let (parts, body) = req.into_parts();
        let cacheable = is_cacheable(&parts.method);
        let key = cacheable.then(|| self.cache_key(&parts.method, &parts.uri, &parts.headers));
        let deadline = parts.extensions.get::<RequestDeadline>().map(|d| d.0);
        let budget = effective_timeout(self.timeout, deadline, Instant::now());

        let started = Instant::now();
        let result = self
            .forward(&parts.method, &parts.uri, &parts.headers, body, budget)
            .await;
        self.metrics
            .upstream_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        let result = match result {
            Ok(reply) if reply.status.is_server_error() => Err(UpstreamError::Status(reply.status)),
            other => other,
        };

        match (result, key) {
            (Ok(reply), key) => self.pass_through(reply, key),
            (Err(cause), Some(key)) => {
                self.metrics.record_failure(cause.kind());
                self.serve_backup(&key, &cause)
            }
            (Err(cause), None) => {
                self.metrics.record_failure(cause.kind());
                warn!(error = %cause, "upstream failed for non-cacheable request");
                self.bad_gateway(format!("Bad Gateway: {cause}"), CacheOutcome::Bypass)
            }
        }
    }

    /// Make the single upstream attempt under `budget`.  Streaming the inbound
    /// body happens inside the timed section.
    async fn forward(
        &self,
        method: &Method,
        uri: &Uri,
        inbound: &HeaderMap,
        body: Body,
        budget: Duration,
    ) -> Result<UpstreamReply, UpstreamError> {
        let url = self.target_url(uri);
        let mut builder = self
            .client
            .request(method.clone(), url)
            .headers(headers::for_upstream(inbound));
        // A body-less request stays body-less instead of turning into an
        // empty chunked upload.
        if body.size_hint().exact() != Some(0) {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }
        let request = builder
            .build()
            .map_err(|e| UpstreamError::Build(e.into()))?;

        debug!(url = %request.url(), budget_ms = budget.as_millis() as u64, "forwarding upstream");

        // Dropping this future on timeout cancels the in-flight attempt.
        let attempt = async {
            let resp = self
                .client
                .execute(request)
                .await
                .map_err(UpstreamError::Transport)?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp.bytes().await.map_err(UpstreamError::Body)?;
            Ok::<_, UpstreamError>(UpstreamReply {
                status,
                headers,
                body,
            })
        };

        tokio::time::timeout(budget, attempt)
            .await
            .map_err(|_| UpstreamError::Timeout(budget))?
    }

    fn target_url(&self, uri: &Uri) -> Url {
        let mut url = self.upstream.clone();
        url.set_path(&headers::single_slash_join(self.upstream.path(), uri.path()));
        url.set_query(uri.query().filter(|q| !q.is_empty()));
        url
    }

    fn pass_through(&self, reply: UpstreamReply, key: Option<String>) -> Response {
        let headers = headers::end_to_end(&reply.headers);
        let outcome = match key {
            Some(key) if reply.status.is_success() => {
                debug!(%key, status = reply.status.as_u16(), "storing upstream response");
                self.store.set(
                    key,
                    StoredResponse::new(reply.status, headers.clone(), reply.body.clone(), self.ttl),
                );
                CacheOutcome::Miss
            }
            Some(_) => CacheOutcome::Pass,
            None => CacheOutcome::Bypass,
        };
        self.respond(reply.status, headers, reply.body, outcome)
    }

    fn serve_backup(&self, key: &str, cause: &UpstreamError) -> Response {
        let Some(entry) = self.store.get(key) else {
            warn!(%key, error = %cause, "upstream failed and no backup is stored");
            return self.bad_gateway(
                format!("Bad Gateway (no cached backup): {cause}"),
                CacheOutcome::MissNoBackup,
            );
        };

        info!(%key, error = %cause, saved_at = %entry.saved_at, "upstream failed, serving backup");
        let mut resp = self.respond(
            entry.status,
            entry.headers.clone(),
            entry.body.clone(),
            CacheOutcome::HitBackup,
        );
        let saved_at = entry.saved_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        if let Ok(value) = HeaderValue::from_str(&saved_at) {
            resp.headers_mut().insert(X_BACKUP_SAVED_AT, value);
        }
        resp
    }

    fn bad_gateway(&self, message: String, outcome: CacheOutcome) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        self.respond(
            StatusCode::BAD_GATEWAY,
            headers,
            Bytes::from(format!("{message}\n")),
            outcome,
        )
    }

    fn respond(
        &self,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        outcome: CacheOutcome,
    ) -> Response {
        self.metrics.record_outcome(outcome);
        let mut resp = Response::new(Body::from(body));
        *resp.status_mut() = status;
        *resp.headers_mut() = headers;
        resp.headers_mut().insert(X_SERVED_BY, self.served_by.clone());
        resp.headers_mut()
            .insert(X_CACHE, HeaderValue::from_static(outcome.header_value()));
        resp
    }
}

/// Only safe, body-less reads are stored and replayed.
pub fn is_cacheable(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

/// The configured budget, shortened to whatever is left of the caller's
/// deadline.  Never extends the caller's deadline.
pub fn effective_timeout(configured: Duration, deadline: Option<Instant>, now: Instant) -> Duration {
    match deadline {
        Some(deadline) => configured.min(deadline.saturating_duration_since(now)),
        None => configured,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
