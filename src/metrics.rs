use std::fmt::{self, Write as _};
use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub cache: CacheOutcome,
}

/// Outcome of one proxied request.  Maps onto the `X-Cache` header; a failed
/// cacheable request with nothing stored shares `PASS` on the wire but keeps
/// its own label.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CacheOutcome {
    Miss,
    Pass,
    Bypass,
    HitBackup,
    MissNoBackup,
}

impl CacheOutcome {
    pub fn header_value(self) -> &'static str {
        match self {
            Self::Miss => "MISS",
            Self::Pass => "PASS",
            Self::Bypass => "BYPASS",
            Self::HitBackup => "HIT-BACKUP",
            Self::MissNoBackup => "PASS",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Miss => "miss",
            Self::Pass => "pass",
            Self::Bypass => "bypass",
            Self::HitBackup => "hit_backup",
            Self::MissNoBackup => "miss_no_backup",
        }
    }
}

impl EncodeLabelValue for CacheOutcome {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
        encoder.write_str(self.label())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub kind: FailureKind,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum FailureKind {
    Build,
    Transport,
    Timeout,
    Body,
    Status,
}

impl EncodeLabelValue for FailureKind {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
        encoder.write_str(match self {
            Self::Build => "build",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Body => "body",
            Self::Status => "status",
        })
    }
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the proxy.
pub struct Metrics {
    pub requests_total: Family<CacheLabels, Counter>,
    pub upstream_failures_total: Family<FailureLabels, Counter>,
    pub upstream_duration_seconds: Histogram,

    // -- store gauges, refreshed at scrape time --
    pub store_entries: Gauge,
    pub store_bytes: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        // Counters get their `_total` suffix from the encoder.
        let requests_total = Family::<CacheLabels, Counter>::default();
        registry.register(
            "aegis_requests",
            "Proxied requests by cache outcome",
            requests_total.clone(),
        );

        let upstream_failures_total = Family::<FailureLabels, Counter>::default();
        registry.register(
            "aegis_upstream_failures",
            "Failed upstream attempts by failure kind",
            upstream_failures_total.clone(),
        );

        let upstream_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 16));
        registry.register(
            "aegis_upstream_duration_seconds",
            "Latency of upstream attempts in seconds",
            upstream_duration_seconds.clone(),
        );

        let store_entries: Gauge = Gauge::default();
        registry.register(
            "aegis_store_entries",
            "Entries held in the backup store",
            store_entries.clone(),
        );

        let store_bytes: Gauge = Gauge::default();
        registry.register(
            "aegis_store_bytes",
            "Approximate memory held by the backup store",
            store_bytes.clone(),
        );

        Self {
            requests_total,
            upstream_failures_total,
            upstream_duration_seconds,
            store_entries,
            store_bytes,
        }
    }

    pub fn record_outcome(&self, cache: CacheOutcome) {
        self.requests_total.get_or_create(&CacheLabels { cache }).inc();
    }

    pub fn record_failure(&self, kind: FailureKind) {
        self.upstream_failures_total
            .get_or_create(&FailureLabels { kind })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
