use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{HeaderName, HeaderValue};
use reqwest::Url;
use serde::{Deserialize, Deserializer};

/// Locations tried, in order, when the requested config file does not exist.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["config.yaml", "aegis.yaml", "/etc/aegis/config.yaml"];

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Base URL of the single upstream. Its path is prefixed to every
    /// forwarded request path.
    pub upstream: String,
    /// Budget for one upstream attempt, including reading the whole body.
    #[serde(default = "default_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// Value of the `X-Served-By` response header.
    #[serde(default = "default_name")]
    pub name: String,
    /// Overall deadline for handling one inbound request.  When set, the
    /// upstream attempt gets `min(timeout, time left before the deadline)`.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub request_timeout: Option<Duration>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_name() -> String {
    "Aegis".to_string()
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    /// How long a stored response stays usable as a backup. Zero keeps
    /// entries for the lifetime of the process.
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub ttl: Duration,
    /// Request headers whose values are folded into the cache key, in order.
    #[serde(default)]
    pub key_headers: Vec<String>,
    /// When set, expired entries are physically removed on this interval.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub sweep_interval: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// On unless explicitly disabled; a config without a `logging` section
    /// still gets startup and failover logs.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub access_log: bool,
    #[serde(default)]
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            access_log: false,
            level: LogLevel::default(),
        }
    }
}

fn bool_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Parse a duration such as `250ms`, `1.5s` or `1h30m`.
///
/// Accepted units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`.  A bare
/// `0` is the only unitless value allowed.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    anyhow::ensure!(!s.is_empty(), "empty duration");
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        anyhow::ensure!(num_len > 0, "invalid duration {input:?}: expected a number");
        let value: f64 = rest[..num_len]
            .parse()
            .with_context(|| format!("invalid duration {input:?}"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            "" => anyhow::bail!("invalid duration {input:?}: missing unit"),
            unit => anyhow::bail!("invalid duration {input:?}: unknown unit {unit:?}"),
        };
        rest = &rest[unit_len..];
        total_nanos += value * scale;
    }

    anyhow::ensure!(
        total_nanos.is_finite() && total_nanos <= u64::MAX as f64,
        "invalid duration {input:?}: out of range"
    );
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_duration(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Result of config discovery.
#[derive(Debug)]
pub struct LoadedConfig {
    pub path: PathBuf,
    pub config: Config,
    /// Fallback candidates that existed but could not be loaded.
    pub skipped: Vec<(PathBuf, anyhow::Error)>,
}

/// Load the config at `requested`, or the first usable file from
/// [`DEFAULT_CONFIG_PATHS`] when `requested` does not exist.
pub fn discover_config(requested: &Path) -> Result<LoadedConfig> {
    discover_config_in(requested, DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from))
}

fn discover_config_in<I>(requested: &Path, fallbacks: I) -> Result<LoadedConfig>
where
    I: IntoIterator<Item = PathBuf>,
{
    // An explicit file that exists must load; its errors are never masked.
    if requested.exists() {
        let config = load_config(requested)?;
        return Ok(LoadedConfig {
            path: requested.to_path_buf(),
            config,
            skipped: Vec::new(),
        });
    }

    let mut tried = vec![requested.display().to_string()];
    let mut skipped = Vec::new();
    for candidate in fallbacks {
        tried.push(candidate.display().to_string());
        if !candidate.exists() {
            continue;
        }
        match load_config(&candidate) {
            Ok(config) => {
                return Ok(LoadedConfig {
                    path: candidate,
                    config,
                    skipped,
                })
            }
            Err(e) => skipped.push((candidate, e)),
        }
    }

    anyhow::bail!("no usable config file found (tried: {})", tried.join(", "))
}

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)
        .with_context(|| format!("invalid config file: {}", path.display()))?;
    Ok(config)
}

/// Parse the upstream base URL, accepting only absolute `http`/`https` URLs.
pub fn parse_upstream(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("invalid upstream URL: {raw:?}"))?;
    anyhow::ensure!(
        matches!(url.scheme(), "http" | "https"),
        "upstream URL must use http or https, got {:?}",
        url.scheme()
    );
    anyhow::ensure!(url.host_str().is_some(), "upstream URL has no host: {raw:?}");
    Ok(url)
}

/// Checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    parse_upstream(&config.server.upstream)?;
    anyhow::ensure!(
        !config.server.timeout.is_zero(),
        "server.timeout must be greater than zero"
    );
    HeaderValue::from_str(&config.server.name)
        .with_context(|| format!("server.name is not a valid header value: {:?}", config.server.name))?;
    for name in &config.cache.key_headers {
        HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("cache.key_headers contains an invalid header name: {name:?}"))?;
    }
    if let Some(deadline) = config.server.request_timeout {
        anyhow::ensure!(
            !deadline.is_zero(),
            "server.request_timeout must be greater than zero when set"
        );
    }
    if let Some(interval) = config.cache.sweep_interval {
        anyhow::ensure!(
            !interval.is_zero(),
            "cache.sweep_interval must be greater than zero when set"
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
