mod cache;
mod config;
mod health;
mod http;
mod metrics;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::Store;
use crate::config::{Config, LoggingConfig};
use crate::http::gateway::{Gateway, GatewayOptions};
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "aegis", about = "Caching failover reverse proxy")]
struct Cli {
    /// Path to the YAML configuration file.  When it does not exist the
    /// usual locations (`config.yaml`, `aegis.yaml`, `/etc/aegis/config.yaml`)
    /// are tried in order.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway: Arc<Gateway>,
    /// Same store the gateway writes into; read by `/stats` and `/metrics`.
    pub store: Arc<Store>,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn env_filter(logging: &LoggingConfig) -> EnvFilter {
    if !logging.enabled {
        return EnvFilter::new("off");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logging.level.as_filter()))
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr: SocketAddr = state
        .config
        .server
        .listen
        .parse()
        .context("invalid server.listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let loaded = config::discover_config(&cli.config)?;
    let config = Arc::new(loaded.config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(env_filter(&config.logging))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    for (path, err) in &loaded.skipped {
        tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "skipped unusable config file");
    }
    tracing::info!(config_path = %loaded.path.display(), "starting aegis");

    // ---- Gateway ----
    let options = GatewayOptions::from_config(&config)?;
    let http_client = http::gateway::build_client()?;
    let store = Arc::new(Store::new());
    let metrics = MetricsRegistry::new();

    tracing::info!(
        listen = %config.server.listen,
        upstream = %options.upstream,
        timeout_ms = options.timeout.as_millis() as u64,
        ttl_secs = options.ttl.as_secs(),
        key_headers = ?options.key_headers,
        served_by = %options.name,
        request_timeout_ms = config.server.request_timeout.map(|d| d.as_millis() as u64),
        "proxy configured"
    );

    let gateway = Gateway::new(
        options,
        http_client,
        Arc::clone(&store),
        Arc::clone(&metrics.metrics),
    )?;

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        gateway: Arc::new(gateway),
        store: Arc::clone(&store),
        metrics,
    };

    // ---- Background sweeper ----
    let sweeper = config.cache.sweep_interval.map(|every| {
        tracing::info!(interval_ms = every.as_millis() as u64, "backup sweeper enabled");
        tokio::spawn(cache::run_sweeper(Arc::clone(&store), every))
    });

    // ---- Serve until shutdown ----
    let result = run_http_server(state).await;

    if let Some(handle) = sweeper {
        handle.abort();
    }

    match &result {
        Ok(()) => tracing::info!("aegis shut down cleanly"),
        Err(e) => tracing::error!(error = %format!("{e:#}"), "HTTP server failed"),
    }
    result
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::filter::LevelFilter;

    use super::*;

    #[test]
    fn cli_defaults_to_local_config() {
        let cli = Cli::parse_from(["aegis"]);
        assert_eq!(cli.config, PathBuf::from("config.yaml"));

        let cli = Cli::parse_from(["aegis", "--config", "/tmp/custom.yaml"]);
        assert_eq!(cli.config, PathBuf::from("/tmp/custom.yaml"));
    }

    #[test]
    fn disabled_logging_turns_filter_off() {
        let logging = LoggingConfig {
            enabled: false,
            ..LoggingConfig::default()
        };
        assert_eq!(env_filter(&logging).max_level_hint(), Some(LevelFilter::OFF));
    }
}
