//! # Service Gateway - Main Entry Point
//!
//! Loads configuration, installs logging and metrics, picks the rate-limit
//! store, seeds the registry and serves until SIGTERM or SIGINT.
//!
//! Configuration is read from `GATEWAY_CONFIG_PATH` (default
//! `config/gateway.yaml`); a missing file means built-in defaults.

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use service_gateway::core::config::RateLimitStoreConfig;
use service_gateway::observability::{init_logging, MetricsExporter};
use service_gateway::storage::{KeyValueStore, MemoryStore, RedisStore};
use service_gateway::{Gateway, GatewayConfig};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = GatewayConfig::load_or_default(&config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    init_logging(&config.observability.logging).context("Failed to initialize logging")?;

    info!("🚀 Starting Service Gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(path = %config_path, "✅ Configuration loaded and validated");

    let shutdown = CancellationToken::new();

    let exporter = if config.observability.metrics.prometheus_enabled {
        match MetricsExporter::install() {
            Ok(exporter) => {
                info!(path = %config.observability.metrics.endpoint_path, "📈 Prometheus metrics enabled");
                Some(exporter)
            }
            Err(e) => {
                warn!(error = %e, "Metrics recorder not installed, continuing without metrics");
                None
            }
        }
    } else {
        None
    };

    let store = build_store(&config, shutdown.clone()).await;

    let mut gateway = Gateway::build(config, store).context("Failed to assemble gateway")?;
    if let Some(exporter) = exporter {
        gateway = gateway.with_metrics_exporter(exporter);
    }

    let stats = gateway.registry().stats();
    info!(
        services = stats.total_services,
        instances = stats.total_instances,
        "🗂️  Registry ready"
    );

    let event_log = gateway.spawn_event_log(shutdown.clone());
    let prober = gateway
        .spawn_prober(shutdown.clone())
        .context("Failed to start health prober")?;

    let server_config = &gateway.config().server;
    let bind_addr = format!("{}:{}", server_config.bind_address, server_config.http_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;

    tokio::spawn(wait_for_signal(shutdown.clone()));

    if let Err(e) = gateway.serve(listener, shutdown.clone()).await {
        error!(error = %e, "Server error");
        shutdown.cancel();
        return Err(e.into());
    }

    shutdown.cancel();
    info!("🧹 Stopping background tasks...");
    let _ = event_log.await;
    if let Some(prober) = prober {
        let _ = prober.await;
    }

    info!("✅ Service Gateway shutdown complete");
    Ok(())
}

/// Pick the rate-limit store; an unreachable Redis falls back to memory
async fn build_store(config: &GatewayConfig, shutdown: CancellationToken) -> Arc<dyn KeyValueStore> {
    if let RateLimitStoreConfig::Redis { url, key_prefix } = &config.rate_limiting.store {
        let connected = match RedisStore::connect(url, key_prefix.clone()).await {
            Ok(store) => store.ping().await.map(|()| store),
            Err(e) => Err(e),
        };
        match connected {
            Ok(store) => return Arc::new(store),
            Err(e) => {
                error!(
                    url = %url,
                    error = %e,
                    "Redis unreachable at startup, counting rate windows in memory"
                );
            }
        }
    }

    let store = Arc::new(MemoryStore::new());
    store.clone().spawn_sweeper(config.rate_limiting.sweep_interval, shutdown);
    info!("🧠 In-memory rate limit store enabled");
    store
}

/// Cancel `shutdown` on SIGTERM or SIGINT
async fn wait_for_signal(shutdown: CancellationToken) {
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = terminate => info!("📡 Received SIGTERM, initiating graceful shutdown..."),
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("📡 Received SIGINT (Ctrl+C), initiating graceful shutdown..."),
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGINT");
                return;
            }
        },
        _ = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}
