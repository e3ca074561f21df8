use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use filehost_storage::api::{start_api_server, AppState};
use filehost_storage::config::Config;
use filehost_storage::fallback::FallbackReader;
use filehost_storage::metadata::{InMemoryMetadataStore, MetadataStore};
use filehost_storage::redundancy::RedundancyManager;
use filehost_storage::registry::ProviderRegistry;
use filehost_storage::router::SmartRouter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        mode = ?config.routing.mode,
        "Starting file hosting storage service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let metadata_store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());

    let registry = Arc::new(ProviderRegistry::new(config.clone()));
    for status in registry.list_available() {
        info!(provider = %status.kind, configured = status.configured, "storage provider");
    }

    let router = SmartRouter::new(&config.routing);

    let manager = Arc::new(RedundancyManager::new(
        registry.clone(),
        router,
        metadata_store.clone(),
    ));

    let reader = Arc::new(FallbackReader::new(
        registry.clone(),
        metadata_store.clone(),
        config.fallback.clone(),
    ));

    // Create API state
    let api_state = AppState {
        registry,
        manager,
        reader,
        metadata_store,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    info!("Storage service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down storage service");

    api_handle.abort();

    info!("Storage service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
