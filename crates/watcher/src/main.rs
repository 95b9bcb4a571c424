//! Node load watcher service
//!
//! Polls a metrics provider once per minute, keeps a sliding window of
//! per-node utilisation snapshots in memory, and serves raw and analyzed
//! snapshots over a JSON API for scheduling components.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use watcher::{api, config};
use watcher_lib::{create_provider, MetricsProviderOpts, Watcher};

/// How long in-flight connections get to drain after a shutdown signal.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("starting node load watcher");

    let service_config = config::ServiceConfig::load()?;
    let opts = MetricsProviderOpts::from_env()?;
    let provider = create_provider(&opts)?;
    info!(provider = provider.name(), port = service_config.port, "watcher configured");

    let watcher = Watcher::new(provider.clone());
    let (shutdown_tx, _) = broadcast::channel(1);
    watcher.start(shutdown_tx.subscribe());

    let state = Arc::new(api::AppState::new(watcher, provider));
    let server = tokio::spawn(api::serve(
        service_config.port,
        state,
        shutdown_tx.subscribe(),
    ));

    shutdown_signal().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, server).await {
        Ok(joined) => joined??,
        Err(_) => warn!("server did not drain within the grace period"),
    }

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map_err(Into::into),
        _ = sigterm.recv() => Ok(()),
    }
}
