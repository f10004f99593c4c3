//! portway
//!
//! Raw TCP port forwarder.
//!
//! This service:
//! - Listens on every port named in the forward table
//! - Forwards each accepted connection to that port's upstream target
//! - Buffers client bytes until the upstream connection is established
//! - Reconciles listeners whenever the forward table file changes

use std::sync::Arc;

use anyhow::{Context, Result};
use portway_forwarder::config::{Config, ForwardSource};
use portway_forwarder::forwards::ForwardTable;
use portway_forwarder::proxy::{ListenerRegistry, ServerConfig, TcpConnector};
use portway_forwarder::reload::Reloader;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PORTWAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers)
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    info!(
        workers = config.workers,
        backlog = config.backlog,
        bind_address = %config.bind_address,
        reload_interval_ms = config.reload_interval.as_millis() as u64,
        "Starting portway"
    );

    let connector = match config.connect_timeout {
        Some(timeout) => TcpConnector::with_timeout(timeout),
        None => TcpConnector::new(),
    };
    let registry = Arc::new(ListenerRegistry::new(
        ServerConfig {
            backlog: config.backlog,
        },
        Arc::new(connector),
    ));

    let mut reloader = Reloader::new(
        Arc::clone(&registry),
        config.bind_address.clone(),
        config.client.clone(),
    );

    match &config.forwards {
        ForwardSource::Inline(table) => {
            reloader
                .apply(table)
                .await
                .context("Failed to apply forward table")?;
            info!(listeners = registry.len(), "Forwarding");
            wait_for_shutdown().await;
        }
        ForwardSource::File(path) => {
            // The first table must be valid; later ones fall back to the last good one.
            let table = ForwardTable::load(path)?;
            reloader
                .apply(&table)
                .await
                .context("Failed to apply forward table")?;
            info!(listeners = registry.len(), "Forwarding");

            tokio::select! {
                _ = reloader.watch(path, config.reload_interval) => {}
                _ = wait_for_shutdown() => {}
            }
        }
    }

    let stopped = registry.stop_all().await;
    info!(stopped, "Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
