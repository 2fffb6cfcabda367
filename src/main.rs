//! gpu-partd: GPU partition manager daemon.
//!
//! Owns the partition topology of one device, restores it on startup and
//! saves it on shutdown. Clients drive it over HTTP.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gpu_partd::collab::sim::SimDevice;
use gpu_partd::config::{Cli, Config};
use gpu_partd::control::{new_shared_control_plane, ControlPlane};
use gpu_partd::metrics::Metrics;
use gpu_partd::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "gpu_partd=debug,tower_http=debug"
    } else {
        "gpu_partd=info,tower_http=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("gpu-partd v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        generation = ?config.device.generation,
        memory_size = config.device.memory_size,
        invalid_swizz_mask = %format!("{:#x}", config.device.invalid_swizz_mask),
        platform = config.platform.name(),
        record = %config.persistence.path.display(),
        "Configuration loaded"
    );

    // Device collaborators.
    let device = SimDevice::new(config.device.memory_size);

    let metrics = Metrics::new().context("registering metrics")?;
    let mut control = ControlPlane::from_config(&config, device.collaborators(), metrics.clone())?;

    // Restore the saved (or boot) topology.
    match control.attach() {
        Ok(outcome) => info!(
            source = ?outcome.source,
            gpu_partitions = ?outcome.gpu_partitions,
            "Topology restored"
        ),
        Err(err) => error!(error = %err, "Topology restore failed, starting with partitioning disabled"),
    }

    let control = new_shared_control_plane(control);
    let state = Arc::new(AppState {
        control: control.clone(),
        config: config.clone(),
        metrics,
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Save and detach.
    let mut control = control.write().await;
    if let Err(err) = control.shutdown(config.persistence.save_on_shutdown) {
        error!(error = %err, "Saving topology on shutdown failed");
    }
    info!("Stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
