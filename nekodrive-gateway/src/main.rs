//! NekoDrive Gateway
//!
//! Serves the storage engine over HTTP:
//! - Resumable chunked uploads
//! - File listing, streaming download, trash and purge
//! - Manifest snapshots and restore
//! - Health, stats and Prometheus metrics

use clap::Parser;
use nekodrive_gateway::maintenance_daemon::{MaintenanceConfig, MaintenanceDaemon};
use nekodrive_gateway::{app, cors_layer, metrics, AppState, GatewayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nekodrive-gateway")]
#[command(about = "NekoDrive storage gateway")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, env = "NEKODRIVE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// Directory holding the manifest database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep shards in memory instead of Discord (development only)
    #[arg(long, default_value = "false")]
    memory_substrate: bool,

    /// Enable CORS for all origins (development only)
    #[arg(long, default_value = "false")]
    cors_permissive: bool,

    /// Do not run the background maintenance daemon
    #[arg(long, default_value = "false")]
    no_maintenance: bool,

    /// Emit logs as JSON
    #[arg(long, env = "NEKODRIVE_LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nekodrive=debug"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    }
    .with_env_overrides()
    .with_overrides(cli.http_addr.clone(), cli.data_dir.clone(), cli.memory_substrate);
    config.server.cors_permissive |= cli.cors_permissive;
    config.validate()?;

    let http_addr = config.server.socket_addr()?;
    info!(
        http = %http_addr,
        data_dir = %config.storage.data_dir.display(),
        substrate = ?config.substrate.kind,
        chunk_size = config.storage.chunk_size,
        "Starting NekoDrive gateway"
    );

    let metrics_handle = metrics::init_metrics()?;

    // Create shared application state
    let state = Arc::new(AppState::with_config(config.clone())?);

    // Start maintenance daemon (background task)
    if config.maintenance.enabled && !cli.no_maintenance {
        let daemon_config = MaintenanceConfig::from_settings(&config.maintenance);
        let daemon = Arc::new(MaintenanceDaemon::new(daemon_config));
        let _daemon_handle = daemon.start(state.clone());
    } else {
        warn!("Maintenance daemon disabled; expired sessions and queued shard deletions will accumulate");
    }

    let cors = cors_layer(&config.server)?;

    let router = app(state.clone())
        .merge(metrics::routes(metrics_handle))
        .layer(cors);

    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    axum::serve(http_listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.manifest().flush()?;
    info!("Gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
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

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
