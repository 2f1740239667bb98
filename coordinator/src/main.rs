//! Membership registry coordinator service.
//!
//! Workers register here to obtain a global rank and the peer list for
//! their collective transport; a background sweep evicts workers whose
//! heartbeats go silent.
//!
//! # Usage
//!
//! ```bash
//! # Start with default settings
//! gsync-coordinator
//!
//! # Custom port and heartbeat timeout
//! gsync-coordinator --port 50101 --heartbeat-timeout 30
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gsync_core::proto::worker_registry_server::WorkerRegistryServer;
use gsync_core::transport::ServerManager;
use gsync_coordinator::{RegistryService, RegistryState};

/// Membership registry for synchronized training jobs
#[derive(Parser, Debug)]
#[command(name = "gsync-coordinator")]
#[command(about = "Membership registry service for synchronized training jobs")]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0")]
    address: String,

    /// Port to listen on
    #[arg(short, long, default_value = "50100")]
    port: u16,

    /// Heartbeat timeout in seconds
    #[arg(long, default_value = "15")]
    heartbeat_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let timeout = Duration::from_secs(args.heartbeat_timeout);

    tracing::info!("Starting gsync coordinator");
    tracing::info!("  Heartbeat timeout: {}s", args.heartbeat_timeout);

    let state = Arc::new(RegistryState::new(timeout));

    // Eviction sweep: period timeout/2 bounds detection of a silent
    // worker to 1.5x the heartbeat timeout.
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(timeout / 2);
        loop {
            interval.tick().await;
            for worker_id in sweep_state.evict_stale().await {
                tracing::warn!("Worker {} timed out", worker_id);
            }
        }
    });

    let service = RegistryService::new(state);
    let router = Server::builder().add_service(WorkerRegistryServer::new(service));

    let mut server = ServerManager::new();
    let addr = server
        .start(&format!("{}:{}", args.address, args.port), router)
        .await?;
    tracing::info!("Listening on {}", addr);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down coordinator...");
    server.graceful_stop().await;

    Ok(())
}
