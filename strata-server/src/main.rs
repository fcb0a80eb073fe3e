//! Strata Server - blocklist poller, compactor and HTTP read path

mod api;
mod config;

use anyhow::Context;
use clap::Parser;
use config::ServerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::backend::{Backend, LocalStore};
use strata_core::blocklist::{Blocklist, Poller, PollerConfig};
use strata_core::compaction::Compactor;
use strata_core::index::{JobSharder, OwnsNothingSharder};
use strata_core::ring::{HashRing, Ring, RingSharder};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "strata", version, about = "Blocklist poller and compactor")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => {
            let mut config = ServerConfig::default();
            config.prepare()?;
            config
        }
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("Starting Strata server...");
    info!("Bucket directory: {:?}", config.bucket_dir);
    info!("HTTP server: http://{}", config.http_addr);

    let store = LocalStore::new(&config.bucket_dir)
        .with_context(|| format!("failed to open bucket at {:?}", config.bucket_dir))?;
    let backend = Backend::new(Arc::new(store), config.storage.backend_timeout);
    // compacted inputs are cleared after their retention, nothing to re-apply past it
    let blocklist = Arc::new(match &config.compactor {
        Some(compactor) => Blocklist::with_pending_ttl(compactor.compacted_block_retention),
        None => Blocklist::new(),
    });

    // only compactors take part in the ring
    let sharder: Arc<dyn JobSharder> = if config.compactor.is_some() {
        let ring = HashRing::from_config(&config.ring)?;
        info!(
            instance = %config.ring.instance_id,
            members = ring.members().len(),
            "joined compactor ring"
        );
        Arc::new(RingSharder::new(Arc::new(ring), config.ring.instance_id.clone()))
    } else {
        Arc::new(OwnsNothingSharder)
    };

    let poller = Arc::new(Poller::new(
        PollerConfig::from(&config.storage),
        backend.clone(),
        blocklist.clone(),
        sharder.clone(),
    ));

    // serve a populated blocklist from the first request
    match poller.poll_cycle().await {
        Ok(summary) => info!(
            tenants = summary.tenants,
            blocks = summary.blocks,
            "initial blocklist poll complete"
        ),
        Err(e) => warn!(error = %e, "initial blocklist poll failed, starting with an empty blocklist"),
    }

    let compactor = match config.compactor.clone() {
        Some(compactor_config) => Some(Arc::new(Compactor::new(
            compactor_config,
            backend.clone(),
            blocklist.clone(),
            sharder.clone(),
        )?)),
        None => None,
    };

    let cancel = CancellationToken::new();
    let mut tasks = vec![tokio::spawn(poller.clone().run(cancel.clone()))];
    if let Some(compactor) = &compactor {
        tasks.push(tokio::spawn(compactor.clone().run(cancel.clone())));
    }

    // Create router
    let app = api::create_router(api::AppState {
        blocklist,
        poller,
        compactor,
    });

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("Strata server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    info!("Strata server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        return cancel.cancelled().await;
    }
    info!("Shutdown signal received");
    cancel.cancel();
}
