//! nrtsearch server binary
//!
//! Hosts one index node. The HTTP API serves ingestion and search; a second
//! TCP listener serves replication to replicas (on a primary) or the
//! handshake and ping requests (on a replica).

use clap::Parser;
use nrtsearch_core::{IndexNode, ReplicationServer};
use nrtsearch_server::{NodeServer, config::Config, router};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// nrtsearch server CLI arguments
#[derive(Parser, Debug)]
#[command(name = "nrtsearch-server")]
#[command(about = "Near-real-time search node (primary or replica)", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,

    /// TOML configuration file; NRTSEARCH_* variables override it
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "nrtsearch_server=debug,nrtsearch_core=debug,tower_http=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "nrtsearch_server=warn,nrtsearch_core=warn,tower_http=warn".into())
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(args.config.as_deref())?;
    info!(
        "Starting {} node {} for index {} (data in {:?})",
        config.node.role, config.node.node_name, config.node.index_name, config.node.data_dir
    );

    let node = IndexNode::open(config.node.clone())?;

    let replication = Arc::new(
        ReplicationServer::bind(config.node.replication.bind_addr, node.clone()).await?,
    );
    let replication_task = replication.spawn();
    node.start_background();

    let app = router(Arc::new(NodeServer::new(node.clone())));
    let listener = TcpListener::bind(&config.addr).await?;
    info!("HTTP API listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    replication.stop();
    match replication_task.await {
        Ok(Err(e)) => warn!("Replication endpoint stopped with error: {}", e),
        Err(e) => warn!("Replication endpoint task failed: {}", e),
        Ok(Ok(())) => {}
    }
    node.close().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
