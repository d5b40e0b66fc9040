//! Cumulus Storage Node Daemon
//!
//! Runs one storage node that:
//! - Stores erasure-coded shares in local value files
//! - Serves archive and retrieve requests from the other nodes
//! - Coordinates archives and retrieves across the cluster
//! - Forwards shares held for it by other nodes while it was down
//! - Reports metrics via a Prometheus endpoint

use clap::Parser;
use cumulus_network::TcpTransport;
use cumulus_node::{init_metrics, metrics, NodeConfig, StorageNode};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cumulus-node")]
#[command(about = "Cumulus storage node daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Node name (overrides config file)
    #[arg(short, long)]
    node_name: Option<String>,

    /// Storage directory (overrides config file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(level: &str, format: &str, verbose: bool) {
    let level = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Priority: CLI args > environment > config.toml > defaults
    let config = NodeConfig::load_or_default(&cli.config)
        .with_overrides(cli.node_name, cli.data_dir)
        .with_env_overrides();

    init_tracing(&config.log.level, &config.log.format, cli.verbose);
    info!("Cumulus storage node starting...");

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        return Err(e.into());
    }
    info!(
        node_name = %config.node.name,
        data_dir = ?config.storage.data_dir,
        nodes = config.cluster.nodes.len(),
        min_segments = config.cluster.min_segments,
        num_segments = config.cluster.num_segments,
        "Configuration loaded"
    );

    init_metrics();
    if config.metrics.enabled {
        metrics::install_exporter(config.metrics.port)?;
    }

    let transport = Arc::new(TcpTransport::with_config(config.network_config().tcp));
    let halt = CancellationToken::new();
    let node = StorageNode::start(&config, transport, halt.clone()).await?;

    info!("========================================");
    info!("  Node:        {}", node.name());
    if let Some(local) = config.local_node() {
        info!("  Writer:      {}", local.writer_address);
        info!("  Reader:      {}", local.reader_address);
        info!("  Replies:     {}", local.reply_address);
    }
    if config.metrics.enabled {
        info!("  Metrics:     http://0.0.0.0:{}/metrics", config.metrics.port);
    }
    info!("========================================");
    info!("Press Ctrl+C to shut down");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = halt.cancelled() => {}
    }

    info!("Shutting down...");
    node.shutdown().await;
    info!("Cumulus node stopped");
    Ok(())
}
