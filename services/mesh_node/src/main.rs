//! Mesh node entry point

use anyhow::Result;
use clap::Parser;
use mesh_config::NodeConfig;
use mesh_node::{init_logging, Node};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level; overrides the configured one, `RUST_LOG` overrides both
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = NodeConfig::load(args.config.as_deref())?;

    let level = args.log_level.as_deref().unwrap_or(&config.node.log_level);
    init_logging(level, args.json_logs);

    info!("Starting mesh node {}", config.node.name);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let node = Node::start(&config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    node.shutdown().await?;

    Ok(())
}
