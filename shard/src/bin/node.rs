//! Shard replica binary
//!
//! Usage: `shard-node [config.toml]`. Without a file the configuration is read
//! from `SHARD_*` environment variables.

use anyhow::Context;
use shard::{config::NodeConfig, node::Node};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => NodeConfig::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => NodeConfig::from_env().context("loading configuration from environment")?,
    };

    tracing::info!(
        shard = config.shard_id,
        node_id = config.node_id,
        listen_addr = %config.listen_addr,
        peers = ?config.peers,
        "Starting shard replica"
    );

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let node = Node::open(config).await.context("opening replica")?;

    tokio::select! {
        result = node.serve(listener) => result.context("RPC server stopped")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down shard replica"),
    }

    node.shutdown();
    Ok(())
}
