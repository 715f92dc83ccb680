//! EVM sink binary
//!
//! Ingests the configured chains into the hot store, archives closed
//! batches and serves block streams.

mod cli;
mod config;
mod error;
mod ingest;
mod node;
mod task;

use anyhow::Result;
use cli::Cli;
use config::SinkConfig;
use node::Node;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    tracing::info!("EVM sink starting...");

    let mut config = SinkConfig::load(&cli.config)?;
    if let Some(addr) = cli.listen_addr {
        config.server.listen_addr = addr;
    }
    if let Some(addr) = cli.http_addr {
        config.server.http_addr = addr;
    }

    let node = Node::new(config).await?;
    let (stream_addr, http_addr) = node.addresses();
    tracing::info!(
        "Serving {} chains, streaming on {}, status API on {}",
        node.registry().len(),
        stream_addr,
        http_addr
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    node.run(cancel).await?;

    tracing::info!("EVM sink stopped");
    Ok(())
}
