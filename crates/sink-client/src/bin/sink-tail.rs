//! Tail a chain from an EVM sink, or list the chains it serves

use anyhow::Result;
use clap::Parser;
use sink_client::SinkClient;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Follow a sink stream and report throughput
#[derive(Parser, Debug)]
#[command(name = "sink-tail")]
#[command(version)]
struct Cli {
    /// Sink server address
    #[arg(long, default_value = "127.0.0.1:9090")]
    addr: String,

    /// Chain to stream; omit to list chains
    #[arg(long)]
    chain: Option<u64>,

    /// First block to stream
    #[arg(long, default_value = "1")]
    from: u64,

    /// Exit on disconnect instead of reconnecting
    #[arg(long)]
    no_reconnect: bool,

    /// Seconds between throughput reports
    #[arg(long, default_value = "5")]
    report_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let cancel = CancellationToken::new();
    let client = SinkClient::new(&cli.addr)
        .with_reconnect(!cli.no_reconnect)
        .with_cancel(cancel.clone());

    let Some(chain_id) = cli.chain else {
        for chain in client.list_chains().await? {
            println!("{}\t{}\tlatest={}", chain.chain_id, chain.name, chain.latest_block);
        }
        return Ok(());
    };

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received");
        cancel.cancel();
    });

    let report_every = Duration::from_secs(cli.report_secs.max(1));
    let mut window_start = Instant::now();
    let mut window_blocks = 0u64;
    let mut total = 0u64;

    tracing::info!(chain_id, from_block = cli.from, addr = %cli.addr, "Streaming");
    client
        .stream(chain_id, cli.from, |block| {
            window_blocks += 1;
            total += 1;
            let elapsed = window_start.elapsed();
            if elapsed >= report_every {
                let rate = window_blocks as f64 / elapsed.as_secs_f64();
                tracing::info!(
                    chain_id,
                    block = block.number,
                    total,
                    "{:.1} blocks/s",
                    rate
                );
                window_start = Instant::now();
                window_blocks = 0;
            }
            Ok(())
        })
        .await?;

    tracing::info!(chain_id, total, "Stream finished");
    Ok(())
}
