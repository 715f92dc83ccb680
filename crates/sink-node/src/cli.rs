//! CLI argument parsing for the sink binary

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Tiered block storage and streaming for EVM chains
#[derive(Parser, Debug, Clone)]
#[command(name = "sink")]
#[command(about = "Ingest EVM chains, archive them in batches and stream them to consumers")]
#[command(version)]
pub struct Cli {
    /// Config file path
    #[arg(long, default_value = "sink.toml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Override the streaming listen address
    #[arg(long)]
    pub listen_addr: Option<SocketAddr>,

    /// Override the status API address
    #[arg(long)]
    pub http_addr: Option<SocketAddr>,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["sink"]);
        assert_eq!(cli.config, PathBuf::from("sink.toml"));
        assert_eq!(cli.log_level, "info");
        assert!(!cli.json_logs);
        assert!(cli.listen_addr.is_none());
        assert!(cli.http_addr.is_none());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "sink",
            "--config",
            "/etc/sink.toml",
            "--log-level",
            "debug",
            "--json-logs",
            "--listen-addr",
            "127.0.0.1:7000",
            "--http-addr",
            "127.0.0.1:7001",
        ]);
        assert_eq!(cli.config, PathBuf::from("/etc/sink.toml"));
        assert_eq!(cli.log_level, "debug");
        assert!(cli.json_logs);
        assert_eq!(cli.listen_addr.unwrap().port(), 7000);
        assert_eq!(cli.http_addr.unwrap().port(), 7001);
    }

    #[test]
    fn test_cli_rejects_bad_addr() {
        assert!(Cli::try_parse_from(["sink", "--listen-addr", "nowhere"]).is_err());
    }
}
