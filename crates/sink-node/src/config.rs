//! TOML configuration for the sink binary

use crate::error::{NodeError, NodeResult};
use serde::Deserialize;
use sink_rpc::{ControllerPolicy, RetryPolicy};
use sink_server::ServerConfig;
use sink_storage::{ArchiveRetry, CompactorConfig};
use sink_types::DEFAULT_BATCH_SIZE;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lookahead used when neither the chain nor the file sets one
const FALLBACK_LOOKAHEAD: usize = 100;

/// Whole config file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    /// RocksDB directory for the hot store
    #[serde(default = "default_hot_path")]
    pub hot_path: PathBuf,
    /// Blocks per archive batch
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Blocks in flight per chain unless the chain overrides it
    #[serde(default = "default_lookahead")]
    pub default_lookahead: usize,
    /// Cold archive
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Streaming server and status API
    #[serde(default)]
    pub server: ServerSection,
    /// Compactor
    #[serde(default)]
    pub compaction: CompactionSection,
    /// Adaptive RPC parallelism
    #[serde(default)]
    pub controller: ControllerSection,
    /// Per-request retries
    #[serde(default)]
    pub retry: RetrySection,
    /// Ingestion loop
    #[serde(default)]
    pub ingestion: IngestionSection,
    /// Chains to serve
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

fn default_hot_path() -> PathBuf {
    PathBuf::from("./data/hot")
}

fn default_batch_size() -> u64 {
    DEFAULT_BATCH_SIZE
}

fn default_lookahead() -> usize {
    FALLBACK_LOOKAHEAD
}

/// Where archive batches live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveBackend {
    /// Directory on local disk
    #[default]
    Local,
    /// S3-compatible bucket
    S3,
    /// Process memory; lost on exit
    Memory,
}

/// `[archive]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveConfig {
    /// Backend kind
    pub backend: ArchiveBackend,
    /// Root directory for the local backend
    pub path: Option<PathBuf>,
    /// Bucket for the S3 backend
    pub bucket: Option<String>,
    /// S3 region
    pub region: Option<String>,
    /// Custom S3 endpoint
    pub endpoint: Option<String>,
    /// Static S3 access key
    pub access_key: Option<String>,
    /// Static S3 secret key
    pub secret_key: Option<String>,
    /// Key prefix in front of `{chain}/...`
    pub prefix: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            backend: ArchiveBackend::Local,
            path: Some(PathBuf::from("./data/archive")),
            bucket: None,
            region: None,
            endpoint: None,
            access_key: None,
            secret_key: None,
            prefix: String::new(),
        }
    }
}

/// `[server]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    /// Streaming listen address
    pub listen_addr: SocketAddr,
    /// Status API address
    pub http_addr: SocketAddr,
    /// Head poll while a session waits at the tip
    pub tip_poll_ms: u64,
    /// Time allowed for a client's Hello
    pub handshake_timeout_secs: u64,
    /// Archive batches read ahead per session
    pub cold_lookahead: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 9091)),
            tip_poll_ms: 50,
            handshake_timeout_secs: 30,
            cold_lookahead: 10,
        }
    }
}

/// `[compaction]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompactionSection {
    /// Pause between idle cycles
    pub interval_secs: u64,
    /// Blocks a batch must trail the head by
    pub margin_blocks: u64,
    /// Batches per cycle
    pub max_batches_per_cycle: usize,
    /// Concurrent uploads
    pub upload_concurrency: usize,
}

impl Default for CompactionSection {
    fn default() -> Self {
        Self {
            interval_secs: 3,
            margin_blocks: 1000,
            max_batches_per_cycle: 100,
            upload_concurrency: 50,
        }
    }
}

/// `[controller]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerSection {
    /// Upper parallelism bound
    pub max_parallelism: usize,
    /// Lower bound; `max(2, max / 10)` when unset
    pub min_parallelism: Option<usize>,
    /// p95 below this grows the limit
    pub target_latency_ms: u64,
    /// p95 above this shrinks it sharply
    pub max_latency_ms: u64,
    /// Errors per window before halving
    pub max_errors_per_window: usize,
    /// Sample window
    pub window_secs: u64,
    /// Adjustment period
    pub tick_ms: u64,
    /// Samples needed before adjusting
    pub min_samples: usize,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            max_parallelism: 200,
            min_parallelism: None,
            target_latency_ms: 500,
            max_latency_ms: 1000,
            max_errors_per_window: 10,
            window_secs: 60,
            tick_ms: 1000,
            min_samples: 10,
        }
    }
}

/// `[retry]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    /// Attempts per request, the first included
    pub max_attempts: usize,
    /// First backoff delay
    pub base_delay_ms: u64,
    /// Backoff cap
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

/// `[ingestion]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestionSection {
    /// Wait before restarting a failed run
    pub restart_delay_secs: u64,
    /// Progress log period
    pub progress_interval_secs: u64,
    /// Node head poll while caught up
    pub head_poll_ms: u64,
}

impl Default for IngestionSection {
    fn default() -> Self {
        Self {
            restart_delay_secs: 5,
            progress_interval_secs: 5,
            head_poll_ms: 1000,
        }
    }
}

/// `[[chains]]`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    /// Chain ID
    pub chain_id: u64,
    /// Display name
    pub name: String,
    /// JSON-RPC endpoint; without one the chain is served but not ingested
    #[serde(default)]
    pub url: Option<String>,
    /// Blocks in flight override
    #[serde(default)]
    pub lookahead: Option<usize>,
    /// Parallelism cap override
    #[serde(default)]
    pub max_parallelism: Option<usize>,
    /// Fetch call traces
    #[serde(default = "default_traces")]
    pub traces: bool,
}

fn default_traces() -> bool {
    true
}

impl SinkConfig {
    /// Read and validate a config file
    pub fn load(path: &Path) -> NodeResult<Self> {
        tracing::info!("Loading config from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml(content: &str) -> NodeResult<Self> {
        let config: SinkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> NodeResult<()> {
        if self.batch_size == 0 {
            return Err(NodeError::Config("batch_size must be positive".into()));
        }
        if self.controller.max_parallelism == 0 {
            return Err(NodeError::Config("controller.max_parallelism must be positive".into()));
        }
        if let Some(min) = self.controller.min_parallelism {
            if min == 0 || min > self.controller.max_parallelism {
                return Err(NodeError::Config(format!(
                    "controller.min_parallelism {} outside 1..={}",
                    min, self.controller.max_parallelism
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(NodeError::Config("retry.max_attempts must be positive".into()));
        }
        match self.archive.backend {
            ArchiveBackend::Local if self.archive.path.is_none() => {
                return Err(NodeError::Config("archive.path is required for the local backend".into()));
            }
            ArchiveBackend::S3 if self.archive.bucket.as_deref().unwrap_or("").is_empty() => {
                return Err(NodeError::Config("archive.bucket is required for the s3 backend".into()));
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(NodeError::Config(format!("chain {} listed twice", chain.chain_id)));
            }
            if chain.max_parallelism == Some(0) {
                return Err(NodeError::Config(format!(
                    "chain {}: max_parallelism must be positive",
                    chain.chain_id
                )));
            }
        }
        Ok(())
    }

    /// Blocks in flight for `chain`: its override, then the file default,
    /// then 100
    pub fn lookahead_for(&self, chain: &ChainConfig) -> usize {
        chain
            .lookahead
            .filter(|n| *n > 0)
            .or(Some(self.default_lookahead).filter(|n| *n > 0))
            .unwrap_or(FALLBACK_LOOKAHEAD)
    }

    /// Streaming server settings
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.server.listen_addr,
            tip_poll: Duration::from_millis(self.server.tip_poll_ms.max(1)),
            handshake_timeout: Duration::from_secs(self.server.handshake_timeout_secs),
            cold_lookahead: self.server.cold_lookahead.max(1),
        }
    }

    /// Compactor settings
    pub fn compactor_config(&self) -> CompactorConfig {
        CompactorConfig {
            interval: Duration::from_secs(self.compaction.interval_secs),
            margin_blocks: self.compaction.margin_blocks,
            max_batches_per_cycle: self.compaction.max_batches_per_cycle.max(1),
            upload_concurrency: self.compaction.upload_concurrency.max(1),
        }
    }

    /// Parallelism policy for `chain`
    pub fn controller_policy(&self, chain: &ChainConfig) -> ControllerPolicy {
        let section = &self.controller;
        let mut policy =
            ControllerPolicy::with_max_parallelism(chain.max_parallelism.unwrap_or(section.max_parallelism));
        if let Some(min) = section.min_parallelism {
            policy.min_parallelism = min.min(policy.max_parallelism);
        }
        policy.target_latency = Duration::from_millis(section.target_latency_ms);
        policy.max_latency = Duration::from_millis(section.max_latency_ms);
        policy.max_errors = section.max_errors_per_window;
        policy.window = Duration::from_secs(section.window_secs);
        policy.tick = Duration::from_millis(section.tick_ms.max(1));
        policy.min_samples = section.min_samples;
        policy
    }

    /// Retry settings
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    /// Retry settings for object store requests
    pub fn archive_retry(&self) -> ArchiveRetry {
        ArchiveRetry {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }
}
