//! Node orchestration: stores, per-chain tasks, servers

use crate::config::{ArchiveBackend, ArchiveConfig, ChainConfig, SinkConfig};
use crate::error::{NodeError, NodeResult};
use crate::ingest::Ingestor;
use sink_metrics::Metrics;
use sink_rpc::{FetchController, HttpTransport, RpcBlockSource};
use sink_server::{ChainRegistry, StatusApi, StreamServer};
use sink_storage::{
    ColdArchive, Compactor, HotStore, InMemoryObjectStore, LocalFsObjectStore, ObjectStore,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Per-request timeout against chain nodes
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// A running sink: one hot store, one archive, many chains
pub struct Node {
    config: SinkConfig,
    hot: HotStore,
    archive: ColdArchive,
    registry: Arc<ChainRegistry>,
    metrics: Arc<Metrics>,
}

impl Node {
    /// Open the stores and register every configured chain
    pub async fn new(config: SinkConfig) -> NodeResult<Self> {
        std::fs::create_dir_all(&config.hot_path)?;
        let hot = HotStore::open(&config.hot_path)?;

        let store = open_object_store(&config.archive).await?;
        info!(backend = store.backend(), prefix = %config.archive.prefix, "Archive ready");
        let archive = ColdArchive::new(store, config.archive.prefix.clone(), config.batch_size)
            .with_retry(config.archive_retry());

        let registry = Arc::new(ChainRegistry::new());
        for chain in &config.chains {
            let head = initial_head(&hot, &archive, chain.chain_id).await;
            registry.register(chain.chain_id, chain.name.clone(), head);
            info!(chain_id = chain.chain_id, chain = %chain.name, head, "Chain registered");
        }

        Ok(Self {
            config,
            hot,
            archive,
            registry,
            metrics: Metrics::shared(),
        })
    }

    /// Chain registry
    pub fn registry(&self) -> &Arc<ChainRegistry> {
        &self.registry
    }

    /// Run every task until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> NodeResult<()> {
        let mut tasks = JoinSet::new();

        for chain in &self.config.chains {
            let compactor = Compactor::new(
                chain.chain_id,
                self.hot.clone(),
                self.archive.clone(),
                self.config.compactor_config(),
            )
            .with_metrics(Arc::clone(&self.metrics));
            tasks.spawn(compactor.run(cancel.clone()));

            if chain.url.is_none() {
                info!(chain_id = chain.chain_id, chain = %chain.name, "No URL configured, serving stored blocks only");
                continue;
            }
            self.spawn_ingestion(chain, &mut tasks, &cancel)?;
        }

        let server = StreamServer::new(
            self.config.server_config(),
            Arc::clone(&self.registry),
            self.hot.clone(),
            self.archive.clone(),
            Arc::clone(&self.metrics),
        )
        .with_cancel(&cancel);
        server.start().await?;

        let api = StatusApi::new(
            self.config.server.http_addr,
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
        );
        let api_cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = api.run(api_cancel).await {
                error!("Status API error: {}", e);
            }
        });

        cancel.cancelled().await;
        info!("Shutting down");
        server.stop();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Task ended abnormally: {}", e);
            }
        }
        self.hot.close();
        Ok(())
    }

    fn spawn_ingestion(
        &self,
        chain: &ChainConfig,
        tasks: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) -> NodeResult<()> {
        let url = chain.url.as_deref().unwrap_or_default();
        let transport = HttpTransport::new(url, RPC_TIMEOUT)?;
        let source = RpcBlockSource::new(transport).with_traces(chain.traces);
        let fetcher = Arc::new(
            FetchController::new(
                chain.chain_id,
                source,
                self.config.controller_policy(chain),
                self.config.retry_policy(),
            )
            .with_head_poll(Duration::from_millis(self.config.ingestion.head_poll_ms.max(1)))
            .with_metrics(Arc::clone(&self.metrics)),
        );
        let adjuster = fetcher.spawn_adjuster(cancel.clone());
        tasks.spawn(async move {
            let _ = adjuster.await;
        });

        let state = self
            .registry
            .get(chain.chain_id)
            .ok_or_else(|| NodeError::Config(format!("chain {} not registered", chain.chain_id)))?;
        let lookahead = self.config.lookahead_for(chain);
        let ingestor = Ingestor::new(fetcher, self.hot.clone(), self.archive.clone(), state, lookahead)
            .with_progress_interval(Duration::from_secs(self.config.ingestion.progress_interval_secs.max(1)))
            .with_metrics(Arc::clone(&self.metrics));
        let restart_delay = Duration::from_secs(self.config.ingestion.restart_delay_secs);
        tasks.spawn(ingestor.run(cancel.clone(), restart_delay));

        info!(chain_id = chain.chain_id, chain = %chain.name, lookahead, "Started ingestion");
        Ok(())
    }

    /// Streaming and status addresses from the config
    pub fn addresses(&self) -> (SocketAddr, SocketAddr) {
        (self.config.server.listen_addr, self.config.server.http_addr)
    }
}

/// Build the configured object store
async fn open_object_store(config: &ArchiveConfig) -> NodeResult<Arc<dyn ObjectStore>> {
    match config.backend {
        ArchiveBackend::Memory => Ok(Arc::new(InMemoryObjectStore::new())),
        ArchiveBackend::Local => {
            let path = config
                .path
                .clone()
                .ok_or_else(|| NodeError::Config("archive.path is required for the local backend".into()))?;
            std::fs::create_dir_all(&path)?;
            Ok(Arc::new(LocalFsObjectStore::new(path)))
        }
        ArchiveBackend::S3 => open_s3(config).await,
    }
}

#[cfg(feature = "s3")]
async fn open_s3(config: &ArchiveConfig) -> NodeResult<Arc<dyn ObjectStore>> {
    use sink_storage::{S3Config, S3ObjectStore};

    let s3 = S3Config {
        bucket: config.bucket.clone().unwrap_or_default(),
        region: config.region.clone(),
        endpoint: config.endpoint.clone(),
        access_key: config.access_key.clone(),
        secret_key: config.secret_key.clone(),
    };
    Ok(Arc::new(S3ObjectStore::connect(&s3).await))
}

#[cfg(not(feature = "s3"))]
async fn open_s3(_config: &ArchiveConfig) -> NodeResult<Arc<dyn ObjectStore>> {
    Err(NodeError::Config("built without the s3 feature".into()))
}

/// Head to announce before ingestion catches up: hot head, else archive
/// end, else 0
async fn initial_head(hot: &HotStore, archive: &ColdArchive, chain_id: u64) -> u64 {
    match hot.latest_block(chain_id) {
        Ok(Some(latest)) => return latest,
        Ok(None) => {}
        Err(e) => warn!(chain_id, error = %e, "Hot head lookup failed"),
    }
    match archive.latest_batch_end(chain_id).await {
        Ok(end) => end.unwrap_or(0),
        Err(e) => {
            warn!(chain_id, error = %e, "Archive listing failed");
            0
        }
    }
}
