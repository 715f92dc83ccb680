//! Per-chain ingestion: node → hot store

use crate::error::IngestError;
use crate::task::run_restartable;
use sink_metrics::{labeled, Metrics};
use sink_rpc::{BlockSource, FetchController};
use sink_server::ChainState;
use sink_storage::{ColdArchive, HotStore};
use sink_types::FIRST_BLOCK;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Owns the write cursor of one chain
pub struct Ingestor<S> {
    name: String,
    fetcher: Arc<FetchController<S>>,
    hot: HotStore,
    archive: ColdArchive,
    chain: Arc<ChainState>,
    lookahead: usize,
    progress_interval: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl<S: BlockSource> Ingestor<S> {
    /// Create an ingestor writing into `hot` and announcing heads on `chain`
    pub fn new(
        fetcher: Arc<FetchController<S>>,
        hot: HotStore,
        archive: ColdArchive,
        chain: Arc<ChainState>,
        lookahead: usize,
    ) -> Self {
        Self {
            name: chain.name().to_string(),
            fetcher,
            hot,
            archive,
            chain,
            lookahead: lookahead.max(1),
            progress_interval: Duration::from_secs(5),
            metrics: None,
        }
    }

    /// Progress log period
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Count ingested blocks into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn chain_id(&self) -> u64 {
        self.chain.chain_id()
    }

    /// First block to fetch: after the hot head, else after the last
    /// archived batch, else block 1
    pub async fn resume_point(&self) -> Result<u64, IngestError> {
        let chain_id = self.chain_id();
        if let Some(latest) = self.hot.latest_block(chain_id)? {
            info!(chain_id, chain = %self.name, block = latest + 1, "Resuming from hot store");
            return Ok(latest + 1);
        }
        if let Some(end) = self.archive.latest_batch_end(chain_id).await? {
            if end > 0 {
                info!(chain_id, chain = %self.name, block = end + 1, "Resuming from archive");
                return Ok(end + 1);
            }
        }
        info!(chain_id, chain = %self.name, "Starting from block {}", FIRST_BLOCK);
        Ok(FIRST_BLOCK)
    }

    /// One streaming run. Returns the next expected block once cancelled;
    /// any other exit is an error.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<u64, IngestError> {
        let chain_id = self.chain_id();
        let start = self.resume_point().await?;
        let mut expected = start;

        let stream_cancel = cancel.child_token();
        let _stop_stream = stream_cancel.clone().drop_guard();
        let mut blocks = self.fetcher.stream_from(start, self.lookahead, stream_cancel);

        let counter = labeled("ingested_blocks", chain_id);
        let started = Instant::now();
        let mut last_report = Instant::now();

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Ok(expected),
                item = blocks.recv() => item,
            };
            let Some(item) = item else {
                if cancel.is_cancelled() {
                    return Ok(expected);
                }
                return Err(IngestError::StreamClosed);
            };

            let block = item?;
            // the block's own number, not the request counter
            let number = block.number()?;
            if number != expected {
                return Err(IngestError::OutOfOrder { expected, got: number });
            }
            let record = block.to_record()?;
            self.hot.save_block(chain_id, number, &record)?;
            self.chain.update_latest(number);
            if let Some(metrics) = &self.metrics {
                metrics.counter(&counter, 1);
            }
            expected += 1;

            if last_report.elapsed() >= self.progress_interval {
                last_report = Instant::now();
                self.log_progress(start, expected, started.elapsed()).await;
            }
        }
    }

    async fn log_progress(&self, start: u64, next: u64, elapsed: Duration) {
        let ingested = next - start;
        let rate = ingested as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        let behind = match self.fetcher.latest_block_number().await {
            Ok(head) => (head + 1).saturating_sub(next),
            Err(e) => {
                debug!(chain_id = self.chain_id(), error = %e, "Head lookup for progress failed");
                0
            }
        };
        let eta = if rate > 0.0 {
            Duration::from_secs_f64(behind as f64 / rate)
        } else {
            Duration::ZERO
        };
        info!(
            chain_id = self.chain_id(),
            chain = %self.name,
            "block {} | {:.1} blk/s avg | {} behind, eta {} | p={} p95={}ms",
            next - 1,
            rate,
            behind,
            format_duration(eta),
            self.fetcher.current_parallelism(),
            self.fetcher.p95_latency().as_millis()
        );
    }

    /// Ingest until cancelled, restarting from the stores after every
    /// failure
    pub async fn run(self, cancel: CancellationToken, restart_delay: Duration) {
        info!(chain_id = self.chain_id(), chain = %self.name, lookahead = self.lookahead, "Ingestion started");
        let this = &self;
        run_restartable("Ingestion", self.chain_id(), restart_delay, cancel, |token| async move {
            this.run_once(&token).await.map(|_| ())
        })
        .await;
        info!(chain_id = self.chain_id(), chain = %self.name, "Ingestion stopped");
    }
}

/// `42s`, `7m`, `3h5m`, `2d4h0m`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64().round() as u64;
    if secs < 60 {
        return format!("{}s", secs);
    }
    let minutes = (secs + 30) / 60;
    let (days, rest) = (minutes / 1440, minutes % 1440);
    let (hours, minutes) = (rest / 60, rest % 60);
    if days > 0 {
        format!("{}d{}h{}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h{}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use sink_rpc::{ControllerPolicy, RetryPolicy, RpcError, RpcResult};
    use sink_server::ChainRegistry;
    use sink_storage::InMemoryObjectStore;
    use sink_types::{Batch, NormalizedBlock};
    use std::sync::atomic::{AtomicU64, Ordering};

    const CHAIN: u64 = 1;

    fn record(n: u64) -> Vec<u8> {
        NormalizedBlock::new(json!({ "number": format!("{:#x}", n) }))
            .to_record()
            .unwrap()
    }

    /// Node serving blocks up to `head`; `lie_at` returns the wrong block once
    #[derive(Default)]
    struct FakeNode {
        head: AtomicU64,
        lie_at: AtomicU64,
    }

    #[async_trait]
    impl BlockSource for FakeNode {
        async fn fetch_block(&self, number: u64) -> RpcResult<NormalizedBlock> {
            if number > self.head.load(Ordering::SeqCst) {
                return Err(RpcError::BlockNotFound(number));
            }
            let lie = self
                .lie_at
                .compare_exchange(number, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            let reported = if lie { number + 1 } else { number };
            Ok(NormalizedBlock::new(json!({ "number": format!("{:#x}", reported) })))
        }

        async fn latest_block_number(&self) -> RpcResult<u64> {
            Ok(self.head.load(Ordering::SeqCst))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        hot: HotStore,
        archive: ColdArchive,
        registry: Arc<ChainRegistry>,
        node: Arc<FetchController<FakeNode>>,
    }

    fn fixture(head: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let hot = HotStore::open(dir.path().join("hot")).unwrap();
        let archive = ColdArchive::new(Arc::new(InMemoryObjectStore::new()), "", 100);
        let registry = Arc::new(ChainRegistry::new());
        registry.register(CHAIN, "test", 0);

        let source = FakeNode::default();
        source.head.store(head, Ordering::SeqCst);
        let retry = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let node = Arc::new(
            FetchController::new(CHAIN, source, ControllerPolicy::with_max_parallelism(8), retry)
                .with_head_poll(Duration::from_millis(10)),
        );
        Fixture {
            _dir: dir,
            hot,
            archive,
            registry,
            node,
        }
    }

    impl Fixture {
        fn ingestor(&self) -> Ingestor<FakeNode> {
            let chain = self.registry.get(CHAIN).unwrap();
            Ingestor::new(Arc::clone(&self.node), self.hot.clone(), self.archive.clone(), chain, 4)
        }

        async fn wait_for_head(&self, target: u64) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.registry.latest(CHAIN) < Some(target) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_resume_point_priority() {
        let f = fixture(0);
        let ingestor = f.ingestor();
        assert_eq!(ingestor.resume_point().await.unwrap(), 1);

        f.archive
            .upload(CHAIN, Batch::starting_at(0, 100), record(1).into())
            .await
            .unwrap();
        f.archive
            .upload(CHAIN, Batch::starting_at(100, 100), record(100).into())
            .await
            .unwrap();
        assert_eq!(ingestor.resume_point().await.unwrap(), 200);

        f.hot.save_block(CHAIN, 250, &record(250)).unwrap();
        assert_eq!(ingestor.resume_point().await.unwrap(), 251);
    }

    #[tokio::test]
    async fn test_ingests_in_order_and_follows_head() {
        let f = fixture(20);
        let cancel = CancellationToken::new();
        let ingestor = f.ingestor();
        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { ingestor.run_once(&cancel).await })
        };

        f.wait_for_head(20).await;
        f.node.source().head.store(25, Ordering::SeqCst);
        f.wait_for_head(25).await;

        cancel.cancel();
        assert_eq!(run.await.unwrap().unwrap(), 26);

        let stored = f.hot.range_scan(CHAIN, 1, 100).unwrap();
        let numbers: Vec<u64> = stored.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, (1..=25).collect::<Vec<_>>());
        for (n, data) in &stored {
            assert_eq!(sink_types::record_block_number(data).unwrap(), *n);
        }
    }

    #[tokio::test]
    async fn test_mismatched_number_stops_run() {
        let f = fixture(10);
        f.node.source().lie_at.store(6, Ordering::SeqCst);

        let err = f.ingestor().run_once(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, IngestError::OutOfOrder { expected: 6, got: 7 }));
        // everything before the bad block was kept
        assert_eq!(f.hot.latest_block(CHAIN).unwrap(), Some(5));
        assert_eq!(f.registry.latest(CHAIN), Some(5));
    }

    #[tokio::test]
    async fn test_restart_resumes_after_failure() {
        let f = fixture(10);
        f.node.source().lie_at.store(6, Ordering::SeqCst);

        let cancel = CancellationToken::new();
        let ingestor = f.ingestor();
        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { ingestor.run(cancel, Duration::from_millis(20)).await })
        };

        f.wait_for_head(10).await;
        cancel.cancel();
        run.await.unwrap();

        let numbers: Vec<u64> = f.hot.range_scan(CHAIN, 1, 100).unwrap().iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(7 * 60 + 10)), "7m");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 5 * 60)), "3h5m");
        assert_eq!(format_duration(Duration::from_secs(2 * 86400 + 4 * 3600)), "2d4h0m");
    }
}
