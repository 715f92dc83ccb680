//! Client against a real streaming server

use bytes::Bytes;
use serde_json::json;
use sink_client::{ClientError, SinkClient};
use sink_metrics::Metrics;
use sink_server::{ChainRegistry, ServerConfig, StreamServer};
use async_trait::async_trait;
use sink_storage::{
    ArchiveRetry, ColdArchive, HotStore, InMemoryObjectStore, ObjectStore, StorageError,
    StorageResult,
};
use sink_types::codec::ARCHIVE_LEVEL;
use sink_types::{compress_records, NormalizedBlock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CHAIN: u64 = 43114;

fn record(n: u64) -> Vec<u8> {
    NormalizedBlock::new(json!({ "number": format!("{:#x}", n), "hash": format!("0x{:064x}", n) }))
        .to_record()
        .unwrap()
}

struct Sink {
    _dir: tempfile::TempDir,
    hot: HotStore,
    archive: ColdArchive,
    registry: Arc<ChainRegistry>,
    _server: StreamServer,
    addr: SocketAddr,
}

/// Rejects the first `throttled` reads the way an overloaded bucket does
struct Throttled {
    inner: InMemoryObjectStore,
    throttled: AtomicUsize,
}

#[async_trait]
impl ObjectStore for Throttled {
    fn backend(&self) -> &'static str {
        "throttled"
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        if self
            .throttled
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::ObjectStore {
                backend: "throttled",
                message: "503 SlowDown".into(),
            });
        }
        self.inner.get(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<Option<u64>> {
        self.inner.head(key).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }
}

impl Sink {
    async fn start() -> Self {
        Self::start_with(ColdArchive::new(Arc::new(InMemoryObjectStore::new()), "e2e", 100)).await
    }

    async fn start_with(archive: ColdArchive) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let hot = HotStore::open(dir.path().join("hot")).unwrap();
        let registry = Arc::new(ChainRegistry::new());
        registry.register(CHAIN, "C-Chain", 0);

        let config = ServerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            tip_poll: Duration::from_millis(20),
            ..ServerConfig::default()
        };
        let server = StreamServer::new(
            config,
            Arc::clone(&registry),
            hot.clone(),
            archive.clone(),
            Metrics::shared(),
        );
        let addr = server.start().await.unwrap();
        Self {
            _dir: dir,
            hot,
            archive,
            registry,
            _server: server,
            addr,
        }
    }

    fn ingest(&self, blocks: impl IntoIterator<Item = u64>) {
        for n in blocks {
            self.hot.save_block(CHAIN, n, &record(n)).unwrap();
            self.registry.update_latest(CHAIN, n);
        }
    }

    async fn archive(&self, start: u64) {
        let batch = self.archive.batch_for(start);
        let records: Vec<Vec<u8>> = (batch.first_block()..=batch.end).map(record).collect();
        let data = compress_records(&records, ARCHIVE_LEVEL).unwrap();
        self.archive.upload(CHAIN, batch, Bytes::from(data)).await.unwrap();
        self.registry.update_latest(CHAIN, batch.end);
    }

    fn client(&self, cancel: &CancellationToken) -> SinkClient {
        SinkClient::new(self.addr.to_string())
            .with_reconnect_delay(Duration::from_millis(20))
            .with_cancel(cancel.clone())
    }
}

#[tokio::test]
async fn test_mid_batch_start_across_tiers() {
    let sink = Sink::start().await;
    sink.archive(0).await;
    sink.archive(100).await;
    sink.ingest(180..=250);

    let cancel = CancellationToken::new();
    let mut seen = Vec::new();
    sink.client(&cancel)
        .stream(CHAIN, 150, |block| {
            seen.push(block.number);
            if block.number == 250 {
                cancel.cancel();
            }
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(seen, (150..=250).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_throttled_archive_still_delivers_batch() {
    let store = Arc::new(Throttled {
        inner: InMemoryObjectStore::new(),
        throttled: AtomicUsize::new(3),
    });
    let retry = ArchiveRetry {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    };
    let sink = Sink::start_with(ColdArchive::new(store.clone(), "e2e", 100).with_retry(retry)).await;
    sink.archive(100).await;

    let cancel = CancellationToken::new();
    let mut seen = Vec::new();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        sink.client(&cancel).stream(CHAIN, 150, |block| {
            seen.push(block.number);
            if block.number == 199 {
                cancel.cancel();
            }
            Ok(())
        }),
    )
    .await
    .unwrap();

    result.unwrap();
    assert_eq!(seen, (150..=199).collect::<Vec<_>>());
    assert_eq!(store.throttled.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_from_zero_starts_at_one() {
    let sink = Sink::start().await;
    sink.ingest(1..=3);

    let cancel = CancellationToken::new();
    let mut seen = Vec::new();
    sink.client(&cancel)
        .stream(CHAIN, 0, |block| {
            seen.push(block.number);
            if block.number == 3 {
                cancel.cancel();
            }
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(seen, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_live_follow_over_channel() {
    let sink = Sink::start().await;
    sink.ingest(1..=10);

    let cancel = CancellationToken::new();
    let (mut rx, handle) = sink.client(&cancel).stream_blocks(CHAIN, 5, 16);

    let mut seen = Vec::new();
    while seen.len() < 6 {
        seen.push(rx.recv().await.unwrap().number);
    }
    assert_eq!(seen, (5..=10).collect::<Vec<_>>());

    // new blocks reach a session already waiting at the tip
    sink.ingest(11..=12);
    for expected in 11..=12 {
        let block = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(block.number, expected);
        assert_eq!(block.chain_id, CHAIN);
    }

    cancel.cancel();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_list_chains() {
    let sink = Sink::start().await;
    sink.registry.register(1, "Ethereum", 0);
    sink.ingest(1..=7);

    let chains = SinkClient::new(sink.addr.to_string()).list_chains().await.unwrap();
    assert_eq!(chains.len(), 2);
    assert_eq!(chains[0].name, "Ethereum");
    assert_eq!(chains[1].chain_id, CHAIN);
    assert_eq!(chains[1].latest_block, 7);
}

#[tokio::test]
async fn test_unknown_chain_fails_without_retry() {
    let sink = Sink::start().await;
    let cancel = CancellationToken::new();
    let err = sink
        .client(&cancel)
        .stream(777, 1, |_| Ok(()))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Server(ref msg) if msg.contains("777")));
}
