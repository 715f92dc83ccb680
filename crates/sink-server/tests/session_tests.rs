//! Streaming sessions over a real socket

use bytes::Bytes;
use serde_json::json;
use sink_metrics::Metrics;
use sink_server::{ChainRegistry, ServerConfig, StreamServer};
use async_trait::async_trait;
use sink_storage::{
    ArchiveRetry, ColdArchive, HotStore, InMemoryObjectStore, ObjectStore, StorageError,
    StorageResult,
};
use sink_types::codec::ARCHIVE_LEVEL;
use sink_types::{
    compress_records, decompress_records, read_frame, record_block_number, write_frame,
    ChainInfo, ErrorMessage, Frame, FrameType, Hello, NormalizedBlock, StatusMessage,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

const CHAIN: u64 = 43114;

fn record(n: u64) -> Vec<u8> {
    NormalizedBlock::new(json!({ "number": format!("{:#x}", n) }))
        .to_record()
        .unwrap()
}

struct Harness {
    _dir: tempfile::TempDir,
    hot: HotStore,
    archive: ColdArchive,
    registry: Arc<ChainRegistry>,
    server: StreamServer,
    addr: SocketAddr,
}

/// Memory store whose first `failures` reads fail
struct FlakyReads {
    inner: InMemoryObjectStore,
    failures: AtomicUsize,
}

impl FlakyReads {
    fn new(failures: usize) -> Self {
        Self {
            inner: InMemoryObjectStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl ObjectStore for FlakyReads {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::ObjectStore {
                backend: "flaky",
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

async fn harness(handshake_timeout: Duration) -> Harness {
    let archive = ColdArchive::new(Arc::new(InMemoryObjectStore::new()), "test", 100);
    harness_with(handshake_timeout, archive).await
}

async fn harness_with(handshake_timeout: Duration, archive: ColdArchive) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let hot = HotStore::open(dir.path().join("hot")).unwrap();
    let registry = Arc::new(ChainRegistry::new());
    registry.register(CHAIN, "C-Chain", 0);

    let config = ServerConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        tip_poll: Duration::from_millis(20),
        handshake_timeout,
        cold_lookahead: 3,
    };
    let server = StreamServer::new(
        config,
        Arc::clone(&registry),
        hot.clone(),
        archive.clone(),
        Metrics::shared(),
    );
    let addr = server.start().await.unwrap();
    Harness {
        _dir: dir,
        hot,
        archive,
        registry,
        server,
        addr,
    }
}

impl Harness {
    fn ingest(&self, blocks: impl IntoIterator<Item = u64>) {
        for n in blocks {
            self.hot.save_block(CHAIN, n, &record(n)).unwrap();
            self.registry.update_latest(CHAIN, n);
        }
    }

    async fn archive_batch(&self, start: u64) {
        let batch = self.archive.batch_for(start);
        let records: Vec<Vec<u8>> = (batch.first_block()..=batch.end).map(record).collect();
        let data = compress_records(&records, ARCHIVE_LEVEL).unwrap();
        self.archive.upload(CHAIN, batch, Bytes::from(data)).await.unwrap();
        self.registry.update_latest(CHAIN, batch.end);
    }

    async fn connect(&self, chain_id: u64, from_block: u64) -> TcpStream {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let hello = Hello { chain_id, from_block };
        write_frame(&mut stream, &Frame::json(FrameType::Hello, &hello).unwrap())
            .await
            .unwrap();
        stream
    }
}

async fn next_frame(stream: &mut TcpStream) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), read_frame(stream))
        .await
        .expect("frame in time")
        .unwrap()
}

fn numbers(frame: &Frame) -> Vec<u64> {
    assert_eq!(frame.frame_type, FrameType::Blocks);
    decompress_records(&frame.payload)
        .unwrap()
        .iter()
        .map(|r| record_block_number(r).unwrap())
        .collect()
}

/// Read block frames until a live status arrives
async fn collect_until_live(stream: &mut TcpStream) -> (Vec<u64>, StatusMessage) {
    let mut seen = Vec::new();
    loop {
        let frame = next_frame(stream).await;
        match frame.frame_type {
            FrameType::Blocks => seen.extend(numbers(&frame)),
            FrameType::Status => return (seen, frame.parse_json().unwrap()),
            other => panic!("unexpected frame {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_hot_stream_then_live_then_follows_head() {
    let h = harness(Duration::from_secs(5)).await;
    h.ingest(1..=5);

    let mut stream = h.connect(CHAIN, 0).await;
    let (seen, status) = collect_until_live(&mut stream).await;
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    assert_eq!(status.status, "live");
    assert_eq!(status.head_block, 5);

    h.ingest(6..=7);
    let mut more = Vec::new();
    while more.len() < 2 {
        more.extend(numbers(&next_frame(&mut stream).await));
    }
    assert_eq!(more, vec![6, 7]);

    // one live notice per arrival at the tip
    let status: StatusMessage = next_frame(&mut stream).await.parse_json().unwrap();
    assert_eq!(status.head_block, 7);
}

#[tokio::test]
async fn test_cold_batch_then_hot_tail() {
    let h = harness(Duration::from_secs(5)).await;
    h.archive_batch(0).await;
    h.archive_batch(100).await;
    h.ingest(200..=230);

    let mut stream = h.connect(CHAIN, 150).await;

    // whole archive batch goes out as stored; the client trims below 150
    let first = numbers(&next_frame(&mut stream).await);
    assert_eq!(first.first(), Some(&100));
    assert_eq!(first.last(), Some(&199));

    let (rest, status) = collect_until_live(&mut stream).await;
    assert_eq!(rest, (200..=230).collect::<Vec<_>>());
    assert_eq!(status.head_block, 230);
}

#[tokio::test]
async fn test_hot_preferred_over_archive() {
    let h = harness(Duration::from_secs(5)).await;
    h.archive_batch(0).await;
    h.ingest(1..=99);
    h.ingest(100..=110);

    let mut stream = h.connect(CHAIN, 95).await;
    let (seen, _) = collect_until_live(&mut stream).await;
    assert_eq!(seen, (95..=110).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_unknown_chain_gets_error_frame() {
    let h = harness(Duration::from_secs(5)).await;
    let mut stream = h.connect(999, 1).await;

    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.frame_type, FrameType::ServerError);
    let msg: ErrorMessage = frame.parse_json().unwrap();
    assert!(msg.message.contains("999"));
    assert!(read_frame(&mut stream).await.is_err());
}

#[tokio::test]
async fn test_list_chains_before_hello() {
    let h = harness(Duration::from_secs(5)).await;
    h.registry.register(1, "Ethereum", 0);
    h.ingest(1..=3);

    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    write_frame(&mut stream, &Frame::new(FrameType::ListChains, Bytes::new()))
        .await
        .unwrap();
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.frame_type, FrameType::Chains);
    let chains: Vec<ChainInfo> = frame.parse_json().unwrap();
    assert_eq!(chains.len(), 2);
    assert_eq!(chains[1].chain_id, CHAIN);
    assert_eq!(chains[1].latest_block, 3);

    // the same connection can still start a stream
    let hello = Hello { chain_id: CHAIN, from_block: 2 };
    write_frame(&mut stream, &Frame::json(FrameType::Hello, &hello).unwrap())
        .await
        .unwrap();
    let (seen, _) = collect_until_live(&mut stream).await;
    assert_eq!(seen, vec![2, 3]);
}

#[tokio::test]
async fn test_handshake_timeout() {
    let h = harness(Duration::from_millis(100)).await;
    let mut stream = TcpStream::connect(h.addr).await.unwrap();

    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.frame_type, FrameType::ServerError);
    let msg: ErrorMessage = frame.parse_json().unwrap();
    assert!(msg.message.contains("timed out"));
}

#[tokio::test]
async fn test_unexpected_first_frame_rejected() {
    let h = harness(Duration::from_secs(5)).await;
    let mut stream = TcpStream::connect(h.addr).await.unwrap();
    write_frame(&mut stream, &Frame::blocks(vec![1u8, 2, 3]))
        .await
        .unwrap();
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.frame_type, FrameType::ServerError);
}

#[tokio::test]
async fn test_empty_archive_object_is_an_error() {
    let h = harness(Duration::from_secs(5)).await;
    let batch = h.archive.batch_for(1);
    h.archive.upload(CHAIN, batch, Bytes::new()).await.unwrap();
    h.registry.update_latest(CHAIN, batch.end);

    let mut stream = h.connect(CHAIN, 1).await;
    let frame = next_frame(&mut stream).await;
    assert_eq!(frame.frame_type, FrameType::ServerError);
    let msg: ErrorMessage = frame.parse_json().unwrap();
    assert!(msg.message.contains("corrupt"));
}

#[tokio::test]
async fn test_archive_read_failures_delay_but_keep_session() {
    let store = Arc::new(FlakyReads::new(5));
    let retry = ArchiveRetry {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    };
    let archive = ColdArchive::new(store.clone(), "test", 100).with_retry(retry);
    let h = harness_with(Duration::from_secs(5), archive).await;
    h.archive_batch(100).await;

    // five failed reads outlast two retry rounds; the third round succeeds
    let mut stream = h.connect(CHAIN, 150).await;
    let (seen, status) = collect_until_live(&mut stream).await;
    assert_eq!(seen, (100..=199).collect::<Vec<_>>());
    assert_eq!(status.head_block, 199);
    assert_eq!(store.failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stop_closes_sessions() {
    let h = harness(Duration::from_secs(5)).await;
    h.ingest(1..=2);
    let mut stream = h.connect(CHAIN, 1).await;
    let _ = collect_until_live(&mut stream).await;

    h.server.stop();
    let closed = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut stream)).await;
    assert!(closed.unwrap().is_err());
}
