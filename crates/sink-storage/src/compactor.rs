//! Hot-to-cold migration.
//!
//! Each cycle walks the state machine
//! `Idle -> SelectBatch -> SerializeCompress -> Upload -> Verify -> DeleteHot -> Idle`.
//! Hot blocks are deleted only for batches whose archived copy was read
//! back and matched; any earlier failure leaves the batch in both tiers
//! for the next cycle.

use crate::archive::{ArchiveMeta, ColdArchive};
use crate::error::{StorageError, StorageResult};
use crate::hot::HotStore;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use sink_metrics::{labeled, Metrics};
use sink_types::codec::ARCHIVE_LEVEL;
use sink_types::{compress_records, record_block_number, Batch};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Compactor tuning
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Pause between cycles that found nothing to do
    pub interval: Duration,
    /// Blocks a batch end must trail the hot head by before it is archived
    pub margin_blocks: u64,
    /// Upper bound on batches archived per cycle
    pub max_batches_per_cycle: usize,
    /// Concurrent uploads within a cycle
    pub upload_concurrency: usize,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            margin_blocks: 1000,
            max_batches_per_cycle: 100,
            upload_concurrency: 50,
        }
    }
}

/// Where the compactor currently is within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionState {
    /// Waiting for the next cycle
    Idle,
    /// Choosing closeable batches
    SelectBatch,
    /// Encoding batches
    SerializeCompress,
    /// Writing batches to the archive
    Upload,
    /// Reading uploaded batches back
    Verify,
    /// Reclaiming hot-store space
    DeleteHot,
}

impl fmt::Display for CompactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::SelectBatch => "select_batch",
            Self::SerializeCompress => "serialize_compress",
            Self::Upload => "upload",
            Self::Verify => "verify",
            Self::DeleteHot => "delete_hot",
        };
        f.write_str(name)
    }
}

/// Outcome of one cycle that did some work
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Batches archived and removed from the hot store, ascending
    pub archived: Vec<Batch>,
    /// Leftover hot blocks dropped because their batch was already archived
    pub reclaimed_blocks: u64,
    /// Total compressed bytes uploaded
    pub compressed_bytes: usize,
}

struct Prepared {
    batch: Batch,
    data: Bytes,
}

/// Per-chain background migrator
pub struct Compactor {
    chain_id: u64,
    hot: HotStore,
    archive: ColdArchive,
    config: CompactorConfig,
    state: Arc<RwLock<CompactionState>>,
    metrics: Option<Arc<Metrics>>,
}

impl Compactor {
    /// Create a compactor for one chain
    pub fn new(chain_id: u64, hot: HotStore, archive: ColdArchive, config: CompactorConfig) -> Self {
        Self {
            chain_id,
            hot,
            archive,
            config,
            state: Arc::new(RwLock::new(CompactionState::Idle)),
            metrics: None,
        }
    }

    /// Record compaction counters into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Current state
    pub fn state(&self) -> CompactionState {
        *self.state.read()
    }

    fn set_state(&self, next: CompactionState) {
        let mut state = self.state.write();
        let prev = *state;
        if prev != next {
            debug!(chain_id = self.chain_id, from = %prev, to = %next, "Compactor state");
            *state = next;
        }
    }

    /// Run cycles until cancelled. A cycle that hit its batch limit is
    /// followed immediately by another.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            chain_id = self.chain_id,
            margin = self.config.margin_blocks,
            interval = ?self.config.interval,
            "Compactor started"
        );
        while !cancel.is_cancelled() {
            let more = match self.run_cycle().await {
                Ok(Some(report)) => {
                    report.reclaimed_blocks > 0
                        || report.archived.len() >= self.config.max_batches_per_cycle
                }
                Ok(None) => false,
                Err(e) => {
                    error!(chain_id = self.chain_id, error = %e, "Compaction cycle failed");
                    self.set_state(CompactionState::Idle);
                    false
                }
            };
            if more {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        info!(chain_id = self.chain_id, "Compactor stopped");
    }

    /// Run one cycle. Returns `None` when there was nothing to do.
    pub async fn run_cycle(&self) -> StorageResult<Option<CycleReport>> {
        let result = self.cycle().await;
        self.set_state(CompactionState::Idle);
        result
    }

    async fn cycle(&self) -> StorageResult<Option<CycleReport>> {
        let started = Instant::now();
        self.set_state(CompactionState::SelectBatch);

        let (first, latest) = match (
            self.hot.first_block(self.chain_id)?,
            self.hot.latest_block(self.chain_id)?,
        ) {
            (Some(first), Some(latest)) => (first, latest),
            _ => return Ok(None),
        };

        let candidates = self.closeable_batches(first, latest);
        let Some(head) = candidates.first().copied() else {
            return Ok(None);
        };

        // Blocks below `first` were deleted from the hot tier, so the head
        // batch can only be short if a previous cycle archived it and then
        // failed before DeleteHot finished.
        if first > head.first_block() {
            return self.reclaim_partial(head, first).await;
        }

        let last = candidates[candidates.len() - 1];
        let rows = self
            .hot
            .range_scan(self.chain_id, head.first_block(), last.end)?;
        let groups = self.group_complete(&candidates, rows)?;
        if groups.is_empty() {
            return Ok(None);
        }

        self.set_state(CompactionState::SerializeCompress);
        let prepared = self.compress(groups).await?;

        self.set_state(CompactionState::Upload);
        let uploaded = self.upload(&prepared).await;
        if uploaded < prepared.len() {
            warn!(
                chain_id = self.chain_id,
                failed = %prepared[uploaded].batch,
                "Upload failed, later batches retried next cycle"
            );
        }

        self.set_state(CompactionState::Verify);
        let verified = self.verify(&prepared[..uploaded]).await;
        let committed = &prepared[..verified];
        let Some(last_committed) = committed.last().map(|p| p.batch) else {
            return Ok(None);
        };

        let meta = ArchiveMeta {
            last_compacted_block: last_committed.end,
        };
        if let Err(e) = self.archive.put_meta(self.chain_id, &meta).await {
            warn!(chain_id = self.chain_id, error = %e, "Failed to write archive meta");
        }

        self.set_state(CompactionState::DeleteHot);
        let from = committed[0].batch.first_block();
        self.hot.delete_range(self.chain_id, from, last_committed.end)?;

        let report = CycleReport {
            archived: committed.iter().map(|p| p.batch).collect(),
            reclaimed_blocks: 0,
            compressed_bytes: committed.iter().map(|p| p.data.len()).sum(),
        };
        if let Some(metrics) = &self.metrics {
            metrics.counter(
                &labeled("compaction_batches", self.chain_id),
                report.archived.len() as u64,
            );
            metrics.counter(
                &labeled("compaction_bytes", self.chain_id),
                report.compressed_bytes as u64,
            );
        }

        info!(
            chain_id = self.chain_id,
            batches = report.archived.len(),
            from,
            to = last_committed.end,
            size = %format_size(report.compressed_bytes),
            elapsed = ?started.elapsed(),
            "Compacted"
        );
        Ok(Some(report))
    }

    /// Contiguous batches from the one holding `first` whose end trails
    /// `latest` by at least the margin
    fn closeable_batches(&self, first: u64, latest: u64) -> Vec<Batch> {
        let mut out = Vec::new();
        let mut batch = self.archive.batch_for(first);
        while out.len() < self.config.max_batches_per_cycle
            && batch
                .end
                .checked_add(self.config.margin_blocks)
                .is_some_and(|limit| latest >= limit)
        {
            out.push(batch);
            batch = batch.next();
        }
        out
    }

    async fn reclaim_partial(&self, batch: Batch, first: u64) -> StorageResult<Option<CycleReport>> {
        if !self.archive.contains(self.chain_id, batch).await? {
            warn!(
                chain_id = self.chain_id,
                %batch,
                first_hot = first,
                "Hot store starts mid-batch but batch is not archived, skipping"
            );
            return Ok(None);
        }

        self.set_state(CompactionState::DeleteHot);
        self.hot.delete_range(self.chain_id, first, batch.end)?;
        let reclaimed = batch.end - first + 1;
        info!(chain_id = self.chain_id, %batch, reclaimed, "Reclaimed already archived blocks");
        Ok(Some(CycleReport {
            reclaimed_blocks: reclaimed,
            ..CycleReport::default()
        }))
    }

    /// Split scanned rows into per-batch record lists, stopping at the
    /// first batch with a gap
    fn group_complete(
        &self,
        batches: &[Batch],
        rows: Vec<(u64, Bytes)>,
    ) -> StorageResult<Vec<(Batch, Vec<Bytes>)>> {
        let mut rows = rows.into_iter().peekable();
        let mut groups = Vec::with_capacity(batches.len());

        'batches: for batch in batches {
            let mut records = Vec::with_capacity(batch.block_count() as usize);
            for expected in batch.first_block()..=batch.end {
                match rows.peek() {
                    Some((number, _)) if *number == expected => {}
                    _ => {
                        debug!(chain_id = self.chain_id, %batch, missing = expected, "Batch incomplete");
                        break 'batches;
                    }
                }
                let Some((number, record)) = rows.next() else {
                    break 'batches;
                };
                let embedded = record_block_number(&record)?;
                if embedded != number {
                    return Err(StorageError::Corrupt(format!(
                        "chain {} key {} holds block {}",
                        self.chain_id, number, embedded
                    )));
                }
                records.push(record);
            }
            groups.push((*batch, records));
        }
        Ok(groups)
    }

    async fn compress(&self, groups: Vec<(Batch, Vec<Bytes>)>) -> StorageResult<Vec<Prepared>> {
        let tasks = groups.into_iter().map(|(batch, records)| {
            tokio::task::spawn_blocking(move || -> StorageResult<Prepared> {
                let data = compress_records(&records, ARCHIVE_LEVEL)?;
                Ok(Prepared {
                    batch,
                    data: Bytes::from(data),
                })
            })
        });
        futures::future::try_join_all(tasks)
            .await?
            .into_iter()
            .collect()
    }

    /// Upload concurrently; returns the length of the successful prefix
    async fn upload(&self, prepared: &[Prepared]) -> usize {
        let results: Vec<StorageResult<()>> = stream::iter(prepared)
            .map(|p| self.archive.upload(self.chain_id, p.batch, p.data.clone()))
            .buffered(self.config.upload_concurrency.max(1))
            .collect()
            .await;
        prefix_ok(self.chain_id, "upload", prepared, results)
    }

    /// Read back; returns the length of the verified prefix
    async fn verify(&self, uploaded: &[Prepared]) -> usize {
        let results: Vec<StorageResult<()>> = stream::iter(uploaded)
            .map(|p| self.archive.verify(self.chain_id, p.batch, p.data.len()))
            .buffered(self.config.upload_concurrency.max(1))
            .collect()
            .await;
        prefix_ok(self.chain_id, "verify", uploaded, results)
    }
}

fn prefix_ok(chain_id: u64, step: &str, prepared: &[Prepared], results: Vec<StorageResult<()>>) -> usize {
    for (i, result) in results.into_iter().enumerate() {
        if let Err(e) = result {
            warn!(chain_id, step, batch = %prepared[i].batch, error = %e, "Batch step failed");
            return i;
        }
    }
    prepared.len()
}

/// Human-readable byte count
pub fn format_size(bytes: usize) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CompactionState::SerializeCompress.to_string(), "serialize_compress");
        assert_eq!(CompactionState::Idle.to_string(), "idle");
    }

    #[test]
    fn test_default_config() {
        let config = CompactorConfig::default();
        assert_eq!(config.margin_blocks, 1000);
        assert_eq!(config.max_batches_per_cycle, 100);
        assert_eq!(config.upload_concurrency, 50);
        assert_eq!(config.interval, Duration::from_secs(3));
    }
}
