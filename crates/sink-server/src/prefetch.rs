//! Per-session read-ahead of archive batches

use bytes::Bytes;
use sink_storage::{ColdArchive, StorageResult};
use sink_types::Batch;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::trace;

type Fetch = JoinHandle<StorageResult<Option<Bytes>>>;

/// In-flight archive downloads keyed by batch start.
///
/// A batch is requested at most once while pending; consuming it removes
/// the entry. Outstanding downloads are aborted when the cache is dropped.
pub struct PrefetchCache {
    chain_id: u64,
    archive: ColdArchive,
    lookahead: usize,
    entries: HashMap<u64, Fetch>,
}

impl PrefetchCache {
    /// Cache for one chain, reading up to `lookahead` batches ahead
    pub fn new(chain_id: u64, archive: ColdArchive, lookahead: usize) -> Self {
        Self {
            chain_id,
            archive,
            lookahead: lookahead.max(1),
            entries: HashMap::new(),
        }
    }

    /// Start downloads for `from` and the batches after it, skipping any
    /// already pending and any starting past `head`
    pub fn prefetch(&mut self, from: Batch, head: u64) {
        let mut batch = from;
        for _ in 0..self.lookahead {
            if batch.start > head {
                break;
            }
            if !self.entries.contains_key(&batch.start) {
                trace!(chain_id = self.chain_id, %batch, "Prefetching batch");
                let archive = self.archive.clone();
                let chain_id = self.chain_id;
                let target = batch;
                let handle = tokio::spawn(async move { archive.get_raw(chain_id, target).await });
                self.entries.insert(batch.start, handle);
            }
            batch = batch.next();
        }
    }

    /// The raw batch object, from a pending download if there is one.
    /// Entries for earlier batches are discarded.
    pub async fn take(&mut self, batch: Batch) -> StorageResult<Option<Bytes>> {
        self.entries.retain(|start, handle| {
            let keep = *start >= batch.start;
            if !keep {
                handle.abort();
            }
            keep
        });

        match self.entries.remove(&batch.start) {
            Some(handle) => handle.await?,
            None => self.archive.get_raw(self.chain_id, batch).await,
        }
    }

    /// Number of pending downloads
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for PrefetchCache {
    fn drop(&mut self) {
        for (_, handle) in self.entries.drain() {
            handle.abort();
        }
    }
}
