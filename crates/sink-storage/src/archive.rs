//! Cold tier: immutable compressed batches in an object store

use crate::error::{StorageError, StorageResult};
use crate::object_store::ObjectStore;
use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sink_types::{
    archive_key, chain_archive_prefix, decompress_records, meta_key, parse_archive_file, Batch,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-chain compaction metadata stored next to the batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveMeta {
    /// End of the last batch committed by the compactor
    pub last_compacted_block: u64,
}

/// Backoff applied to every object store request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRetry {
    /// Attempts including the first
    pub max_attempts: usize,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
}

impl Default for ArchiveRetry {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ArchiveRetry {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }
}

/// Batch-addressed view over an [`ObjectStore`].
///
/// Backend failures are retried with exponential backoff; only the last
/// error of an exhausted schedule reaches the caller.
#[derive(Clone)]
pub struct ColdArchive {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    batch_size: u64,
    retry: ArchiveRetry,
}

impl ColdArchive {
    /// Wrap `store`, placing objects under `prefix`
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, batch_size: u64) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            batch_size: batch_size.max(1),
            retry: ArchiveRetry::default(),
        }
    }

    /// Replace the request retry schedule
    pub fn with_retry(mut self, retry: ArchiveRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Blocks per batch
    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// The batch window holding `number`
    pub fn batch_for(&self, number: u64) -> Batch {
        Batch::containing(number, self.batch_size)
    }

    /// Object key of a batch
    pub fn key(&self, chain_id: u64, batch: Batch) -> String {
        archive_key(&self.prefix, chain_id, batch)
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    async fn retrying<T, F, Fut>(&self, op: &'static str, key: &str, request: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        request
            .retry(self.retry.backoff())
            .when(StorageError::is_transient)
            .notify(|err: &StorageError, delay: Duration| {
                warn!(backend = self.store.backend(), op, key, error = %err, ?delay, "Object store request failed, retrying");
            })
            .await
    }

    async fn get_object(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let store = &self.store;
        self.retrying("get", key, move || store.get(key)).await
    }

    async fn put_object(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let store = &self.store;
        self.retrying("put", key, move || store.put(key, data.clone())).await
    }

    /// Upload a compressed batch. Re-uploading identical bytes is harmless.
    pub async fn upload(&self, chain_id: u64, batch: Batch, data: Bytes) -> StorageResult<()> {
        let key = self.key(chain_id, batch);
        debug!(chain_id, %batch, bytes = data.len(), key = %key, "Uploading batch");
        self.put_object(&key, data).await
    }

    /// The compressed batch object exactly as stored
    pub async fn get_raw(&self, chain_id: u64, batch: Batch) -> StorageResult<Option<Bytes>> {
        self.get_object(&self.key(chain_id, batch)).await
    }

    /// The batch split back into individual block records
    pub async fn get_batch(&self, chain_id: u64, batch: Batch) -> StorageResult<Option<Vec<Bytes>>> {
        match self.get_raw(chain_id, batch).await? {
            Some(raw) => Ok(Some(decompress_records(&raw)?)),
            None => Ok(None),
        }
    }

    /// Whether the batch object exists
    pub async fn contains(&self, chain_id: u64, batch: Batch) -> StorageResult<bool> {
        let key = self.key(chain_id, batch);
        let store = &self.store;
        let key = key.as_str();
        Ok(self.retrying("head", key, move || store.head(key)).await?.is_some())
    }

    /// Read the batch back and confirm it is non-empty and `expected_len` long
    pub async fn verify(&self, chain_id: u64, batch: Batch, expected_len: usize) -> StorageResult<()> {
        let key = self.key(chain_id, batch);
        let reason = match self.get_object(&key).await? {
            None => "object missing".to_string(),
            Some(data) if data.is_empty() => "object empty".to_string(),
            Some(data) if data.len() != expected_len => {
                format!("expected {expected_len} bytes, found {}", data.len())
            }
            Some(_) => return Ok(()),
        };
        Err(StorageError::Verification { key, reason })
    }

    /// Every archived batch for the chain, ascending
    pub async fn list_batches(&self, chain_id: u64) -> StorageResult<Vec<Batch>> {
        let prefix = chain_archive_prefix(&self.prefix, chain_id);
        let store = &self.store;
        let listing = prefix.as_str();
        let mut batches: Vec<Batch> = self
            .retrying("list", listing, move || store.list(listing))
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(parse_archive_file)
            .collect();
        batches.sort();
        Ok(batches)
    }

    /// Highest block number covered by an archived batch
    pub async fn latest_batch_end(&self, chain_id: u64) -> StorageResult<Option<u64>> {
        Ok(self.list_batches(chain_id).await?.last().map(|b| b.end))
    }

    /// Compaction metadata, if written
    pub async fn meta(&self, chain_id: u64) -> StorageResult<Option<ArchiveMeta>> {
        match self.get_object(&meta_key(&self.prefix, chain_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Overwrite the compaction metadata
    pub async fn put_meta(&self, chain_id: u64, meta: &ArchiveMeta) -> StorageResult<()> {
        let body = serde_json::to_vec(meta)?;
        self.put_object(&meta_key(&self.prefix, chain_id), Bytes::from(body))
            .await
    }
}
