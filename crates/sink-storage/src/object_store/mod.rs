//! Object store abstraction behind the cold archive

mod local;
mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use local::LocalFsObjectStore;
pub use memory::InMemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::{S3Config, S3ObjectStore};

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Flat key/value blob storage with `/`-separated keys
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Backend name for logs and errors
    fn backend(&self) -> &'static str;

    /// Write `data` under `key`, replacing any previous object
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Read the object under `key`
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>>;

    /// Size in bytes of the object under `key`
    async fn head(&self, key: &str) -> StorageResult<Option<u64>>;

    /// Every key starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
}
