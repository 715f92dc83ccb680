//! # sink-storage
//!
//! Two-tier block storage for the EVM sink.
//!
//! This crate provides:
//! - [`HotStore`]: RocksDB store for the most recent blocks of each chain
//! - [`ObjectStore`] with in-memory, local filesystem and (feature `s3`) S3 backends
//! - [`ColdArchive`]: fixed-size compressed batches addressed by chain and range
//! - [`Compactor`]: background migration from the hot tier to the archive

#![warn(missing_docs)]
#![warn(clippy::all)]

mod archive;
mod compactor;
pub mod db;
mod error;
mod hot;
pub mod object_store;

pub use archive::{ArchiveMeta, ArchiveRetry, ColdArchive};
pub use compactor::{format_size, CompactionState, Compactor, CompactorConfig, CycleReport};
pub use db::DbConfig;
pub use error::{StorageError, StorageResult};
pub use hot::HotStore;
pub use object_store::{InMemoryObjectStore, LocalFsObjectStore, ObjectStore};
#[cfg(feature = "s3")]
pub use object_store::{S3Config, S3ObjectStore};
