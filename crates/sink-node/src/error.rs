//! Node and ingestion errors

use sink_rpc::RpcError;
use sink_server::ServerError;
use sink_storage::StorageError;
use sink_types::TypesError;
use thiserror::Error;

/// Node error types
#[derive(Debug, Error)]
pub enum NodeError {
    /// Invalid configuration
    #[error("config error: {0}")]
    Config(String),
    /// Config file is not valid TOML for this schema
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// Chain node client error
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    /// Streaming server error
    #[error("server error: {0}")]
    Server(#[from] ServerError),
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;

/// Reasons an ingestion run stops. Every one of them restarts the run.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Fetched block is not the next one expected
    #[error("block number mismatch: expected {expected}, got {got}")]
    OutOfOrder {
        /// Next block number the loop expected
        expected: u64,
        /// Number found in the fetched block
        got: u64,
    },
    /// Block could not be parsed or serialized
    #[error("corrupt block: {0}")]
    Corrupt(#[from] TypesError),
    /// Hot store or archive failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// Fetch failed after retries
    #[error("fetch error: {0}")]
    Fetch(#[from] RpcError),
    /// Block stream ended without an error
    #[error("block stream closed")]
    StreamClosed,
}
