//! Type-level error definitions

use thiserror::Error;

/// Errors produced while parsing or encoding sink data
#[derive(Debug, Error)]
pub enum TypesError {
    /// Block number is missing or not a hex quantity
    #[error("invalid block number: {0}")]
    InvalidBlockNumber(String),

    /// Record could not be (de)serialized
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// zstd failure
    #[error("compression error: {0}")]
    Compression(String),

    /// Frame violates the wire format
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame length prefix exceeds the limit
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for type-level operations
pub type TypesResult<T> = Result<T, TypesError>;
