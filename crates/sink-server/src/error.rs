//! Server error types

use sink_storage::StorageError;
use sink_types::TypesError;
use thiserror::Error;

/// Streaming server errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame or record codec error
    #[error("codec error: {0}")]
    Codec(#[from] TypesError),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Client broke the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No Hello within the handshake timeout
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Chain not registered
    #[error("unknown chain: {0}")]
    UnknownChain(u64),

    /// Archive object unusable
    #[error("corrupt archive batch for chain {chain_id}: {reason}")]
    Corrupt {
        /// Chain ID
        chain_id: u64,
        /// What was wrong
        reason: String,
    },

    /// Already running
    #[error("server already running")]
    AlreadyRunning,
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert!(ServerError::UnknownChain(7).to_string().contains("unknown chain: 7"));
        assert!(ServerError::HandshakeTimeout.to_string().contains("timed out"));
        let corrupt = ServerError::Corrupt {
            chain_id: 1,
            reason: "empty object".into(),
        };
        assert!(corrupt.to_string().contains("chain 1"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: ServerError = io_err.into();
        assert!(err.to_string().contains("IO error"));
    }
}
