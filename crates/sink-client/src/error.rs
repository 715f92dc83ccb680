//! Client error types

use sink_types::TypesError;
use thiserror::Error;

/// Streaming client errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection or socket error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect or reply did not arrive in time
    #[error("timed out: {0}")]
    Timeout(String),

    /// Frame or record could not be decoded
    #[error("codec error: {0}")]
    Codec(#[from] TypesError),

    /// Server sent an error frame
    #[error("server error: {0}")]
    Server(String),

    /// Server sent a frame the client did not expect
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A block arrived ahead of the cursor
    #[error("out of order block: expected {expected}, got {got}")]
    OutOfOrder {
        /// Next block the client expected
        expected: u64,
        /// Block received
        got: u64,
    },

    /// Block handler rejected a block
    #[error("handler error: {0}")]
    Handler(String),

    /// Receiving side of a block channel went away
    #[error("block channel closed")]
    ChannelClosed,
}

impl ClientError {
    /// Whether a fresh connection can recover from this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Timeout(_) | Self::Codec(_) | Self::Protocol(_) | Self::OutOfOrder { .. }
        )
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let io = ClientError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert!(io.is_retryable());
        assert!(ClientError::OutOfOrder { expected: 5, got: 7 }.is_retryable());
        assert!(!ClientError::Server("unknown chain 9".into()).is_retryable());
        assert!(!ClientError::Handler("stop".into()).is_retryable());
        assert!(!ClientError::ChannelClosed.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ClientError::OutOfOrder { expected: 5, got: 7 };
        assert_eq!(err.to_string(), "out of order block: expected 5, got 7");
    }
}
