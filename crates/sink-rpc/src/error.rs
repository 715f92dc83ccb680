//! RPC error types

use sink_types::TypesError;
use thiserror::Error;

/// Errors talking to a chain node
#[derive(Debug, Error)]
pub enum RpcError {
    /// Connection or protocol failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// JSON-RPC error object from the node
    #[error("RPC error: {code} - {message}")]
    Rpc {
        /// Error code
        code: i64,
        /// Error message
        message: String,
    },

    /// The node does not have the block yet
    #[error("Block {0} not found")]
    BlockNotFound(u64),

    /// A receipt came back null
    #[error("Receipt missing for tx {0}")]
    ReceiptMissing(String),

    /// Response that cannot be interpreted
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Block number or record that fails to decode
    #[error("Invalid block: {0}")]
    InvalidBlock(#[from] TypesError),

    /// Caller cancelled the operation
    #[error("Cancelled")]
    Cancelled,
}

impl RpcError {
    /// Whether retrying the same request can succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_)
            | Self::Timeout(_)
            | Self::BlockNotFound(_)
            | Self::ReceiptMissing(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            // -32005 limit exceeded, -32603 internal error
            Self::Rpc { code, .. } => matches!(*code, -32005 | -32603),
            Self::InvalidResponse(_) | Self::InvalidBlock(_) | Self::Cancelled => false,
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::InvalidResponse(e.to_string())
    }
}

/// Result type for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RpcError::Transport("reset".into()).is_transient());
        assert!(RpcError::Timeout("30s".into()).is_transient());
        assert!(RpcError::BlockNotFound(9).is_transient());
        assert!(RpcError::Http { status: 503, message: String::new() }.is_transient());
        assert!(RpcError::Http { status: 429, message: String::new() }.is_transient());
        assert!(!RpcError::Http { status: 400, message: String::new() }.is_transient());
        assert!(!RpcError::Rpc { code: -32601, message: "no method".into() }.is_transient());
        assert!(!RpcError::InvalidBlock(TypesError::InvalidBlockNumber("0xzz".into())).is_transient());
        assert!(!RpcError::Cancelled.is_transient());
    }
}
