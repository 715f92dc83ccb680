//! # sink-rpc
//!
//! Chain node access for the EVM sink.
//!
//! - [`Transport`]: JSON-RPC over HTTP, or a scripted mock for tests
//! - [`BlockSource`]: assembles a [`sink_types::NormalizedBlock`] from
//!   block, receipt and trace calls
//! - [`AdaptiveLimiter`]: latency-driven admission control
//! - [`FetchController`]: ordered range fetches and head-following streams

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod controller;
mod error;
mod fetcher;
pub mod source;
pub mod transport;

pub use controller::{adjust, AdaptiveLimiter, ControllerPolicy, LimiterPermit};
pub use error::{RpcError, RpcResult};
pub use fetcher::{FetchController, RetryPolicy};
pub use source::{BlockSource, RpcBlockSource};
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{MockTransport, RpcCall, Transport};
