//! # sink-server
//!
//! Serves block streams to consumers over TCP.
//!
//! Each session names a chain and a start block. Blocks still in the hot
//! store are sent from there; older ones come out of the archive as whole
//! compressed batches, read a few batches ahead. At the tip the session
//! announces `live` and waits for the ingestion head to move.
//!
//! A small HTTP API reports registered chains, metrics, and health.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod http;
mod prefetch;
mod registry;
mod service;
mod session;

pub use error::{ServerError, ServerResult};
pub use http::{ApiState, HealthResponse, StatusApi};
pub use prefetch::PrefetchCache;
pub use registry::{ChainRegistry, ChainState};
pub use service::{ServerConfig, StreamServer};
