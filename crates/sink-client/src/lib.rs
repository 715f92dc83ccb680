//! # sink-client
//!
//! Client for the sink's block stream.
//!
//! - [`SinkClient::stream`] calls a handler for every block, in order
//! - [`SinkClient::stream_blocks`] feeds a bounded channel instead
//! - [`SinkClient::list_chains`] asks which chains are served
//!
//! Frames may overlap blocks the consumer already has (archive batches are
//! sent whole); those are skipped. A block ahead of the cursor drops the
//! connection and, with reconnects on, the stream resumes right after the
//! last delivered block.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod block;
mod client;
mod error;

pub use block::StreamedBlock;
pub use client::{ClientConfig, SinkClient};
pub use error::{ClientError, ClientResult};
