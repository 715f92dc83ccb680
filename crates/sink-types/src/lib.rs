//! # sink-types
//!
//! Core types shared by every part of the EVM sink.
//!
//! This crate provides:
//! - [`NormalizedBlock`](block::NormalizedBlock) - a block with its receipts and traces
//! - [`BlockKey`](key::BlockKey) - fixed-width hot-store keys
//! - [`Batch`](key::Batch) - aligned archive windows and their object keys
//! - Record codec (zstd compressed, newline-delimited JSON)
//! - Wire frames for the streaming protocol

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod codec;
mod error;
pub mod key;
pub mod wire;

pub use block::{parse_block_number, record_block_number, NormalizedBlock, TraceResult};
pub use codec::{compress_records, decompress_records};
pub use error::{TypesError, TypesResult};
pub use key::{
    archive_key, chain_archive_prefix, meta_key, parse_archive_file, Batch, BlockKey,
    DEFAULT_BATCH_SIZE, FIRST_BLOCK,
};
pub use wire::{
    read_frame, write_frame, ChainInfo, ErrorMessage, Frame, FrameType, Hello, StatusMessage,
    MAX_FRAME_LEN,
};
