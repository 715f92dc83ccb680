//! Record codec: newline-delimited JSON records compressed with zstd.
//!
//! The same encoding is used for archive objects and for streamed frames, so
//! an archived batch can be forwarded to consumers without re-encoding.

use crate::error::{TypesError, TypesResult};
use bytes::Bytes;
use std::io::{Read, Write};

/// Compression level used for archive batches
pub const ARCHIVE_LEVEL: i32 = 3;

/// Compression level used for single-block frames
pub const FRAME_LEVEL: i32 = 1;

/// Largest payload a single blob may expand to
pub const MAX_DECOMPRESSED_LEN: usize = 1 << 30;

/// Compress records as `record\n record\n ...`
pub fn compress_records<R: AsRef<[u8]>>(records: &[R], level: i32) -> TypesResult<Vec<u8>> {
    let capacity = records.iter().map(|r| r.as_ref().len() + 1).sum::<usize>() / 4;
    let mut encoder = zstd::stream::Encoder::new(Vec::with_capacity(capacity), level)
        .map_err(|e| TypesError::Compression(e.to_string()))?;
    for record in records {
        let record = record.as_ref();
        if record.contains(&b'\n') {
            return Err(TypesError::Compression("record contains a newline".into()));
        }
        encoder.write_all(record)?;
        encoder.write_all(b"\n")?;
    }
    encoder
        .finish()
        .map_err(|e| TypesError::Compression(e.to_string()))
}

/// Decompress a blob into its newline-delimited payload
pub fn decompress(data: &[u8]) -> TypesResult<Vec<u8>> {
    decompress_bounded(data, MAX_DECOMPRESSED_LEN)
}

/// Decompress, failing once the output would exceed `limit` bytes
pub fn decompress_bounded(data: &[u8], limit: usize) -> TypesResult<Vec<u8>> {
    let decoder =
        zstd::stream::Decoder::new(data).map_err(|e| TypesError::Compression(e.to_string()))?;
    let mut payload = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut payload)
        .map_err(|e| TypesError::Compression(e.to_string()))?;
    if payload.len() > limit {
        return Err(TypesError::Compression(format!(
            "payload exceeds {limit} bytes"
        )));
    }
    Ok(payload)
}

/// Decompress a blob and split it into records. Empty lines are skipped.
pub fn decompress_records(data: &[u8]) -> TypesResult<Vec<Bytes>> {
    let payload = Bytes::from(decompress(data)?);
    let mut records = Vec::new();
    let mut start = 0;
    for (i, byte) in payload.iter().enumerate() {
        if *byte == b'\n' {
            if i > start {
                records.push(payload.slice(start..i));
            }
            start = i + 1;
        }
    }
    if start < payload.len() {
        records.push(payload.slice(start..));
    }
    Ok(records)
}
