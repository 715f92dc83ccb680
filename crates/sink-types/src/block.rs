//! Normalized block records.
//!
//! A [`NormalizedBlock`] is the unit the sink stores and streams: the raw
//! `eth_getBlockByNumber` object together with the receipts and call traces of
//! every transaction it contains. The block carries its own number as a hex
//! quantity, and that number is the only one the sink trusts.

use crate::error::{TypesError, TypesResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

/// Call trace for a single transaction.
///
/// `result` is `None` when the node cannot trace the transaction (for
/// instance direct precompile calls).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceResult {
    /// Transaction hash
    #[serde(rename = "txHash", default)]
    pub tx_hash: String,
    /// callTracer output
    #[serde(default)]
    pub result: Option<Value>,
}

impl TraceResult {
    /// Trace entry without a result
    pub fn empty(tx_hash: impl Into<String>) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            result: None,
        }
    }
}

/// A chain block with its receipts and traces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBlock {
    /// Block object as returned by the node (full transactions)
    pub block: Value,
    /// One receipt per transaction, in transaction order
    #[serde(default)]
    pub receipts: Vec<Value>,
    /// One trace per transaction, in transaction order
    #[serde(default)]
    pub traces: Vec<TraceResult>,
}

impl NormalizedBlock {
    /// Create a block with no receipts or traces attached yet
    pub fn new(block: Value) -> Self {
        Self {
            block,
            receipts: Vec::new(),
            traces: Vec::new(),
        }
    }

    /// Block number parsed from the block's own `number` field
    pub fn number(&self) -> TypesResult<u64> {
        let raw = self
            .block
            .get("number")
            .and_then(Value::as_str)
            .ok_or_else(|| TypesError::InvalidBlockNumber("missing number field".into()))?;
        parse_block_number(raw)
    }

    /// Hashes of the block's transactions, in order
    pub fn transaction_hashes(&self) -> Vec<String> {
        self.block
            .get("transactions")
            .and_then(Value::as_array)
            .map(|txs| {
                txs.iter()
                    .filter_map(|tx| match tx {
                        Value::String(hash) => Some(hash.clone()),
                        other => other.get("hash").and_then(Value::as_str).map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Serialize to a single-line JSON record
    pub fn to_record(&self) -> TypesResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from a JSON record
    pub fn from_record(record: &[u8]) -> TypesResult<Self> {
        Ok(serde_json::from_slice(record)?)
    }
}

/// Parse a hex quantity such as `0x1b4`. The `0x` prefix is optional.
pub fn parse_block_number(raw: &str) -> TypesResult<u64> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    if digits.is_empty() {
        return Err(TypesError::InvalidBlockNumber(raw.to_string()));
    }
    u64::from_str_radix(digits, 16).map_err(|_| TypesError::InvalidBlockNumber(raw.to_string()))
}

#[derive(Deserialize)]
struct RecordProbe<'a> {
    #[serde(borrow)]
    block: BlockProbe<'a>,
}

#[derive(Deserialize)]
struct BlockProbe<'a> {
    #[serde(borrow)]
    number: Cow<'a, str>,
}

/// Recover the block number from a serialized record without building the
/// full [`NormalizedBlock`].
pub fn record_block_number(record: &[u8]) -> TypesResult<u64> {
    let probe: RecordProbe<'_> = serde_json::from_slice(record)?;
    parse_block_number(&probe.block.number)
}
