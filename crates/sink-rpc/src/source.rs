//! Block assembly from a chain node.
//!
//! A [`NormalizedBlock`] needs three kinds of calls: the block with full
//! transactions, one receipt per transaction, and callTracer traces. Traces
//! are requested for the whole block first and fall back to one request
//! per transaction when the node rejects the block-level call.

use crate::transport::{RpcCall, Transport};
use crate::{RpcError, RpcResult};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use sink_types::{parse_block_number, NormalizedBlock, TraceResult};
use tracing::debug;

/// Receipts requested per JSON-RPC batch
pub const RECEIPT_BATCH_SIZE: usize = 100;

/// Concurrent per-transaction trace requests in the fallback path
const TRACE_FALLBACK_CONCURRENCY: usize = 8;

/// geth refuses to trace a transaction that calls a precompile directly
const PRECOMPILE_TRACE_ERROR: &str = "incorrect number of top-level calls";

/// Anything that can produce normalized blocks by number
#[async_trait]
pub trait BlockSource: Send + Sync + 'static {
    /// Fetch block `number` with receipts and traces
    async fn fetch_block(&self, number: u64) -> RpcResult<NormalizedBlock>;

    /// Current head of the node
    async fn latest_block_number(&self) -> RpcResult<u64>;
}

/// [`BlockSource`] over a JSON-RPC [`Transport`]
pub struct RpcBlockSource<T> {
    transport: T,
    traces: bool,
}

impl<T: Transport> RpcBlockSource<T> {
    /// Create a source that also collects traces
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            traces: true,
        }
    }

    /// Enable or disable trace collection
    pub fn with_traces(mut self, traces: bool) -> Self {
        self.traces = traces;
        self
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn fetch_receipts(&self, hashes: &[String]) -> RpcResult<Vec<Value>> {
        let mut receipts = Vec::with_capacity(hashes.len());
        for chunk in hashes.chunks(RECEIPT_BATCH_SIZE) {
            let calls = chunk
                .iter()
                .map(|hash| RpcCall::new("eth_getTransactionReceipt", vec![json!(hash)]))
                .collect();
            let results = self.transport.request_batch(calls).await?;
            if results.len() != chunk.len() {
                return Err(RpcError::InvalidResponse(format!(
                    "expected {} receipts, got {}",
                    chunk.len(),
                    results.len()
                )));
            }
            for (hash, result) in chunk.iter().zip(results) {
                match result? {
                    Value::Null => return Err(RpcError::ReceiptMissing(hash.clone())),
                    receipt => receipts.push(receipt),
                }
            }
        }
        Ok(receipts)
    }

    async fn fetch_traces(&self, number: u64, hashes: &[String]) -> RpcResult<Vec<TraceResult>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let params = vec![json!(format!("{:#x}", number)), call_tracer()];
        match self
            .transport
            .request_json("debug_traceBlockByNumber", params)
            .await
        {
            Ok(value) => match block_traces(value, hashes) {
                Some(traces) => return Ok(traces),
                None => debug!(number, "Block trace shape mismatch, tracing per transaction"),
            },
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => debug!(number, error = %e, "Block trace rejected, tracing per transaction"),
        }

        let requests: Vec<_> = hashes
            .iter()
            .map(|hash| self.trace_transaction(hash))
            .collect();
        stream::iter(requests)
            .buffered(TRACE_FALLBACK_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn trace_transaction(&self, hash: &str) -> RpcResult<TraceResult> {
        match self
            .transport
            .request_json("debug_traceTransaction", vec![json!(hash), call_tracer()])
            .await
        {
            Ok(result) => Ok(TraceResult {
                tx_hash: hash.to_string(),
                result: Some(result),
            }),
            Err(RpcError::Rpc { message, .. }) if message.contains(PRECOMPILE_TRACE_ERROR) => {
                Ok(TraceResult::empty(hash))
            }
            Err(e) => Err(e),
        }
    }
}

fn call_tracer() -> Value {
    json!({ "tracer": "callTracer" })
}

/// Interpret a `debug_traceBlockByNumber` result, one entry per transaction.
/// Entries without a `txHash` (older nodes) take it from the block order.
fn block_traces(value: Value, hashes: &[String]) -> Option<Vec<TraceResult>> {
    let Value::Array(entries) = value else {
        return None;
    };
    if entries.len() != hashes.len() {
        return None;
    }
    entries
        .into_iter()
        .zip(hashes)
        .map(|(entry, hash)| {
            let mut trace: TraceResult = serde_json::from_value(entry).ok()?;
            if trace.tx_hash.is_empty() {
                trace.tx_hash = hash.clone();
            }
            (trace.tx_hash == *hash).then_some(trace)
        })
        .collect()
}

#[async_trait]
impl<T: Transport + 'static> BlockSource for RpcBlockSource<T> {
    async fn fetch_block(&self, number: u64) -> RpcResult<NormalizedBlock> {
        let block = self
            .transport
            .request_json(
                "eth_getBlockByNumber",
                vec![json!(format!("{:#x}", number)), json!(true)],
            )
            .await?;
        if block.is_null() {
            return Err(RpcError::BlockNotFound(number));
        }

        let mut normalized = NormalizedBlock::new(block);
        // surfaces malformed numbers before any further calls
        normalized.number()?;

        let hashes = normalized.transaction_hashes();
        normalized.receipts = self.fetch_receipts(&hashes).await?;
        normalized.traces = if self.traces {
            self.fetch_traces(number, &hashes).await?
        } else {
            Vec::new()
        };
        Ok(normalized)
    }

    async fn latest_block_number(&self) -> RpcResult<u64> {
        let value = self.transport.request_json("eth_blockNumber", vec![]).await?;
        let raw = value
            .as_str()
            .ok_or_else(|| RpcError::InvalidResponse(format!("eth_blockNumber returned {value}")))?;
        Ok(parse_block_number(raw)?)
    }
}
