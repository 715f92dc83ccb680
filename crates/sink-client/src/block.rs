//! Blocks handed to consumers

use crate::error::ClientResult;
use bytes::Bytes;
use sink_types::NormalizedBlock;

/// One delivered block: its number and the raw JSON record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedBlock {
    /// Chain ID
    pub chain_id: u64,
    /// Block number, read from the record itself
    pub number: u64,
    /// Record bytes as stored by the sink
    pub data: Bytes,
}

impl StreamedBlock {
    /// Parse the record into block, receipts and traces
    pub fn decode(&self) -> ClientResult<NormalizedBlock> {
        Ok(NormalizedBlock::from_record(&self.data)?)
    }
}
