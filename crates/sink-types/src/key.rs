//! Hot-store keys, batch windows and archive object keys

use std::fmt;

/// Blocks per archive batch unless configured otherwise
pub const DEFAULT_BATCH_SIZE: u64 = 100;

/// First block number of every chain. Block 0 is never ingested.
pub const FIRST_BLOCK: u64 = 1;

const KEY_PREFIX: &str = "block:";
const ARCHIVE_SUFFIX: &str = ".jsonl.zstd";
const NUMBER_WIDTH: usize = 20;

/// Hot-store key: `block:{chain_id}:{number:020}`.
///
/// Zero padding makes lexicographic order equal numeric order within a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    /// Chain ID
    pub chain_id: u64,
    /// Block number
    pub number: u64,
}

impl BlockKey {
    /// Create a new key
    pub fn new(chain_id: u64, number: u64) -> Self {
        Self { chain_id, number }
    }

    /// Encode to the on-disk byte form
    pub fn encode(&self) -> Vec<u8> {
        format!("{}{}:{:020}", KEY_PREFIX, self.chain_id, self.number).into_bytes()
    }

    /// Decode from the on-disk byte form
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let s = std::str::from_utf8(bytes).ok()?;
        let rest = s.strip_prefix(KEY_PREFIX)?;
        let (chain, number) = rest.split_once(':')?;
        if number.len() != NUMBER_WIDTH {
            return None;
        }
        Some(Self {
            chain_id: chain.parse().ok()?,
            number: number.parse().ok()?,
        })
    }

    /// Inclusive lower bound of every key belonging to `chain_id`
    pub fn chain_prefix(chain_id: u64) -> Vec<u8> {
        format!("{}{}:", KEY_PREFIX, chain_id).into_bytes()
    }

    /// Exclusive upper bound of every key belonging to `chain_id`.
    /// `;` is the byte after `:`.
    pub fn chain_upper_bound(chain_id: u64) -> Vec<u8> {
        format!("{}{};", KEY_PREFIX, chain_id).into_bytes()
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{:020}", KEY_PREFIX, self.chain_id, self.number)
    }
}

/// An aligned window `[start, end]` of block numbers archived together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Batch {
    /// First block number of the window (multiple of the batch size)
    pub start: u64,
    /// Last block number of the window, inclusive
    pub end: u64,
}

impl Batch {
    /// The batch containing `number`
    pub fn containing(number: u64, size: u64) -> Self {
        let size = size.max(1);
        Self::starting_at(number / size * size, size)
    }

    /// The batch beginning at `start`
    pub fn starting_at(start: u64, size: u64) -> Self {
        let size = size.max(1);
        Self {
            start,
            end: start + size - 1,
        }
    }

    /// Window size
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// The following batch
    pub fn next(&self) -> Self {
        Self::starting_at(self.end + 1, self.size())
    }

    /// First block that can exist in this window
    pub fn first_block(&self) -> u64 {
        self.start.max(FIRST_BLOCK)
    }

    /// Number of blocks a complete copy of this window holds
    pub fn block_count(&self) -> u64 {
        self.end - self.first_block() + 1
    }

    /// Whether `number` falls inside the window
    pub fn contains(&self, number: u64) -> bool {
        number >= self.start && number <= self.end
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Object key prefix for everything archived for a chain, ending in `/`
pub fn chain_archive_prefix(prefix: &str, chain_id: u64) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        format!("{}/", chain_id)
    } else {
        format!("{}/{}/", prefix, chain_id)
    }
}

/// Object key of an archived batch:
/// `{prefix}/{chain_id}/{start:020}-{end:020}.jsonl.zstd`
pub fn archive_key(prefix: &str, chain_id: u64, batch: Batch) -> String {
    format!(
        "{}{:020}-{:020}{}",
        chain_archive_prefix(prefix, chain_id),
        batch.start,
        batch.end,
        ARCHIVE_SUFFIX
    )
}

/// Object key of the per-chain compaction metadata
pub fn meta_key(prefix: &str, chain_id: u64) -> String {
    format!("{}meta.json", chain_archive_prefix(prefix, chain_id))
}

/// Parse the file-name part of an archive key back into its batch
pub fn parse_archive_file(name: &str) -> Option<Batch> {
    let stem = name.strip_suffix(ARCHIVE_SUFFIX)?;
    let (start, end) = stem.split_once('-')?;
    if start.len() != NUMBER_WIDTH || end.len() != NUMBER_WIDTH {
        return None;
    }
    let start: u64 = start.parse().ok()?;
    let end: u64 = end.parse().ok()?;
    if end < start {
        return None;
    }
    Some(Batch { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_key_encoding() {
        let key = BlockKey::new(1, 42);
        assert_eq!(key.encode(), b"block:1:00000000000000000042".to_vec());
        assert_eq!(key.to_string(), "block:1:00000000000000000042");
        assert_eq!(BlockKey::decode(&key.encode()), Some(key));
    }

    #[test]
    fn test_block_key_decode_invalid() {
        assert_eq!(BlockKey::decode(b"block:1:42"), None);
        assert_eq!(BlockKey::decode(b"meta:1:00000000000000000042"), None);
        assert_eq!(BlockKey::decode(b"block:x:00000000000000000042"), None);
        assert_eq!(BlockKey::decode(&[0xff, 0xfe]), None);
    }

    #[test]
    fn test_block_key_ordering_matches_numbers() {
        let numbers = [1u64, 9, 10, 99, 100, 1_000_000, u64::MAX];
        let mut keys: Vec<Vec<u8>> = numbers.iter().map(|n| BlockKey::new(5, *n).encode()).collect();
        keys.sort();
        let decoded: Vec<u64> = keys.iter().map(|k| BlockKey::decode(k).unwrap().number).collect();
        assert_eq!(decoded, numbers.to_vec());
    }

    #[test]
    fn test_chain_bounds_isolate_chains() {
        let lower = BlockKey::chain_prefix(1);
        let upper = BlockKey::chain_upper_bound(1);
        let inside = BlockKey::new(1, u64::MAX).encode();
        let other = BlockKey::new(12, 5).encode();
        let other_high = BlockKey::new(10, 0).encode();

        assert!(inside >= lower && inside < upper);
        assert!(!(other >= lower && other < upper));
        assert!(!(other_high >= lower && other_high < upper));
    }

    #[test]
    fn test_batch_alignment() {
        for n in [0u64, 1, 99, 100, 101, 199, 250, 12_345] {
            let batch = Batch::containing(n, 100);
            assert_eq!(batch.start % 100, 0);
            assert_eq!(batch.start + 100 - 1, batch.end);
            assert!(batch.contains(n));
            for m in batch.start..=batch.end {
                assert_eq!(Batch::containing(m, 100), batch);
            }
        }
    }

    #[test]
    fn test_batch_first_window() {
        let first = Batch::containing(1, 100);
        assert_eq!(first, Batch { start: 0, end: 99 });
        assert_eq!(first.first_block(), 1);
        assert_eq!(first.block_count(), 99);

        let second = first.next();
        assert_eq!(second, Batch { start: 100, end: 199 });
        assert_eq!(second.first_block(), 100);
        assert_eq!(second.block_count(), 100);
    }

    #[test]
    fn test_batch_zero_size_is_clamped() {
        let batch = Batch::containing(7, 0);
        assert_eq!(batch, Batch { start: 7, end: 7 });
    }

    #[test]
    fn test_archive_key() {
        let batch = Batch::starting_at(100, 100);
        assert_eq!(
            archive_key("blocks", 43114, batch),
            "blocks/43114/00000000000000000100-00000000000000000199.jsonl.zstd"
        );
        assert_eq!(
            archive_key("", 1, batch),
            "1/00000000000000000100-00000000000000000199.jsonl.zstd"
        );
        assert_eq!(
            archive_key("a/b/", 1, batch),
            "a/b/1/00000000000000000100-00000000000000000199.jsonl.zstd"
        );
        assert_eq!(meta_key("blocks", 7), "blocks/7/meta.json");
    }

    #[test]
    fn test_parse_archive_file() {
        let batch = Batch::starting_at(200, 100);
        let key = archive_key("p", 1, batch);
        let name = key.rsplit('/').next().unwrap();
        assert_eq!(parse_archive_file(name), Some(batch));

        assert_eq!(parse_archive_file("meta.json"), None);
        assert_eq!(parse_archive_file("100-199.jsonl.zstd"), None);
        assert_eq!(
            parse_archive_file("00000000000000000199-00000000000000000100.jsonl.zstd"),
            None
        );
    }
}
