//! Hot tier: the most recent contiguous run of blocks per chain

use crate::db::{cf, Database, DbConfig, Edge};
use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use sink_types::BlockKey;
use std::path::Path;
use tracing::debug;

/// RocksDB-backed block store keyed by [`BlockKey`].
///
/// Every chain lives in the same column family under its own key prefix,
/// so per-chain scans are bounded by `block:{chain}:` and `block:{chain};`.
/// Cloning is cheap and shares the underlying database.
#[derive(Clone)]
pub struct HotStore {
    db: Database,
}

impl HotStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with_config(path, DbConfig::default())
    }

    /// Open with a custom RocksDB configuration
    pub fn open_with_config(path: impl AsRef<Path>, config: DbConfig) -> StorageResult<Self> {
        let db = Database::new(path);
        db.open_with_config(config)?;
        debug!(path = db.path(), "Hot store opened");
        Ok(Self { db })
    }

    /// Persist one block record. Durable before returning.
    pub fn save_block(&self, chain_id: u64, number: u64, record: &[u8]) -> StorageResult<()> {
        let key = BlockKey::new(chain_id, number).encode();
        self.db.put(cf::BLOCKS, &key, record)
    }

    /// Fetch one block record
    pub fn get_block(&self, chain_id: u64, number: u64) -> StorageResult<Option<Bytes>> {
        let key = BlockKey::new(chain_id, number).encode();
        Ok(self.db.get(cf::BLOCKS, &key)?.map(Bytes::from))
    }

    /// Highest block number stored for the chain
    pub fn latest_block(&self, chain_id: u64) -> StorageResult<Option<u64>> {
        self.edge_block(chain_id, Edge::Last)
    }

    /// Lowest block number stored for the chain
    pub fn first_block(&self, chain_id: u64) -> StorageResult<Option<u64>> {
        self.edge_block(chain_id, Edge::First)
    }

    fn edge_block(&self, chain_id: u64, edge: Edge) -> StorageResult<Option<u64>> {
        let lower = BlockKey::chain_prefix(chain_id);
        let upper = BlockKey::chain_upper_bound(chain_id);
        match self.db.edge_key(cf::BLOCKS, &lower, &upper, edge)? {
            Some(raw) => BlockKey::decode(&raw)
                .filter(|key| key.chain_id == chain_id)
                .map(|key| Some(key.number))
                .ok_or_else(|| {
                    StorageError::Corrupt(format!(
                        "unparsable hot key {}",
                        String::from_utf8_lossy(&raw)
                    ))
                }),
            None => Ok(None),
        }
    }

    /// All records with numbers in `[from, to]`, ascending
    pub fn range_scan(&self, chain_id: u64, from: u64, to: u64) -> StorageResult<Vec<(u64, Bytes)>> {
        if to < from {
            return Ok(Vec::new());
        }
        let lower = BlockKey::new(chain_id, from).encode();
        let upper = range_end(chain_id, to);

        let mut out = Vec::new();
        let mut bad_key = None;
        self.db.scan(cf::BLOCKS, &lower, &upper, |key, value| {
            match BlockKey::decode(key) {
                Some(k) => {
                    out.push((k.number, Bytes::copy_from_slice(value)));
                    true
                }
                None => {
                    bad_key = Some(String::from_utf8_lossy(key).into_owned());
                    false
                }
            }
        })?;

        match bad_key {
            Some(key) => Err(StorageError::Corrupt(format!("unparsable hot key {key}"))),
            None => Ok(out),
        }
    }

    /// Remove blocks `[from, to]` with one range tombstone
    pub fn delete_range(&self, chain_id: u64, from: u64, to: u64) -> StorageResult<()> {
        if to < from {
            return Ok(());
        }
        let lower = BlockKey::new(chain_id, from).encode();
        let upper = range_end(chain_id, to);
        self.db.delete_range(cf::BLOCKS, &lower, &upper)
    }

    /// Close the underlying database
    pub fn close(&self) {
        self.db.close();
    }
}

/// Exclusive key bound just past block `to`
fn range_end(chain_id: u64, to: u64) -> Vec<u8> {
    match to.checked_add(1) {
        Some(next) => BlockKey::new(chain_id, next).encode(),
        None => BlockKey::chain_upper_bound(chain_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, HotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HotStore::open(dir.path().join("hot")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_and_get() {
        let (_dir, hot) = store();
        hot.save_block(1, 7, b"seven").unwrap();
        assert_eq!(hot.get_block(1, 7).unwrap(), Some(Bytes::from_static(b"seven")));
        assert_eq!(hot.get_block(1, 8).unwrap(), None);
        assert_eq!(hot.get_block(2, 7).unwrap(), None);
    }

    #[test]
    fn test_latest_and_first_per_chain() {
        let (_dir, hot) = store();
        assert_eq!(hot.latest_block(1).unwrap(), None);

        for n in 5..=12 {
            hot.save_block(1, n, b"x").unwrap();
        }
        hot.save_block(10, 3, b"y").unwrap();
        hot.save_block(11, 900, b"z").unwrap();

        assert_eq!(hot.first_block(1).unwrap(), Some(5));
        assert_eq!(hot.latest_block(1).unwrap(), Some(12));
        // chain 1's keys must not bleed into chain 10 or 11
        assert_eq!(hot.latest_block(10).unwrap(), Some(3));
        assert_eq!(hot.first_block(11).unwrap(), Some(900));
    }

    #[test]
    fn test_numeric_order_across_digit_widths() {
        let (_dir, hot) = store();
        for n in [9, 10, 99, 100, 1000] {
            hot.save_block(1, n, b"x").unwrap();
        }
        assert_eq!(hot.latest_block(1).unwrap(), Some(1000));
        let numbers: Vec<u64> = hot
            .range_scan(1, 0, u64::MAX)
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(numbers, vec![9, 10, 99, 100, 1000]);
    }

    #[test]
    fn test_range_scan_inclusive() {
        let (_dir, hot) = store();
        for n in 1..=20 {
            hot.save_block(1, n, n.to_string().as_bytes()).unwrap();
        }
        let rows = hot.range_scan(1, 5, 8).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0], (5, Bytes::from_static(b"5")));
        assert_eq!(rows[3], (8, Bytes::from_static(b"8")));
        assert!(hot.range_scan(1, 8, 5).unwrap().is_empty());
    }

    #[test]
    fn test_delete_range() {
        let (_dir, hot) = store();
        for n in 1..=30 {
            hot.save_block(1, n, b"x").unwrap();
            hot.save_block(2, n, b"x").unwrap();
        }
        hot.delete_range(1, 1, 20).unwrap();

        assert_eq!(hot.first_block(1).unwrap(), Some(21));
        assert_eq!(hot.get_block(1, 20).unwrap(), None);
        assert_eq!(hot.first_block(2).unwrap(), Some(1));
    }

    #[test]
    fn test_overwrite_keeps_latest_value() {
        let (_dir, hot) = store();
        hot.save_block(1, 1, b"old").unwrap();
        hot.save_block(1, 1, b"new").unwrap();
        assert_eq!(hot.get_block(1, 1).unwrap(), Some(Bytes::from_static(b"new")));
    }
}
