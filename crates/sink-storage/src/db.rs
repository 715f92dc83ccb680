//! RocksDB wrapper

use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, ReadOptions, WriteBatch, WriteOptions,
};
use std::path::Path;
use std::sync::Arc;

/// Column family names
pub mod cf {
    /// Normalized block records
    pub const BLOCKS: &str = "blocks";
}

/// All column family names
pub const ALL_CFS: &[&str] = &[cf::BLOCKS];

type RocksDB = DBWithThreadMode<MultiThreaded>;

/// Database configuration
#[derive(Clone, Debug)]
pub struct DbConfig {
    /// Create database if missing
    pub create_if_missing: bool,
    /// Maximum number of open files
    pub max_open_files: i32,
    /// Write buffer size
    pub write_buffer_size: usize,
    /// Maximum write buffers
    pub max_write_buffer_number: i32,
    /// fsync the WAL before a write returns
    pub sync_writes: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
            max_write_buffer_number: 3,
            sync_writes: true,
        }
    }
}

/// Which end of a key range to read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    /// Smallest key
    First,
    /// Largest key
    Last,
}

/// RocksDB wrapper with column family support
pub struct Database {
    db: Arc<RwLock<Option<RocksDB>>>,
    path: String,
    sync_writes: Arc<RwLock<bool>>,
}

impl Database {
    /// Create a new database instance (not yet opened)
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            db: Arc::new(RwLock::new(None)),
            path: path.as_ref().to_string_lossy().to_string(),
            sync_writes: Arc::new(RwLock::new(true)),
        }
    }

    /// Open the database with default config
    pub fn open(&self) -> StorageResult<()> {
        self.open_with_config(DbConfig::default())
    }

    /// Open the database with custom config
    pub fn open_with_config(&self, config: DbConfig) -> StorageResult<()> {
        let mut db_guard = self.db.write();
        if db_guard.is_some() {
            return Err(StorageError::AlreadyOpen);
        }

        let mut opts = Options::default();
        opts.create_if_missing(config.create_if_missing);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = RocksDB::open_cf_descriptors(&opts, &self.path, cf_descriptors)?;
        *db_guard = Some(db);
        *self.sync_writes.write() = config.sync_writes;
        Ok(())
    }

    /// Close the database
    pub fn close(&self) {
        let mut db_guard = self.db.write();
        *db_guard = None;
    }

    /// Check if database is open
    pub fn is_open(&self) -> bool {
        self.db.read().is_some()
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(*self.sync_writes.read());
        opts
    }

    /// Get a value from a column family
    pub fn get(&self, cf_name: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let db_guard = self.db.read();
        let db = db_guard.as_ref().ok_or(StorageError::NotOpen)?;
        let cf = self.get_cf(db, cf_name)?;
        Ok(db.get_cf(&cf, key)?)
    }

    /// Put a value to a column family. Durable once this returns when
    /// `sync_writes` is set.
    pub fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let db_guard = self.db.read();
        let db = db_guard.as_ref().ok_or(StorageError::NotOpen)?;
        let cf = self.get_cf(db, cf_name)?;
        db.put_cf_opt(&cf, key, value, &self.write_options())?;
        Ok(())
    }

    /// Delete every key in `[from, to)` with a single range tombstone
    pub fn delete_range(&self, cf_name: &str, from: &[u8], to: &[u8]) -> StorageResult<()> {
        let db_guard = self.db.read();
        let db = db_guard.as_ref().ok_or(StorageError::NotOpen)?;
        let cf = self.get_cf(db, cf_name)?;
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(&cf, from, to);
        db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    /// Key at one edge of `[lower, upper)`, if the range holds any
    pub fn edge_key(
        &self,
        cf_name: &str,
        lower: &[u8],
        upper: &[u8],
        edge: Edge,
    ) -> StorageResult<Option<Vec<u8>>> {
        let db_guard = self.db.read();
        let db = db_guard.as_ref().ok_or(StorageError::NotOpen)?;
        let cf = self.get_cf(db, cf_name)?;

        let mode = match edge {
            Edge::First => IteratorMode::Start,
            Edge::Last => IteratorMode::End,
        };
        let mut iter = db.iterator_cf_opt(&cf, bounded(lower, upper), mode);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(Some(key.into_vec()))
            }
            None => Ok(None),
        }
    }

    /// Visit every entry in `[lower, upper)` in key order until `visit`
    /// returns false
    pub fn scan<F>(&self, cf_name: &str, lower: &[u8], upper: &[u8], mut visit: F) -> StorageResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let db_guard = self.db.read();
        let db = db_guard.as_ref().ok_or(StorageError::NotOpen)?;
        let cf = self.get_cf(db, cf_name)?;

        for item in db.iterator_cf_opt(&cf, bounded(lower, upper), IteratorMode::Start) {
            let (key, value) = item?;
            if !visit(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    /// Get column family handle
    fn get_cf<'a>(&self, db: &'a RocksDB, name: &str) -> StorageResult<Arc<BoundColumnFamily<'a>>> {
        db.cf_handle(name)
            .ok_or_else(|| StorageError::InvalidColumnFamily(name.to_string()))
    }

    /// Get database path
    pub fn path(&self) -> &str {
        &self.path
    }
}

fn bounded(lower: &[u8], upper: &[u8]) -> ReadOptions {
    let mut opts = ReadOptions::default();
    opts.set_iterate_lower_bound(lower.to_vec());
    opts.set_iterate_upper_bound(upper.to_vec());
    opts
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            path: self.path.clone(),
            sync_writes: Arc::clone(&self.sync_writes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("db"));
        db.open().unwrap();
        (dir, db)
    }

    #[test]
    fn test_open_close() {
        let (_dir, db) = open_temp();
        assert!(db.is_open());
        db.close();
        assert!(!db.is_open());
    }

    #[test]
    fn test_put_get() {
        let (_dir, db) = open_temp();
        db.put(cf::BLOCKS, b"key1", b"value1").unwrap();
        assert_eq!(db.get(cf::BLOCKS, b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(db.get(cf::BLOCKS, b"missing").unwrap(), None);
    }

    #[test]
    fn test_not_open_error() {
        let db = Database::new("/tmp/sink_not_opened");
        let result = db.get(cf::BLOCKS, b"key");
        assert!(matches!(result, Err(StorageError::NotOpen)));
    }

    #[test]
    fn test_already_open_error() {
        let (_dir, db) = open_temp();
        assert!(matches!(db.open(), Err(StorageError::AlreadyOpen)));
    }

    #[test]
    fn test_invalid_column_family() {
        let (_dir, db) = open_temp();
        let result = db.get("nope", b"key");
        assert!(matches!(result, Err(StorageError::InvalidColumnFamily(_))));
    }

    #[test]
    fn test_edges_respect_bounds() {
        let (_dir, db) = open_temp();
        for key in [&b"a1"[..], b"b1", b"b2", b"b3", b"c1"] {
            db.put(cf::BLOCKS, key, b"v").unwrap();
        }
        let first = db.edge_key(cf::BLOCKS, b"b", b"c", Edge::First).unwrap();
        let last = db.edge_key(cf::BLOCKS, b"b", b"c", Edge::Last).unwrap();
        assert_eq!(first, Some(b"b1".to_vec()));
        assert_eq!(last, Some(b"b3".to_vec()));
        assert_eq!(db.edge_key(cf::BLOCKS, b"d", b"e", Edge::Last).unwrap(), None);
    }

    #[test]
    fn test_scan_and_delete_range() {
        let (_dir, db) = open_temp();
        for i in 0..10u8 {
            db.put(cf::BLOCKS, &[b'k', i], &[i]).unwrap();
        }

        db.delete_range(cf::BLOCKS, &[b'k', 2], &[b'k', 5]).unwrap();

        let mut seen = Vec::new();
        db.scan(cf::BLOCKS, b"k", b"l", |_, v| {
            seen.push(v[0]);
            true
        })
        .unwrap();
        assert_eq!(seen, vec![0, 1, 5, 6, 7, 8, 9]);

        let mut limited = 0;
        db.scan(cf::BLOCKS, b"k", b"l", |_, _| {
            limited += 1;
            limited < 3
        })
        .unwrap();
        assert_eq!(limited, 3);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("db"));
        db.open().unwrap();
        db.put(cf::BLOCKS, b"key1", b"value1").unwrap();
        db.close();

        db.open().unwrap();
        assert_eq!(db.get(cf::BLOCKS, b"key1").unwrap(), Some(b"value1".to_vec()));
    }
}
