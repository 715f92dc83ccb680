use super::ObjectStore;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Object store rooted at a local directory.
///
/// Keys map to relative paths. Writes go to a temporary sibling file that
/// is renamed into place, so readers never see a partial object.
pub struct LocalFsObjectStore {
    root: PathBuf,
}

impl LocalFsObjectStore {
    /// Use `root` as the store directory (created on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StorageError::InvalidKey(key.to_string()));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for LocalFsObjectStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let suffix: u64 = rand::thread_rng().gen();
        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".tmp-{suffix:016x}"));
        let tmp = PathBuf::from(tmp);

        if let Err(err) = fs::write(&tmp, &data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn head(&self, key: &str) -> StorageResult<Option<u64>> {
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        // Walk only the deepest directory the prefix fully names
        let base = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if base.is_empty() {
            self.root.clone()
        } else {
            self.path_for(base)?
        };

        let mut keys = Vec::new();
        let mut pending = vec![(start, base.to_string())];
        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{rel}/{name}")
                };
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if key.starts_with(prefix) && !name.contains(".tmp-") {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());

        store.put("archive/1/a.bin", Bytes::from_static(b"one")).await.unwrap();
        store.put("archive/1/a.bin", Bytes::from_static(b"one")).await.unwrap();
        assert_eq!(
            store.get("archive/1/a.bin").await.unwrap(),
            Some(Bytes::from_static(b"one"))
        );
        assert_eq!(store.head("archive/1/a.bin").await.unwrap(), Some(3));
        assert_eq!(store.get("archive/1/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_nested() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());
        for key in ["x/1/b", "x/1/a", "x/1/sub/c", "x/2/a"] {
            store.put(key, Bytes::from_static(b"v")).await.unwrap();
        }
        assert_eq!(
            store.list("x/1/").await.unwrap(),
            vec!["x/1/a", "x/1/b", "x/1/sub/c"]
        );
        assert!(store.list("y/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());
        let err = store.put("../evil", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }
}
