use super::ObjectStore;
use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Process-local object store
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl InMemoryObjectStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the store holds no objects
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        Ok(self.objects.read().get(key).cloned())
    }

    async fn head(&self, key: &str) -> StorageResult<Option<u64>> {
        Ok(self.objects.read().get(key).map(|data| data.len() as u64))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_head() {
        let store = InMemoryObjectStore::new();
        store.put("a/b", Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(store.get("a/b").await.unwrap(), Some(Bytes::from_static(b"hello")));
        assert_eq!(store.head("a/b").await.unwrap(), Some(5));
        assert_eq!(store.get("a/c").await.unwrap(), None);
        assert_eq!(store.head("a/c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let store = InMemoryObjectStore::new();
        for key in ["p/1/a", "p/1/b", "p/10/a", "p/2/a", "q/1/a"] {
            store.put(key, Bytes::from_static(b"x")).await.unwrap();
        }
        assert_eq!(store.list("p/1/").await.unwrap(), vec!["p/1/a", "p/1/b"]);
        assert_eq!(store.list("p/").await.unwrap().len(), 4);
        assert!(store.list("z/").await.unwrap().is_empty());
    }
}
