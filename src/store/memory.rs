use super::{BlobStore, Store};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
        blobs.contains_key(key)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
        blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let blobs = self.blobs.read().unwrap_or_else(|e| e.into_inner());
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| Error::BlobNotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut blobs = self.blobs.write().unwrap_or_else(|e| e.into_inner());
        blobs.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = MemoryStore::new();
        store.write("service:b:latest", b"b".to_vec()).await.unwrap();
        store.write("service:a:latest", b"a".to_vec()).await.unwrap();
        store.write("other:x", b"x".to_vec()).await.unwrap();

        let keys: Vec<String> = store
            .list("service:")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["service:a:latest", "service:b:latest"]);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = MemoryStore::new();
        store.delete("service:nope:latest").await.unwrap();
        assert!(store.read("service:nope:latest").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blob_read_missing_is_not_found() {
        let blobs = MemoryBlobStore::new();
        let err = blobs.read("source://foo:latest").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert_eq!(err.to_string(), "Blob not found: source://foo:latest");

        blobs.write("source://foo:latest", vec![1, 2]).await.unwrap();
        assert_eq!(blobs.read("source://foo:latest").await.unwrap(), vec![1, 2]);
    }
}
