//! File-backed stores. One file per key, names percent-encoded.

use super::{BlobStore, Store, decode_key, encode_key};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

const RECORD_EXT: &str = "json";
const BLOB_EXT: &str = "blob";

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_key(key), RECORD_EXT))
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Store for FileStore {
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<()> {
        write_atomic(&self.path_for(key), &value).await
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Store(format!("reading {}: {}", key, e))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::Store(format!("listing {}: {}", self.dir.display(), e)))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != RECORD_EXT) {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_key)
            else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => entries.push((key, bytes)),
                // deleted between read_dir and read
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Store(format!("reading {}: {}", key, e))),
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        remove_if_exists(&self.path_for(key)).await
    }
}

pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_key(key), BLOB_EXT))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        write_atomic(&self.path_for(key), &bytes).await
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::BlobNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        remove_if_exists(&self.path_for(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::new(dir.path()).unwrap();
            store
                .write("service:foo:latest", b"{}".to_vec())
                .await
                .unwrap();
            store.write("other:bar", b"x".to_vec()).await.unwrap();
        }

        let store = FileStore::new(dir.path()).unwrap();
        let listed = store.list("service:").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "service:foo:latest");

        store.delete("service:foo:latest").await.unwrap();
        store.delete("service:foo:latest").await.unwrap();
        assert!(store.read("service:foo:latest").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_blob_store() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FileBlobStore::new(dir.path()).unwrap();

        blobs
            .write("build://foo:v1", b"\x7fELF".to_vec())
            .await
            .unwrap();
        assert_eq!(blobs.read("build://foo:v1").await.unwrap(), b"\x7fELF");

        blobs.delete("build://foo:v1").await.unwrap();
        assert_eq!(
            blobs.read("build://foo:v1").await.unwrap_err().kind(),
            "not_found"
        );
    }
}
