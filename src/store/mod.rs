//! Storage
//!
//! Key/value storage for desired-state records and blob storage for uploaded
//! source and built artifacts.

mod file;
mod memory;

pub use file::{FileBlobStore, FileStore};
pub use memory::{MemoryBlobStore, MemoryStore};

use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Store: Send + Sync {
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn write(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Fails with `BlobNotFound` for unknown keys.
    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Blob key for uploaded source.
pub fn source_blob_key(name: &str, version: &str) -> String {
    format!("source://{}:{}", name, version)
}

/// Blob key for a built artifact.
pub fn build_blob_key(name: &str, version: &str) -> String {
    format!("build://{}:{}", name, version)
}

/// Filesystem-safe, reversible encoding of a key.
fn encode_key(key: &str) -> String {
    urlencoding::encode(key).into_owned()
}

fn decode_key(name: &str) -> Option<String> {
    urlencoding::decode(name).ok().map(|k| k.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_encoding_is_reversible() {
        for key in ["service:foo:latest", "source://a/b:v1", "x_y__z"] {
            let encoded = encode_key(key);
            assert!(!encoded.contains('/'));
            assert!(!encoded.contains(':'));
            assert_eq!(decode_key(&encoded).as_deref(), Some(key));
        }
    }

    #[test]
    fn test_blob_keys() {
        assert_eq!(source_blob_key("foo", "v1"), "source://foo:v1");
        assert_eq!(build_blob_key("foo", "v1"), "build://foo:v1");
    }
}
