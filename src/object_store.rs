//! Object store for raw file bytes
//!
//! Keys are content-addressed: `<user_id>/<content_hash>/<original_filename>`.
//! The bundled implementation is filesystem-backed; an S3-compatible service
//! slots in behind the same trait.

use crate::error::{RagError, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Storage backend for uploaded file bytes
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object, replacing any existing bytes under the key
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch an object's bytes
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove an object; missing keys are not an error
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Build the canonical object key for a file
pub fn object_key(user_id: i64, content_hash: &str, filename: &str) -> String {
    format!("{}/{}/{}", user_id, content_hash, filename)
}

/// Filesystem-backed object store rooted at a directory
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        // Reject traversal and absolute keys before touching the filesystem
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(RagError::Storage(format!("invalid object key: {}", key))),
            }
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!("stored {} bytes at {}", bytes.len(), key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => {
                Err(RagError::Storage(format!("object is empty: {}", key)))
            }
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RagError::Storage(format!(
                "object does not exist: {}",
                key
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let key = object_key(7, "deadbeef", "notes.txt");

        store.put(&key, b"hello").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), b"hello");

        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.is_err());
        // Deleting again is fine
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.put("/abs/path", b"x").await.is_err());
    }

    #[test]
    fn test_object_key_shape() {
        assert_eq!(object_key(1, "ff00", "a b.pdf"), "1/ff00/a b.pdf");
    }
}
