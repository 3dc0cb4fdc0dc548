//! Blob storage abstraction.
//!
//! Parameter records and slot values that exceed the inline-size threshold
//! are offloaded here and the record keeps only the returned handle.
//! Implementations can target local filesystem (dev server) or an object
//! store (production).

use async_trait::async_trait;
use std::path::PathBuf;

/// Error type for blob storage operations.
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid blob handle: {0}")]
    InvalidHandle(String),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Abstract blob storage for oversized payloads.
///
/// Keys are caller-chosen paths (the engine uses `<root_pipeline_id>/<uuid>`
/// so a workflow's blobs are grouped); the returned handle is opaque and is
/// what gets persisted in the record store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store content, return an opaque handle.
    async fn store(&self, key: &str, content: &[u8]) -> Result<String, BlobStoreError>;

    /// Fetch content by handle.
    async fn fetch(&self, handle: &str) -> Result<Vec<u8>, BlobStoreError>;

    /// Delete content by handle. Deleting a missing blob is not an error.
    async fn delete(&self, handle: &str) -> Result<(), BlobStoreError>;

    /// Check if a blob exists.
    async fn exists(&self, handle: &str) -> Result<bool, BlobStoreError>;
}

/// Local filesystem implementation (for the dev server).
pub struct LocalBlobStore {
    base_path: PathBuf,
}

impl LocalBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn path_for_key(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn path_from_handle(&self, handle: &str) -> Result<PathBuf, BlobStoreError> {
        handle
            .strip_prefix("file://")
            .map(PathBuf::from)
            .ok_or_else(|| {
                BlobStoreError::InvalidHandle(format!("expected file:// prefix: {handle}"))
            })
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store(&self, key: &str, content: &[u8]) -> Result<String, BlobStoreError> {
        let path = self.path_for_key(key);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&path, content).await?;
        Ok(format!("file://{}", path.display()))
    }

    async fn fetch(&self, handle: &str) -> Result<Vec<u8>, BlobStoreError> {
        let path = self.path_from_handle(handle)?;

        if !path.exists() {
            return Err(BlobStoreError::NotFound(handle.to_string()));
        }

        Ok(tokio::fs::read(path).await?)
    }

    async fn delete(&self, handle: &str) -> Result<(), BlobStoreError> {
        let path = self.path_from_handle(handle)?;

        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }

        Ok(())
    }

    async fn exists(&self, handle: &str) -> Result<bool, BlobStoreError> {
        let path = self.path_from_handle(handle)?;
        Ok(path.exists())
    }
}

/// In-memory blob store for tests and the POC harness.
pub struct MemoryBlobStore {
    blobs: tokio::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn store(&self, key: &str, content: &[u8]) -> Result<String, BlobStoreError> {
        let handle = format!("memory://{key}");
        let mut blobs = self.blobs.write().await;
        blobs.insert(handle.clone(), content.to_vec());
        Ok(handle)
    }

    async fn fetch(&self, handle: &str) -> Result<Vec<u8>, BlobStoreError> {
        let blobs = self.blobs.read().await;
        blobs
            .get(handle)
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound(handle.to_string()))
    }

    async fn delete(&self, handle: &str) -> Result<(), BlobStoreError> {
        let mut blobs = self.blobs.write().await;
        blobs.remove(handle);
        Ok(())
    }

    async fn exists(&self, handle: &str) -> Result<bool, BlobStoreError> {
        let blobs = self.blobs.read().await;
        Ok(blobs.contains_key(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_blob_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(temp_dir.path());

        let content = b"{\"answer\":42}";
        let key = "root-1/value-1";

        let handle = store.store(key, content).await.unwrap();
        assert!(handle.starts_with("file://"));

        assert!(store.exists(&handle).await.unwrap());
        assert_eq!(store.fetch(&handle).await.unwrap(), content);

        store.delete(&handle).await.unwrap();
        assert!(!store.exists(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_blob_store() {
        let store = MemoryBlobStore::new();

        let handle = store.store("k", b"data").await.unwrap();
        assert!(store.exists(&handle).await.unwrap());
        assert_eq!(store.fetch(&handle).await.unwrap(), b"data");

        store.delete(&handle).await.unwrap();
        assert!(!store.exists(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_not_found_error() {
        let store = MemoryBlobStore::new();
        let result = store.fetch("memory://nonexistent").await;
        assert!(matches!(result, Err(BlobStoreError::NotFound(_))));
    }
}
