//! In-memory object store (for testing).

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::{ObjectStore, Result, StorageError, MAX_OBJECT_SIZE};

/// HashMap-backed store; presigned URLs are synthetic `memory://` URIs
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<(String, String), Vec<u8>>>>,
}

impl MemoryObjectStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        if data.len() > MAX_OBJECT_SIZE {
            return Err(StorageError::TooLarge(data.len()));
        }
        self.objects
            .write()
            .insert((bucket.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects
            .write()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn presign_get(&self, bucket: &str, key: &str) -> Result<String> {
        Ok(format!("memory://{bucket}/{key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryObjectStore::new();
        store.put("evidence", "b1", b"payload").await.unwrap();
        assert_eq!(store.get("evidence", "b1").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryObjectStore::new();
        assert!(matches!(
            store.get("evidence", "missing").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_put_rejected() {
        let store = MemoryObjectStore::new();
        let blob = vec![0u8; MAX_OBJECT_SIZE + 1];
        assert!(matches!(
            store.put("hipaa-documents", "big", &blob).await,
            Err(StorageError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryObjectStore::new();
        store.put("releases", "r1", b"iso").await.unwrap();
        store.delete("releases", "r1").await.unwrap();
        store.delete("releases", "r1").await.unwrap();
        assert!(store.is_empty());
    }
}
