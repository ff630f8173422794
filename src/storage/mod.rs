//! # Object Storage Abstraction Layer
//!
//! Unified interface over the S3-compatible blob store holding evidence
//! artifacts, rule bundles, OS image releases, and uploaded documents.
//! Evidence objects are append-or-overwrite per key, never mutated in
//! place.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod minio;

pub use memory::MemoryObjectStore;
pub use minio::MinioObjectStore;

/// Well-known bucket names
pub mod buckets {
    /// Evidence artifacts
    pub const EVIDENCE: &str = "evidence";
    /// Uploaded compliance documents
    pub const HIPAA_DOCUMENTS: &str = "hipaa-documents";
    /// OS image releases
    pub const RELEASES: &str = "releases";
    /// Signed rule bundles
    pub const RULE_BUNDLES: &str = "rule-bundles";
}

/// Uploads larger than this are rejected before they reach the store
pub const MAX_OBJECT_SIZE: usize = 25 * 1024 * 1024;

/// Storage error types
#[derive(Debug, Error)]
pub enum StorageError {
    /// Object not found
    #[error("Object not found: {bucket}/{key}")]
    NotFound {
        /// Bucket name
        bucket: String,
        /// Object key
        key: String,
    },

    /// Object exceeds [`MAX_OBJECT_SIZE`]
    #[error("Object too large: {0} bytes")]
    TooLarge(usize),

    /// Transport or service failure; retryable
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Configuration problem (bad endpoint, bad credentials)
    #[error("Invalid storage configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Blob store contract: opaque bytes per `(bucket, key)` plus presigned
/// GET URLs handed to agents.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object
    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()>;

    /// Fetch an object
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Delete an object (no-op when absent)
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Produce a time-limited GET URL for agents
    async fn presign_get(&self, bucket: &str, key: &str) -> Result<String>;
}

/// Key layout for uploaded compliance documents
pub fn document_key(org_id: &str, module_key: &str, filename: &str) -> String {
    format!("{org_id}/{module_key}/{}_{filename}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_key_layout() {
        let key = document_key("org-9", "sra", "assessment.pdf");
        let parts: Vec<&str> = key.splitn(3, '/').collect();
        assert_eq!(parts[0], "org-9");
        assert_eq!(parts[1], "sra");
        assert!(parts[2].ends_with("_assessment.pdf"));
    }
}
