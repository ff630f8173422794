//! # Database Layer
//!
//! This module provides the control plane's relational storage layer:
//! - Async connection pooling over Postgres
//! - A linear, checksummed schema migration system
//! - Advisory-lock helpers for serialized critical sections
//!
//! The relational store is the only mutable shared state in the control
//! plane. All domain managers hold a cloned [`sqlx::PgPool`] and keep
//! transactions short; no transaction spans an outbound HTTP or
//! object-store call.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use aegis::database::Database;
//!
//! let db = Database::connect(&config).await?;
//! db.migrate().await?;
//! let pool = db.pool().clone();
//! ```

use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

use crate::config::Config;

pub mod migrations;
pub mod schema;

/// Database error types
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Connection or pool failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution error
    #[error("Query execution error: {0}")]
    Query(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// A previously applied migration no longer matches its recorded checksum
    #[error("Migration checksum drift for version {version}: recorded {recorded}, computed {computed}")]
    ChecksumDrift {
        /// Migration version
        version: String,
        /// Checksum recorded at apply time
        recorded: String,
        /// Checksum of the embedded SQL now
        computed: String,
    },
}

/// Result type for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Handle to the control-plane database
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to Postgres using the configured URL and pool size
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests, CLI)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply all pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        migrations::run(&self.pool).await
    }
}

/// Derive a stable 64-bit advisory lock key from an opaque identifier.
///
/// The key is the low 8 bytes of SHA-256 over the identifier, interpreted
/// as a big-endian i64. Stable across processes and releases so that every
/// control-plane instance serializes on the same lock for the same site.
pub fn advisory_lock_key(id: &str) -> i64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advisory_lock_key_stable() {
        let a = advisory_lock_key("clinic-1");
        let b = advisory_lock_key("clinic-1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_advisory_lock_key_distinct_sites() {
        assert_ne!(advisory_lock_key("clinic-1"), advisory_lock_key("clinic-2"));
    }
}
