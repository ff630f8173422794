//! # Schema Migration Runner
//!
//! Applies the embedded linear migration set in order. Each migration runs
//! in its own transaction and is recorded in `schema_migrations` with a
//! SHA-256 checksum of its SQL; a checksum mismatch on a previously applied
//! version aborts startup so schema drift is caught before any request is
//! served.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Executor, PgPool, Row};

use super::schema::{EmbeddedMigration, MIGRATIONS};
use super::{DatabaseError, Result};

/// Record of one applied migration
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    /// Migration version
    pub version: String,
    /// Migration name
    pub name: String,
    /// SHA-256 checksum of the SQL at apply time
    pub checksum: String,
    /// Wall-clock apply duration
    pub execution_time_ms: i64,
}

/// Compute the checksum recorded for a migration
pub fn checksum(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}

/// Apply all pending migrations against the pool
pub async fn run(pool: &PgPool) -> Result<()> {
    ensure_tracking_table(pool).await?;

    let applied = applied_versions(pool).await?;

    for migration in MIGRATIONS {
        match applied.iter().find(|a| a.version == migration.version) {
            Some(existing) => {
                let computed = checksum(migration.sql);
                if existing.checksum != computed {
                    return Err(DatabaseError::ChecksumDrift {
                        version: migration.version.to_string(),
                        recorded: existing.checksum.clone(),
                        computed,
                    });
                }
            }
            None => apply(pool, migration).await?,
        }
    }

    Ok(())
}

/// List applied migrations in version order
pub async fn applied_versions(pool: &PgPool) -> Result<Vec<AppliedMigration>> {
    let rows = sqlx::query_as::<_, AppliedMigration>(
        "SELECT version, name, checksum, execution_time_ms
         FROM schema_migrations ORDER BY version",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

async fn ensure_tracking_table(pool: &PgPool) -> Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version             TEXT PRIMARY KEY,
            name                TEXT NOT NULL,
            checksum            TEXT NOT NULL,
            execution_time_ms   BIGINT NOT NULL,
            applied_at          TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .await?;
    Ok(())
}

async fn apply(pool: &PgPool, migration: &EmbeddedMigration) -> Result<()> {
    log::info!("Applying migration {} ({})", migration.version, migration.name);
    let started = Utc::now();

    let mut tx = pool.begin().await?;

    // Double-check under the transaction so two racing instances cannot
    // both apply the same version.
    let already: Option<i32> = sqlx::query(
        "SELECT 1 AS one FROM schema_migrations WHERE version = $1 FOR UPDATE",
    )
    .bind(migration.version)
    .fetch_optional(&mut *tx)
    .await?
    .map(|r| r.get("one"));

    if already.is_some() {
        tx.rollback().await?;
        return Ok(());
    }

    (&mut *tx)
        .execute(migration.sql)
        .await
        .map_err(|e| DatabaseError::Migration(format!("{}: {}", migration.version, e)))?;

    let elapsed_ms = (Utc::now() - started).num_milliseconds();

    sqlx::query(
        "INSERT INTO schema_migrations (version, name, checksum, execution_time_ms)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(migration.version)
    .bind(migration.name)
    .bind(checksum(migration.sql))
    .bind(elapsed_ms)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_hex_sha256() {
        let sum = checksum("CREATE TABLE t (id INT)");
        assert_eq!(sum.len(), 64);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_checksum_changes_with_content() {
        assert_ne!(checksum("a"), checksum("b"));
    }
}
