//! # Configuration
//!
//! Environment-driven configuration for the control plane. Every knob has a
//! default suitable for local development; production deployments override
//! via `AEGIS_*` environment variables.

use std::env;
use std::net::SocketAddr;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is missing
    #[error("Missing required environment variable: {0}")]
    Missing(String),

    /// A variable could not be parsed
    #[error("Invalid value for {name}: {value}")]
    Invalid {
        /// Variable name
        name: String,
        /// Offending value
        value: String,
    },
}

/// Result type for configuration loading
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Object store connection settings
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    /// S3-compatible endpoint, e.g. `http://minio:9000`
    pub endpoint: String,
    /// Access key id
    pub access_key: String,
    /// Secret access key
    pub secret_key: String,
    /// Region string used when signing presigned URLs
    pub region: String,
    /// Lifetime of presigned GET URLs in seconds
    pub presign_ttl_secs: u64,
}

/// OpenTimestamps anchoring settings
#[derive(Debug, Clone)]
pub struct OtsConfig {
    /// Whether anchoring is enabled at all
    pub enabled: bool,
    /// Calendar server URLs tried in order
    pub calendars: Vec<String>,
    /// Minimum bundle age before submission
    pub min_age_secs: i64,
}

/// Cron cadences for the background workers
#[derive(Debug, Clone)]
pub struct WorkerCadences {
    /// Order expiry sweep
    pub order_expiry: String,
    /// OpenTimestamps submission
    pub ots_submit: String,
    /// OpenTimestamps proof upgrade
    pub ots_upgrade: String,
    /// Telemetry archival
    pub telemetry_archive: String,
    /// Rollout stage advance
    pub rollout_advance: String,
    /// Platform-wide pattern scan
    pub platform_scan: String,
    /// Compliance score refresh
    pub score_refresh: String,
    /// Promoted rule delivery retry
    pub rule_sync: String,
}

impl Default for WorkerCadences {
    fn default() -> Self {
        Self {
            order_expiry: "0 * * * * *".to_string(),
            ots_submit: "0 */10 * * * *".to_string(),
            ots_upgrade: "0 */30 * * * *".to_string(),
            telemetry_archive: "0 0 3 * * *".to_string(),
            rollout_advance: "0 */5 * * * *".to_string(),
            platform_scan: "0 0 * * * *".to_string(),
            score_refresh: "0 */15 * * * *".to_string(),
            rule_sync: "0 */5 * * * *".to_string(),
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection URL
    pub database_url: String,
    /// Maximum pool connections
    pub database_max_connections: u32,
    /// HTTP bind address
    pub bind_addr: SocketAddr,
    /// Hex-encoded 32-byte Ed25519 seed for the control-plane signing key.
    /// When absent an ephemeral key is generated (development only).
    pub signing_key_hex: Option<String>,
    /// Hex-encoded 32-byte master secret for credential wrapping.
    /// When absent an ephemeral secret is generated (development only).
    pub credentials_master_hex: Option<String>,
    /// Object store settings
    pub object_store: ObjectStoreConfig,
    /// OpenTimestamps settings
    pub ots: OtsConfig,
    /// Worker cadences
    pub cadences: WorkerCadences,
    /// Claim codes expire after this many minutes
    pub claim_code_ttl_minutes: i64,
    /// Telemetry rows older than this many days are archived
    pub telemetry_retention_days: i64,
}

impl Config {
    /// Load configuration from the environment
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("AEGIS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("AEGIS_DATABASE_URL".to_string()))?;

        let bind_addr = parse_var("AEGIS_BIND_ADDR", "0.0.0.0:8443")?;
        let database_max_connections = parse_var("AEGIS_DB_MAX_CONNECTIONS", "16")?;

        let object_store = ObjectStoreConfig {
            endpoint: env_or("AEGIS_OBJECT_STORE_ENDPOINT", "http://127.0.0.1:9000"),
            access_key: env_or("AEGIS_OBJECT_STORE_ACCESS_KEY", "aegis"),
            secret_key: env_or("AEGIS_OBJECT_STORE_SECRET_KEY", "aegis-secret"),
            region: env_or("AEGIS_OBJECT_STORE_REGION", "us-east-1"),
            presign_ttl_secs: parse_var("AEGIS_PRESIGN_TTL_SECS", "3600")?,
        };

        let ots = OtsConfig {
            enabled: parse_var("AEGIS_OTS_ENABLED", "false")?,
            calendars: env_or(
                "AEGIS_OTS_CALENDARS",
                "https://a.pool.opentimestamps.org,https://b.pool.opentimestamps.org",
            )
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
            min_age_secs: parse_var("AEGIS_OTS_MIN_AGE_SECS", "3600")?,
        };

        Ok(Self {
            database_url,
            database_max_connections,
            bind_addr,
            signing_key_hex: env::var("AEGIS_SIGNING_KEY").ok(),
            credentials_master_hex: env::var("AEGIS_CREDENTIALS_MASTER").ok(),
            object_store,
            ots,
            cadences: WorkerCadences::default(),
            claim_code_ttl_minutes: parse_var("AEGIS_CLAIM_CODE_TTL_MINUTES", "30")?,
            telemetry_retention_days: parse_var("AEGIS_TELEMETRY_RETENTION_DAYS", "90")?,
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> Result<T> {
    let raw = env_or(name, default);
    raw.parse().map_err(|_| ConfigError::Invalid {
        name: name.to_string(),
        value: raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cadences_parse() {
        use std::str::FromStr;
        let cadences = WorkerCadences::default();
        for expr in [
            &cadences.order_expiry,
            &cadences.ots_submit,
            &cadences.ots_upgrade,
            &cadences.telemetry_archive,
            &cadences.rollout_advance,
            &cadences.platform_scan,
            &cadences.score_refresh,
            &cadences.rule_sync,
        ] {
            assert!(cron::Schedule::from_str(expr).is_ok(), "bad cadence: {expr}");
        }
    }

    #[test]
    fn test_parse_var_default() {
        let ttl: u64 = parse_var("AEGIS_NOT_SET_EVER", "3600").unwrap();
        assert_eq!(ttl, 3600);
    }
}
