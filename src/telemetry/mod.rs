//! # Telemetry Ingest and Pattern Aggregation
//!
//! Turns streams of per-execution runbook records into per-site and
//! cross-client pattern aggregates. Each record lands in one short
//! transaction that also bumps the matching L1 rule counters and the
//! `ON CONFLICT DO UPDATE` aggregates, so the observable counters are
//! indistinguishable from the historical trigger-maintained ones.
//!
//! Records are append-only; a daily job rolls rows older than the
//! retention window into `telemetry_archive`.

use thiserror::Error;

pub mod archive;
pub mod ingest;
pub mod models;

pub use archive::TelemetryArchiver;
pub use ingest::TelemetryIngest;
pub use models::{promotion_eligible, ResolutionLevel, TelemetryRecord};

/// Telemetry error types
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Unknown site
    #[error("Unknown site: {0}")]
    UnknownSite(String),

    /// Unknown appliance
    #[error("Unknown appliance: {0}")]
    UnknownAppliance(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;
