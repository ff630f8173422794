//! # Background Workers
//!
//! Cron-scheduled jobs driving everything that is not request-shaped:
//! order expiry, OpenTimestamps submission and upgrade, telemetry
//! archival, rollout stage advance, platform pattern scans, compliance
//! score refresh, and promoted rule delivery retries. Each job runs on
//! its own cadence with exponential backoff after consecutive failures.

use thiserror::Error;

pub mod jobs;
pub mod scheduler;

pub use scheduler::{Job, Scheduler};

/// Worker error types
#[derive(Error, Debug)]
pub enum WorkerError {
    /// A cadence expression failed to parse
    #[error("Invalid cron expression '{expr}': {detail}")]
    InvalidCronExpression {
        /// The offending expression
        expr: String,
        /// Parser detail
        detail: String,
    },
}

/// Result type for worker registration
pub type Result<T> = std::result::Result<T, WorkerError>;
