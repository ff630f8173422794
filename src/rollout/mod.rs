//! # Staged Fleet Updates
//!
//! Moves the fleet to a new OS release one stage at a time. Each stage
//! covers a percentage of the target set; appliances download the image,
//! reboot into the inactive partition inside the maintenance window, and
//! verify health. A stage whose failure ratio crosses the rollout's
//! threshold pauses the campaign and, with `auto_rollback`, sends failed
//! appliances back to their previous partition.

use thiserror::Error;

pub mod controller;
pub mod models;

pub use controller::RolloutController;
pub use models::{
    RolloutStage, RolloutStatus, UpdateRelease, UpdateRollout, UpdateStatus,
};

/// Rollout error types
#[derive(Error, Debug)]
pub enum RolloutError {
    /// Unknown release
    #[error("Unknown release: {0}")]
    UnknownRelease(String),

    /// Unknown rollout
    #[error("Unknown rollout: {0}")]
    UnknownRollout(uuid::Uuid),

    /// The rollout is not in a state the operation accepts
    #[error("Rollout {rollout_id} is {status}, expected {expected}")]
    InvalidState {
        /// Rollout id
        rollout_id: uuid::Uuid,
        /// Current status
        status: String,
        /// Required status
        expected: String,
    },

    /// The stage plan is empty or malformed
    #[error("Invalid stage plan: {0}")]
    InvalidStages(String),

    /// A release version string is not valid semver
    #[error("Invalid release version: {0}")]
    InvalidVersion(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Order creation failure
    #[error(transparent)]
    Orders(#[from] crate::orders::OrderError),

    /// Object store failure while presigning the release URL
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

/// Result type for rollout operations
pub type Result<T> = std::result::Result<T, RolloutError>;
