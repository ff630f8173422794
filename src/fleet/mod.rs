//! # Fleet Management
//!
//! Sites and the appliances deployed at them:
//!
//! - Site lifecycle: creation, healing tier, enabled frameworks
//! - Appliance provisioning via short-lived claim codes
//! - Heartbeat and lifecycle state (active / suspended)
//! - Versioned site credentials with monotonic delivery gating
//!
//! A site owns its appliances, its evidence chain, and its credential set.
//! Appliances register an Ed25519 public key at claim time; that key is the
//! only material evidence signatures are ever verified against.

use thiserror::Error;

pub mod models;
pub mod registry;

pub use models::{Appliance, ApplianceStatus, HealingTier, L2Mode, Partition, Site};
pub use registry::FleetManager;

/// Fleet error types
#[derive(Error, Debug)]
pub enum FleetError {
    /// Unknown site
    #[error("Unknown site: {0}")]
    UnknownSite(String),

    /// Unknown appliance
    #[error("Unknown appliance: {0}")]
    UnknownAppliance(String),

    /// Claim code missing, expired, or already used
    #[error("Invalid claim code")]
    InvalidClaimCode,

    /// The appliance is suspended
    #[error("Appliance suspended: {0}")]
    Suspended(String),

    /// A site id or appliance id is already taken
    #[error("Identifier already exists: {0}")]
    AlreadyExists(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Crypto error while sealing credentials
    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// Result type for fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;
