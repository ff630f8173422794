//! # Checkin Dispatcher
//!
//! The single endpoint each appliance calls once per checkin cycle. Its
//! response is the sole control surface for that appliance: due orders,
//! conditionally delivered credentials, healing tier, L2 mode, and the
//! current rule-bundle descriptor.

use thiserror::Error;

pub mod dispatcher;

pub use dispatcher::{
    CheckinDispatcher, CheckinRequest, CheckinResponse, CredentialDelivery, RuleBundleDescriptor,
};

/// Checkin error types
#[derive(Error, Debug)]
pub enum CheckinError {
    /// Unknown appliance
    #[error("Unknown appliance: {0}")]
    UnknownAppliance(String),

    /// The appliance is suspended and must not receive orders
    #[error("Appliance suspended: {0}")]
    Suspended(String),

    /// Fleet layer failure
    #[error(transparent)]
    Fleet(#[from] crate::fleet::FleetError),

    /// Order layer failure
    #[error(transparent)]
    Orders(#[from] crate::orders::OrderError),

    /// Credential unwrap or rewrap failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    /// Object store failure while presigning the rule bundle URL
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for checkin operations
pub type Result<T> = std::result::Result<T, CheckinError>;
