//! # Learning Flywheel
//!
//! Promotes recurring, successful L2 healing patterns into deterministic
//! L1 rules:
//!
//! - `rules`: the L1 rule store and runbook id reconciliation
//! - `promotion`: candidate emission, partner approval, platform-wide
//!   auto-promotion, and revocation
//! - `deployment`: per-appliance rule sync via signed orders
//! - `bundles`: building and publishing the signed per-tier rule bundle
//!   advertised at checkin

use thiserror::Error;

pub mod bundles;
pub mod deployment;
pub mod promotion;
pub mod rules;

pub use bundles::RuleBundlePublisher;
pub use deployment::RuleSyncService;
pub use promotion::{ApprovalStatus, PromotionCandidate, PromotionController};
pub use rules::{L1Rule, RuleSource, RuleStore};

/// Learning error types
#[derive(Error, Debug)]
pub enum LearningError {
    /// Unknown candidate
    #[error("Unknown promotion candidate: {0}")]
    UnknownCandidate(uuid::Uuid),

    /// Unknown rule
    #[error("Unknown rule: {0}")]
    UnknownRule(String),

    /// The candidate is not in a state the operation accepts
    #[error("Candidate {candidate_id} is {status}, expected {expected}")]
    InvalidState {
        /// Candidate id
        candidate_id: uuid::Uuid,
        /// Current status
        status: String,
        /// Status the operation requires
        expected: String,
    },

    /// The candidate has no recommended action to bind a rule to
    #[error("Candidate {0} has no recommended runbook")]
    NoRecommendedAction(uuid::Uuid),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Rule serialization failure
    #[error("Rule serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    /// Order creation failure during rule sync
    #[error(transparent)]
    Orders(#[from] crate::orders::OrderError),

    /// Object store failure during bundle publication
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// Signing failure during bundle publication
    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// Result type for learning operations
pub type Result<T> = std::result::Result<T, LearningError>;
