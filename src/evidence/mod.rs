//! # Evidence Chain Service
//!
//! Per-site, hash-linked, append-only logs of compliance check outcomes.
//! Every submitted bundle is assigned a dense 1-based chain position under
//! a per-site advisory lock, linked to its predecessor's hash, and verified
//! against the submitting appliance's registered Ed25519 key. A bundle
//! whose signature fails verification is still chained, flagged
//! `signature_valid = false`, so the chain stays dense and the rejection
//! is itself auditable.
//!
//! Evidence content (`checks`, `bundle_hash`, `signature`) is immutable at
//! the storage layer. Chain metadata may be rewritten only by the repair
//! procedure, which recomputes it as a whole unit.

use thiserror::Error;

pub mod chain;
pub mod mapping;
pub mod models;
pub mod ots;

pub use chain::{ChainBreak, ChainVerification, EvidenceChain, SubmissionOutcome};
pub use mapping::FrameworkMapper;
pub use models::{BundleSubmission, CheckResult, EvidenceBundle, OtsStatus};

/// The 64-character zero sentinel standing in for the predecessor hash of
/// a chain's first bundle.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Evidence error types
#[derive(Error, Debug)]
pub enum EvidenceError {
    /// Unknown site
    #[error("Unknown site: {0}")]
    UnknownSite(String),

    /// Unknown appliance
    #[error("Unknown appliance: {0}")]
    UnknownAppliance(String),

    /// A structural invariant does not hold (gap, duplicate position,
    /// broken link). Fatal to the request; surfaced unredacted to operators.
    #[error("Chain integrity violation for site {site_id}: {detail}")]
    IntegrityViolation {
        /// Site whose chain is affected
        site_id: String,
        /// Human-readable description
        detail: String,
    },

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Outbound calendar call failed; retried by the worker
    #[error("OpenTimestamps calendar error: {0}")]
    Calendar(String),
}

/// Result type for evidence operations
pub type Result<T> = std::result::Result<T, EvidenceError>;
