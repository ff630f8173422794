//! # AEGIS - HIPAA Compliance Fleet Control Plane
//!
//! The central control plane for a fleet of on-premises compliance
//! appliances. Appliances check in on a fixed cycle, pull cryptographically
//! signed orders, submit hash-chained evidence bundles and execution
//! telemetry, and receive promoted remediation rules and staged updates.
//!
//! ## Architecture
//!
//! - `config`: Environment-driven configuration
//! - `database`: Connection pool and linear schema migrations
//! - `crypto`: Canonical JSON, Ed25519 signing, credential wrapping
//! - `fleet`: Sites, appliances, provisioning, credential versioning
//! - `orders`: Signed order registry with nonce/TTL protection
//! - `checkin`: Per-cycle appliance checkin dispatcher
//! - `evidence`: Per-site hash-linked evidence chains and framework mapping
//! - `telemetry`: Execution telemetry ingest and pattern aggregation
//! - `learning`: L1 rule store and L2-to-L1 promotion pipeline
//! - `rollout`: Staged fleet update controller
//! - `storage`: Object-store abstraction for artifacts and rule bundles
//! - `api`: HTTP surface for appliances, partners, and operators
//! - `workers`: Background job scheduler

#![warn(missing_docs)]
#![warn(clippy::all)]

// Configuration
pub mod config;

// Database pool and migrations
pub mod database;

// Cryptographic primitives
pub mod crypto;

// Sites and appliances
pub mod fleet;

// Order registry and signing
pub mod orders;

// Checkin dispatcher
pub mod checkin;

// Evidence chain service
pub mod evidence;

// Telemetry ingest and aggregation
pub mod telemetry;

// Learning flywheel
pub mod learning;

// Fleet update rollouts
pub mod rollout;

// Object storage
pub mod storage;

// HTTP API
pub mod api;

// Background workers
pub mod workers;

// Re-export commonly used types
pub use config::Config;
pub use crypto::signing::ControlPlaneSigner;
pub use database::Database;

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
