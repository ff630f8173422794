//! # Order Registry
//!
//! Signed commands for appliances and the fleet. Every order carries a
//! UUID nonce, an Ed25519 signature over its canonical payload, and a TTL;
//! agents verify the signature against the well-known control-plane key
//! before executing anything, so a compromised transport or a forged
//! control-plane surrogate cannot inject commands.
//!
//! Delivery is pull-based and unacknowledged dequeues are repeatable: a
//! pending order stays visible at every checkin until the agent reports a
//! result or the TTL lapses and the expiry sweep retires it.

use thiserror::Error;

pub mod models;
pub mod registry;

pub use models::{Order, OrderKind, OrderStatus, WireOrder};
pub use registry::{AckOutcome, NewOrder, OrderManager};

/// Order error types
#[derive(Error, Debug)]
pub enum OrderError {
    /// Unknown order id
    #[error("Unknown order: {0}")]
    UnknownOrder(uuid::Uuid),

    /// The order is not in the state the operation requires
    #[error("Order {0} is not pending")]
    NotPending(uuid::Uuid),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Signing failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// Result type for order operations
pub type Result<T> = std::result::Result<T, OrderError>;
