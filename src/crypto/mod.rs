//! # Cryptographic Primitives
//!
//! Signing and verification for the control plane:
//!
//! - **Canonical JSON** (`canonical`): the deterministic byte format both
//!   order payloads and evidence content are hashed and signed over
//! - **Control-plane signing** (`signing`): the process-wide Ed25519 signer
//!   and the verifier for appliance-held keys
//! - **Credential wrapping** (`credentials`): HKDF-derived per-appliance
//!   AES-256-GCM envelopes for site credential delivery
//!
//! ## Security Considerations
//!
//! - The control-plane private key is loaded once at boot and never rotated
//!   at runtime; rotation is an out-of-band deployment
//! - Private key material is zeroized on drop
//! - Appliance signatures are verified over the exact `signed_data` bytes
//!   the agent produced, never over a re-serialization

use thiserror::Error;

pub mod canonical;
pub mod credentials;
pub mod signing;

/// Crypto error types
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Key material is malformed
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// A signature failed to parse
    #[error("Invalid signature encoding: {0}")]
    InvalidSignature(String),

    /// Verification failed
    #[error("Signature verification failed")]
    VerificationFailed,

    /// Encryption or decryption failed
    #[error("Cipher operation failed: {0}")]
    CipherFailed(String),

    /// The signer singleton was used before initialization
    #[error("Control-plane signer not initialized")]
    SignerNotInitialized,
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
