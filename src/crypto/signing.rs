//! Ed25519 signing and verification.
//!
//! The control plane holds one signing key for outbound orders and rule
//! bundles. Appliances hold their own keys; the control plane stores only
//! their public halves and verifies evidence signatures against them.

use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
};
use once_cell::sync::OnceCell;
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use super::{CryptoError, Result};

static GLOBAL_SIGNER: OnceCell<ControlPlaneSigner> = OnceCell::new();

/// The control-plane signing key.
///
/// Process-wide singleton with an explicit lifecycle: loaded from a secrets
/// source at boot via [`ControlPlaneSigner::init_global`], read-only
/// afterwards. Rotation is an out-of-band deployment.
#[derive(ZeroizeOnDrop)]
pub struct ControlPlaneSigner {
    signing_key: SigningKey,
    #[zeroize(skip)]
    verifying_key: VerifyingKey,
}

impl ControlPlaneSigner {
    /// Generate an ephemeral key pair (development and tests)
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let signing_key = SigningKey::generate(&mut rng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Load from a 32-byte seed
    pub fn from_seed_bytes(bytes: &[u8]) -> Result<Self> {
        let seed: [u8; SECRET_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Load from a hex-encoded 32-byte seed
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self> {
        let bytes =
            hex::decode(seed_hex).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::from_seed_bytes(&bytes)
    }

    /// Install the process-wide signer. Returns an error if already set.
    pub fn init_global(signer: ControlPlaneSigner) -> Result<()> {
        GLOBAL_SIGNER
            .set(signer)
            .map_err(|_| CryptoError::InvalidKey("signer already initialized".to_string()))
    }

    /// Access the process-wide signer
    pub fn global() -> Result<&'static ControlPlaneSigner> {
        GLOBAL_SIGNER.get().ok_or(CryptoError::SignerNotInitialized)
    }

    /// Sign a payload, returning the signature hex-encoded
    pub fn sign_hex(&self, payload: &[u8]) -> String {
        hex::encode(self.signing_key.sign(payload).to_bytes())
    }

    /// The public key, hex-encoded, as published to agents
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.to_bytes())
    }

    /// Verify a hex signature against this key pair's public half
    pub fn verify_own_hex(&self, payload: &[u8], signature_hex: &str) -> Result<()> {
        verify_hex(&self.public_key_hex(), payload, signature_hex)
    }
}

/// Verify an Ed25519 signature given a hex public key and hex signature.
///
/// Used for appliance evidence signatures, where the public key comes from
/// the appliance row registered at claim time.
pub fn verify_hex(public_key_hex: &str, payload: &[u8], signature_hex: &str) -> Result<()> {
    let key_bytes = hex::decode(public_key_hex)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let key_array: [u8; PUBLIC_KEY_LENGTH] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", key_bytes.len())))?;
    let verifying_key = VerifyingKey::from_bytes(&key_array)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let sig_bytes = hex::decode(signature_hex)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

    verifying_key
        .verify(payload, &signature)
        .map_err(|_| CryptoError::VerificationFailed)
}

/// Generate an appliance key pair, returning `(secret_hex, public_hex)`.
///
/// Only used by provisioning tooling and tests; production appliances
/// generate their keys locally and register the public half at claim time.
pub fn generate_keypair_hex() -> (String, String) {
    let mut rng = OsRng;
    let signing_key = SigningKey::generate(&mut rng);
    (
        hex::encode(signing_key.to_bytes()),
        hex::encode(signing_key.verifying_key().to_bytes()),
    )
}

/// Sign a payload with a hex-encoded seed (agent-side helper for tests)
pub fn sign_with_seed_hex(seed_hex: &str, payload: &[u8]) -> Result<String> {
    let signer = ControlPlaneSigner::from_seed_hex(seed_hex)?;
    Ok(signer.sign_hex(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let signer = ControlPlaneSigner::generate();
        let sig = signer.sign_hex(b"order payload");
        assert!(signer.verify_own_hex(b"order payload", &sig).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let signer = ControlPlaneSigner::generate();
        let sig = signer.sign_hex(b"order payload");
        assert!(matches!(
            signer.verify_own_hex(b"order payload!", &sig),
            Err(CryptoError::VerificationFailed)
        ));
    }

    #[test]
    fn test_flipped_signature_byte_rejected() {
        let signer = ControlPlaneSigner::generate();
        let sig = signer.sign_hex(b"payload");
        let mut bytes = hex::decode(&sig).unwrap();
        bytes[0] ^= 0x01;
        let bad = hex::encode(bytes);
        assert!(signer.verify_own_hex(b"payload", &bad).is_err());
    }

    #[test]
    fn test_seed_hex_roundtrip() {
        let (secret, public) = generate_keypair_hex();
        let sig = sign_with_seed_hex(&secret, b"evidence").unwrap();
        assert!(verify_hex(&public, b"evidence", &sig).is_ok());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (secret, _) = generate_keypair_hex();
        let (_, other_public) = generate_keypair_hex();
        let sig = sign_with_seed_hex(&secret, b"evidence").unwrap();
        assert!(verify_hex(&other_public, b"evidence", &sig).is_err());
    }

    #[test]
    fn test_invalid_key_encoding() {
        assert!(matches!(
            verify_hex("not-hex", b"x", "00"),
            Err(CryptoError::InvalidKey(_))
        ));
    }
}
