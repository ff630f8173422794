//! Credential bundle wrapping.
//!
//! Site credentials are stored encrypted at rest under the control-plane
//! master secret. At delivery time the bundle is decrypted and re-encrypted
//! per appliance: HKDF-SHA256 expands the master secret with the appliance
//! id as the info string, and the derived key encrypts with AES-256-GCM.
//! The ciphertext carries the 96-bit nonce as a prefix and is base64
//! encoded for the checkin response.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use super::{CryptoError, Result};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Master secret for credential wrapping, held by the crypto service.
pub struct CredentialMaster {
    secret: Vec<u8>,
}

impl Drop for CredentialMaster {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl CredentialMaster {
    /// Load from a hex-encoded 32-byte secret
    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let secret = hex::decode(secret_hex)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        if secret.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                secret.len()
            )));
        }
        Ok(Self { secret })
    }

    /// Generate an ephemeral secret (development and tests)
    pub fn generate() -> Self {
        let mut secret = vec![0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self { secret }
    }

    fn derive_key(&self, info: &str) -> [u8; KEY_LEN] {
        let hkdf = Hkdf::<Sha256>::new(None, &self.secret);
        let mut key = [0u8; KEY_LEN];
        hkdf.expand(info.as_bytes(), &mut key)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        key
    }

    /// Encrypt a credential bundle for storage at rest, keyed by site.
    pub fn seal_for_site(&self, site_id: &str, plaintext: &[u8]) -> Result<String> {
        self.seal(&format!("site:{site_id}"), plaintext)
    }

    /// Decrypt a credential bundle stored at rest.
    pub fn open_for_site(&self, site_id: &str, ciphertext_b64: &str) -> Result<Vec<u8>> {
        self.open(&format!("site:{site_id}"), ciphertext_b64)
    }

    /// Re-encrypt a credential bundle for one appliance's delivery.
    pub fn wrap_for_appliance(&self, appliance_id: &str, plaintext: &[u8]) -> Result<String> {
        self.seal(&format!("appliance:{appliance_id}"), plaintext)
    }

    /// Unwrap an appliance-targeted bundle (agent-side helper for tests).
    pub fn unwrap_for_appliance(
        &self,
        appliance_id: &str,
        ciphertext_b64: &str,
    ) -> Result<Vec<u8>> {
        self.open(&format!("appliance:{appliance_id}"), ciphertext_b64)
    }

    fn seal(&self, info: &str, plaintext: &[u8]) -> Result<String> {
        let mut key = self.derive_key(info);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CryptoError::CipherFailed(e.to_string()))?;
        key.zeroize();

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::CipherFailed(e.to_string()))?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(framed))
    }

    fn open(&self, info: &str, ciphertext_b64: &str) -> Result<Vec<u8>> {
        let framed = BASE64
            .decode(ciphertext_b64)
            .map_err(|e| CryptoError::CipherFailed(e.to_string()))?;
        if framed.len() < NONCE_LEN {
            return Err(CryptoError::CipherFailed("ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);

        let mut key = self.derive_key(info);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CryptoError::CipherFailed(e.to_string()))?;
        key.zeroize();

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::CipherFailed("authentication failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_seal_open_roundtrip() {
        let master = CredentialMaster::generate();
        let sealed = master.seal_for_site("clinic-1", b"smb://svc:pw@host").unwrap();
        let opened = master.open_for_site("clinic-1", &sealed).unwrap();
        assert_eq!(opened, b"smb://svc:pw@host");
    }

    #[test]
    fn test_appliance_wrap_is_appliance_specific() {
        let master = CredentialMaster::generate();
        let wrapped = master.wrap_for_appliance("ap-001", b"bundle").unwrap();
        assert!(master.unwrap_for_appliance("ap-002", &wrapped).is_err());
        assert_eq!(
            master.unwrap_for_appliance("ap-001", &wrapped).unwrap(),
            b"bundle"
        );
    }

    #[test]
    fn test_distinct_nonces_per_seal() {
        let master = CredentialMaster::generate();
        let a = master.wrap_for_appliance("ap-001", b"bundle").unwrap();
        let b = master.wrap_for_appliance("ap-001", b"bundle").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let master = CredentialMaster::generate();
        let sealed = master.seal_for_site("clinic-1", b"secret").unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(master.open_for_site("clinic-1", &tampered).is_err());
    }

    #[test]
    fn test_from_hex_rejects_short_secret() {
        assert!(CredentialMaster::from_hex("deadbeef").is_err());
    }
}
