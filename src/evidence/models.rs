//! Evidence bundle data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::crypto::canonical::{canonical_json, canonical_timestamp};

/// Outcome of one compliance check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckResult {
    /// Check passed
    Pass,
    /// Check failed
    Fail,
    /// Check passed with caveats
    Warn,
}

/// OpenTimestamps anchoring progress for a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OtsStatus {
    /// Anchoring disabled for the site
    None,
    /// Queued for calendar submission
    Pending,
    /// Calendar proof held
    Anchored,
    /// Bitcoin-anchored proof held
    Verified,
}

/// One element of a site's evidence chain
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EvidenceBundle {
    /// Bundle identifier (agent-assigned)
    pub bundle_id: String,
    /// Owning site
    pub site_id: String,
    /// Submitting appliance
    pub appliance_id: String,
    /// Primary check type
    pub check_type: String,
    /// Overall outcome
    pub check_result: CheckResult,
    /// Check payload (immutable)
    pub checks: Value,
    /// Optional human summary
    pub summary: Option<String>,
    /// SHA-256 over the canonical bundle content
    pub bundle_hash: String,
    /// Predecessor bundle id (absent at genesis)
    pub prev_bundle_id: Option<String>,
    /// Predecessor bundle hash, or the 64-zero sentinel at genesis
    pub prev_hash: String,
    /// Dense 1-based position within the site chain
    pub chain_position: i64,
    /// `SHA256_HEX(bundle_hash ":" prev_hash ":" chain_position)`
    pub chain_hash: String,
    /// Hex Ed25519 signature produced by the appliance
    pub signature: String,
    /// Exact bytes the appliance signed, stored verbatim
    pub signed_data: String,
    /// Whether the signature verified at submit time
    pub signature_valid: bool,
    /// When the agent ran the check
    pub checked_at: DateTime<Utc>,
    /// NTP offset data reported alongside the check
    pub ntp_verification: Option<Value>,
    /// Anchoring progress
    pub ots_status: OtsStatus,
    /// When the hash was submitted to a calendar
    pub ots_submitted_at: Option<DateTime<Utc>>,
    /// When a calendar proof was stored
    pub ots_anchored_at: Option<DateTime<Utc>>,
    /// Most recent anchoring failure, human-readable
    pub ots_error: Option<String>,
    /// When the control plane accepted the bundle
    pub submitted_at: DateTime<Utc>,
}

/// An inbound bundle submission from an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleSubmission {
    /// Agent-assigned bundle id
    pub bundle_id: String,
    /// Submitting site
    pub site_id: String,
    /// Submitting appliance
    pub appliance_id: String,
    /// Primary check type
    pub check_type: String,
    /// Overall outcome
    pub check_result: CheckResult,
    /// Check payload
    pub checks: Value,
    /// Optional human summary
    #[serde(default)]
    pub summary: Option<String>,
    /// Exact bytes the agent signed
    pub signed_data: String,
    /// Hex Ed25519 signature over `signed_data`
    pub signature: String,
    /// When the agent ran the check
    pub checked_at: DateTime<Utc>,
    /// NTP offset data
    #[serde(default)]
    pub ntp_verification: Option<Value>,
}

impl BundleSubmission {
    /// SHA-256 over the canonical bundle content.
    ///
    /// Content covers identity, outcome, and the checks payload; chain
    /// metadata is excluded so the hash is position-independent.
    pub fn content_hash(&self) -> String {
        let content = serde_json::json!({
            "bundle_id": self.bundle_id,
            "site_id": self.site_id,
            "appliance_id": self.appliance_id,
            "check_type": self.check_type,
            "check_result": self.check_result,
            "checks": self.checks,
            "summary": self.summary,
            "checked_at": canonical_timestamp(self.checked_at),
        });
        hex::encode(Sha256::digest(canonical_json(&content).as_bytes()))
    }
}

/// The chain hash binding a bundle to its position and predecessor.
pub fn chain_hash(bundle_hash: &str, prev_hash: &str, position: i64) -> String {
    let preimage = format!("{bundle_hash}:{prev_hash}:{position}");
    hex::encode(Sha256::digest(preimage.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission() -> BundleSubmission {
        BundleSubmission {
            bundle_id: "b-001".to_string(),
            site_id: "clinic-1".to_string(),
            appliance_id: "ap-001".to_string(),
            check_type: "disk_encryption".to_string(),
            check_result: CheckResult::Pass,
            checks: json!([{"check_type": "disk_encryption", "status": "pass"}]),
            summary: None,
            signed_data: "{}".to_string(),
            signature: "00".to_string(),
            checked_at: DateTime::parse_from_rfc3339("2026-02-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            ntp_verification: None,
        }
    }

    #[test]
    fn test_content_hash_stable() {
        assert_eq!(submission().content_hash(), submission().content_hash());
    }

    #[test]
    fn test_content_hash_sensitive_to_checks() {
        let mut changed = submission();
        changed.checks = json!([{"check_type": "disk_encryption", "status": "fail"}]);
        assert_ne!(submission().content_hash(), changed.content_hash());
    }

    #[test]
    fn test_content_hash_ignores_signature() {
        let mut changed = submission();
        changed.signature = "ff".to_string();
        assert_eq!(submission().content_hash(), changed.content_hash());
    }

    #[test]
    fn test_chain_hash_formula() {
        let expected = hex::encode(Sha256::digest(b"aa:bb:3"));
        assert_eq!(chain_hash("aa", "bb", 3), expected);
    }
}
