//! Fleet data model: sites and appliances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-site healing policy tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HealingTier {
    /// Core rule set only
    Standard,
    /// Full rule set including promoted rules
    FullCoverage,
}

/// Appliance lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApplianceStatus {
    /// Checking in normally
    Active,
    /// Blocked from checkin until resumed
    Suspended,
}

/// LLM-planned (L2) remediation mode for an appliance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum L2Mode {
    /// L2 plans execute without operator review
    Auto,
    /// L2 plans wait for operator approval
    Manual,
    /// L2 disabled; failures escalate straight to L3
    Disabled,
}

/// A/B partition an appliance boots from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum Partition {
    /// Partition A
    A,
    /// Partition B
    B,
}

impl Partition {
    /// The partition an appliance flips to on update reboot
    pub fn other(self) -> Self {
        match self {
            Partition::A => Partition::B,
            Partition::B => Partition::A,
        }
    }
}

/// A customer location owning appliances, an evidence chain, and credentials
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Site {
    /// Opaque site identifier
    pub site_id: String,
    /// Owning client organization, if any
    pub org_id: Option<String>,
    /// Display name
    pub name: String,
    /// Healing policy tier
    pub healing_tier: HealingTier,
    /// Enabled compliance frameworks
    pub frameworks: Vec<String>,
    /// Whether evidence bundles are anchored via OpenTimestamps
    pub ots_enabled: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// An on-prem device under control-plane management
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Appliance {
    /// Opaque appliance identifier
    pub appliance_id: String,
    /// Owning site
    pub site_id: String,
    /// Lifecycle state
    pub status: ApplianceStatus,
    /// Agent software version reported at last checkin
    pub agent_version: Option<String>,
    /// OS image version currently booted
    pub current_version: Option<String>,
    /// Partition currently booted
    pub active_partition: Partition,
    /// Hardware capability tier (0..=2)
    pub capability_tier: i16,
    /// L2 remediation mode
    pub l2_mode: L2Mode,
    /// Credentials version the appliance has acknowledged
    pub credentials_version: i32,
    /// When credentials were last provisioned to this appliance
    pub credentials_provisioned_at: Option<DateTime<Utc>>,
    /// Consecutive evidence signature rejections
    pub evidence_rejection_count: i32,
    /// Last accepted evidence bundle
    pub last_evidence_accepted: Option<DateTime<Utc>>,
    /// Last rejected evidence bundle
    pub last_evidence_rejection: Option<DateTime<Utc>>,
    /// Hex-encoded Ed25519 public key registered at claim time
    pub public_key: String,
    /// Shared secret for checkin body HMAC
    #[serde(skip_serializing)]
    pub checkin_secret: String,
    /// Last heartbeat
    pub last_seen: Option<DateTime<Utc>>,
    /// Uptime reported at last checkin
    pub uptime_seconds: Option<i64>,
    /// When the appliance was claimed
    pub provisioned_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_other_flips() {
        assert_eq!(Partition::A.other(), Partition::B);
        assert_eq!(Partition::B.other(), Partition::A);
    }

    #[test]
    fn test_healing_tier_serde_snake_case() {
        let json = serde_json::to_string(&HealingTier::FullCoverage).unwrap();
        assert_eq!(json, "\"full_coverage\"");
    }

    #[test]
    fn test_l2_mode_roundtrip() {
        for mode in [L2Mode::Auto, L2Mode::Manual, L2Mode::Disabled] {
            let json = serde_json::to_string(&mode).unwrap();
            let back: L2Mode = serde_json::from_str(&json).unwrap();
            assert_eq!(back, mode);
        }
    }
}
