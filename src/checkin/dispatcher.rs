//! Checkin request handling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::sync::Arc;

use crate::crypto::credentials::CredentialMaster;
use crate::fleet::{ApplianceStatus, FleetManager, HealingTier, L2Mode, Partition};
use crate::orders::{OrderManager, WireOrder};
use crate::storage::{buckets, ObjectStore};

use super::{CheckinError, Result};

/// One appliance's per-cycle checkin request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinRequest {
    /// Appliance identifier
    pub appliance_id: String,
    /// Agent software version
    pub agent_version: String,
    /// OS image version currently booted, when the agent knows it
    #[serde(default)]
    pub current_version: Option<String>,
    /// Partition currently booted
    pub active_partition: Partition,
    /// Credentials version the appliance holds
    pub credentials_version: i32,
    /// Seconds since boot
    #[serde(default)]
    pub uptime_s: Option<i64>,
    /// Hardware capability tier
    #[serde(default)]
    pub capability_tier: Option<i16>,
    /// Platform identifier (e.g. `windows`, `linux`)
    #[serde(default)]
    pub platform: Option<String>,
}

/// Credential bundle delivered when the appliance lags the site version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialDelivery {
    /// Site credential version being delivered
    pub version: i32,
    /// Per-appliance wrapped bundle, base64
    pub ciphertext_b64: String,
}

/// Rule bundle advertised at checkin so lagging agents pull it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleBundleDescriptor {
    /// Monotonic bundle version
    pub version: i64,
    /// Presigned download URL
    pub url: String,
    /// SHA-256 of the bundle content
    pub sha256: String,
    /// Control-plane signature over the bundle content hash
    pub signature: String,
}

/// The full checkin response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinResponse {
    /// Due orders, verbatim with their signatures
    pub orders: Vec<WireOrder>,
    /// Credentials, present iff the appliance version lags the site version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialDelivery>,
    /// Site healing tier the agent must respect
    pub healing_tier: HealingTier,
    /// Appliance L2 mode the agent must respect
    pub l2_mode: L2Mode,
    /// Current rule bundle for the site's tier, when one is published
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_bundle: Option<RuleBundleDescriptor>,
    /// Server clock, for agent drift detection
    pub time_sync_hint: DateTime<Utc>,
}

/// Assembles checkin responses
#[derive(Clone)]
pub struct CheckinDispatcher {
    pool: PgPool,
    fleet: FleetManager,
    orders: OrderManager,
    master: Arc<CredentialMaster>,
    store: Arc<dyn ObjectStore>,
}

impl CheckinDispatcher {
    /// Create a new dispatcher
    pub fn new(
        pool: PgPool,
        fleet: FleetManager,
        orders: OrderManager,
        master: Arc<CredentialMaster>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            pool,
            fleet,
            orders,
            master,
            store,
        }
    }

    /// Handle one checkin cycle. The caller has already authenticated the
    /// request body against the appliance's checkin secret.
    pub async fn dispatch(&self, req: &CheckinRequest) -> Result<CheckinResponse> {
        let appliance = self.fleet.get_appliance(&req.appliance_id).await?;
        if appliance.status == ApplianceStatus::Suspended {
            return Err(CheckinError::Suspended(req.appliance_id.clone()));
        }
        let site = self.fleet.get_site(&appliance.site_id).await?;

        self.fleet
            .record_heartbeat(
                &req.appliance_id,
                &req.agent_version,
                req.current_version.as_deref(),
                req.active_partition,
                req.uptime_s,
                req.capability_tier,
            )
            .await?;

        let orders = self
            .orders
            .dequeue_for_appliance(&req.appliance_id, &req.agent_version)
            .await?
            .into_iter()
            .map(WireOrder::from)
            .collect();

        let credentials = self.credential_delivery(&appliance.site_id, &appliance.appliance_id, appliance.credentials_version).await?;
        let rule_bundle = self.current_rule_bundle(site.healing_tier).await?;

        Ok(CheckinResponse {
            orders,
            credentials,
            healing_tier: site.healing_tier,
            l2_mode: appliance.l2_mode,
            rule_bundle,
            time_sync_hint: Utc::now(),
        })
    }

    /// Record the appliance's confirmation that it stored delivered
    /// credentials, advancing its acknowledged version. Idempotent: a
    /// replayed ack for an older version changes nothing.
    pub async fn credentials_ack(&self, appliance_id: &str, version: i32) -> Result<bool> {
        Ok(self
            .fleet
            .advance_credentials_version(appliance_id, version)
            .await?)
    }

    /// Deliver credentials iff the site version is ahead of the appliance.
    async fn credential_delivery(
        &self,
        site_id: &str,
        appliance_id: &str,
        appliance_version: i32,
    ) -> Result<Option<CredentialDelivery>> {
        let site_version = self.fleet.current_credentials_version(site_id).await?;
        if site_version <= appliance_version {
            return Ok(None);
        }

        let at_rest = self.fleet.get_credentials(site_id, site_version).await?;
        let plaintext = self.master.open_for_site(site_id, &at_rest)?;
        let wrapped = self.master.wrap_for_appliance(appliance_id, &plaintext)?;

        Ok(Some(CredentialDelivery {
            version: site_version,
            ciphertext_b64: wrapped,
        }))
    }

    /// The most recent published rule bundle for a healing tier.
    async fn current_rule_bundle(
        &self,
        tier: HealingTier,
    ) -> Result<Option<RuleBundleDescriptor>> {
        let row = sqlx::query(
            "SELECT bundle_version, object_key, sha256, signature
             FROM rule_bundles WHERE healing_tier = $1
             ORDER BY bundle_version DESC LIMIT 1",
        )
        .bind(tier)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let object_key: String = row.get("object_key");
        let url = self.store.presign_get(buckets::RULE_BUNDLES, &object_key).await?;

        Ok(Some(RuleBundleDescriptor {
            version: row.get("bundle_version"),
            url,
            sha256: row.get("sha256"),
            signature: row.get("signature"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_accepts_minimal_body() {
        let req: CheckinRequest = serde_json::from_str(
            r#"{"appliance_id":"ap-1","agent_version":"1.4.2",
                "active_partition":"A","credentials_version":3}"#,
        )
        .unwrap();
        assert_eq!(req.appliance_id, "ap-1");
        assert_eq!(req.active_partition, Partition::A);
        assert!(req.uptime_s.is_none());
    }

    #[test]
    fn test_response_omits_absent_credentials() {
        let resp = CheckinResponse {
            orders: vec![],
            credentials: None,
            healing_tier: HealingTier::Standard,
            l2_mode: L2Mode::Manual,
            rule_bundle: None,
            time_sync_hint: Utc::now(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("credentials").is_none());
        assert!(json.get("rule_bundle").is_none());
    }
}
