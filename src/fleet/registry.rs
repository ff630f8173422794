//! Fleet registry: site and appliance lifecycle over Postgres.

use chrono::{Duration, Utc};
use rand::RngCore;
use sqlx::{PgPool, Row};

use crate::crypto::credentials::CredentialMaster;

use super::models::{Appliance, ApplianceStatus, HealingTier, L2Mode, Partition, Site};
use super::{FleetError, Result};

/// Manages sites, appliances, claim codes, and site credentials
#[derive(Clone)]
pub struct FleetManager {
    pool: PgPool,
    claim_code_ttl_minutes: i64,
}

impl FleetManager {
    /// Create a new fleet manager
    pub fn new(pool: PgPool, claim_code_ttl_minutes: i64) -> Self {
        Self {
            pool,
            claim_code_ttl_minutes,
        }
    }

    // ========================================================================
    // Sites
    // ========================================================================

    /// Create a site
    pub async fn create_site(
        &self,
        site_id: &str,
        name: &str,
        org_id: Option<&str>,
        healing_tier: HealingTier,
    ) -> Result<Site> {
        let inserted = sqlx::query(
            "INSERT INTO sites (site_id, org_id, name, healing_tier)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (site_id) DO NOTHING",
        )
        .bind(site_id)
        .bind(org_id)
        .bind(name)
        .bind(healing_tier)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(FleetError::AlreadyExists(site_id.to_string()));
        }
        self.get_site(site_id).await
    }

    /// Fetch a site by id
    pub async fn get_site(&self, site_id: &str) -> Result<Site> {
        sqlx::query_as::<_, Site>(
            "SELECT site_id, org_id, name, healing_tier, frameworks, ots_enabled, created_at
             FROM sites WHERE site_id = $1",
        )
        .bind(site_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| FleetError::UnknownSite(site_id.to_string()))
    }

    /// Change a site's healing tier
    pub async fn set_healing_tier(&self, site_id: &str, tier: HealingTier) -> Result<()> {
        let updated = sqlx::query("UPDATE sites SET healing_tier = $2 WHERE site_id = $1")
            .bind(site_id)
            .bind(tier)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(FleetError::UnknownSite(site_id.to_string()));
        }
        Ok(())
    }

    /// Enable or disable OpenTimestamps anchoring for a site
    pub async fn set_ots_enabled(&self, site_id: &str, enabled: bool) -> Result<()> {
        let updated = sqlx::query("UPDATE sites SET ots_enabled = $2 WHERE site_id = $1")
            .bind(site_id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(FleetError::UnknownSite(site_id.to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // Claim codes and appliance provisioning
    // ========================================================================

    /// Mint a short-lived, single-use claim code for a site
    pub async fn create_claim_code(&self, site_id: &str) -> Result<String> {
        // Existence check so operators get UnknownSite instead of an FK error
        self.get_site(site_id).await?;

        let code = generate_token(16);
        let expires_at = Utc::now() + Duration::minutes(self.claim_code_ttl_minutes);

        sqlx::query(
            "INSERT INTO appliance_claim_codes (code, site_id, expires_at)
             VALUES ($1, $2, $3)",
        )
        .bind(&code)
        .bind(site_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(code)
    }

    /// Redeem a claim code, registering the appliance and its public key.
    ///
    /// Returns the new appliance row together with its checkin secret; the
    /// secret is handed to the appliance exactly once, here.
    pub async fn redeem_claim_code(
        &self,
        code: &str,
        appliance_id: &str,
        public_key_hex: &str,
    ) -> Result<Appliance> {
        let mut tx = self.pool.begin().await?;

        // Single-use: the conditional UPDATE is the claim. A concurrent
        // redeem of the same code sees zero rows and fails.
        let site_id: Option<String> = sqlx::query(
            "UPDATE appliance_claim_codes
             SET used_at = now(), used_by = $2
             WHERE code = $1 AND used_at IS NULL AND expires_at > now()
             RETURNING site_id",
        )
        .bind(code)
        .bind(appliance_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| r.get("site_id"));

        let site_id = site_id.ok_or(FleetError::InvalidClaimCode)?;

        let checkin_secret = generate_token(32);
        let inserted = sqlx::query(
            "INSERT INTO appliances (appliance_id, site_id, public_key, checkin_secret)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (appliance_id) DO NOTHING",
        )
        .bind(appliance_id)
        .bind(&site_id)
        .bind(public_key_hex)
        .bind(&checkin_secret)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(FleetError::AlreadyExists(appliance_id.to_string()));
        }

        tx.commit().await?;
        self.get_appliance(appliance_id).await
    }

    /// Fetch an appliance by id
    pub async fn get_appliance(&self, appliance_id: &str) -> Result<Appliance> {
        sqlx::query_as::<_, Appliance>(
            "SELECT appliance_id, site_id, status, agent_version, current_version,
                    active_partition, capability_tier, l2_mode, credentials_version,
                    credentials_provisioned_at, evidence_rejection_count,
                    last_evidence_accepted, last_evidence_rejection, public_key,
                    checkin_secret, last_seen, uptime_seconds, provisioned_at
             FROM appliances WHERE appliance_id = $1",
        )
        .bind(appliance_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| FleetError::UnknownAppliance(appliance_id.to_string()))
    }

    /// List appliances at a site
    pub async fn appliances_for_site(&self, site_id: &str) -> Result<Vec<Appliance>> {
        let rows = sqlx::query_as::<_, Appliance>(
            "SELECT appliance_id, site_id, status, agent_version, current_version,
                    active_partition, capability_tier, l2_mode, credentials_version,
                    credentials_provisioned_at, evidence_rejection_count,
                    last_evidence_accepted, last_evidence_rejection, public_key,
                    checkin_secret, last_seen, uptime_seconds, provisioned_at
             FROM appliances WHERE site_id = $1 ORDER BY appliance_id",
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Suspend an appliance; suspended appliances are refused at checkin
    pub async fn set_status(&self, appliance_id: &str, status: ApplianceStatus) -> Result<()> {
        let updated = sqlx::query("UPDATE appliances SET status = $2 WHERE appliance_id = $1")
            .bind(appliance_id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(FleetError::UnknownAppliance(appliance_id.to_string()));
        }
        Ok(())
    }

    /// Set an appliance's L2 mode
    pub async fn set_l2_mode(&self, appliance_id: &str, mode: L2Mode) -> Result<()> {
        let updated = sqlx::query("UPDATE appliances SET l2_mode = $2 WHERE appliance_id = $1")
            .bind(appliance_id)
            .bind(mode)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(FleetError::UnknownAppliance(appliance_id.to_string()));
        }
        Ok(())
    }

    /// Record a checkin heartbeat
    pub async fn record_heartbeat(
        &self,
        appliance_id: &str,
        agent_version: &str,
        current_version: Option<&str>,
        active_partition: Partition,
        uptime_seconds: Option<i64>,
        capability_tier: Option<i16>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE appliances
             SET last_seen = now(), agent_version = $2,
                 current_version = coalesce($3, current_version),
                 active_partition = $4, uptime_seconds = $5,
                 capability_tier = coalesce($6, capability_tier)
             WHERE appliance_id = $1",
        )
        .bind(appliance_id)
        .bind(agent_version)
        .bind(current_version)
        .bind(active_partition)
        .bind(uptime_seconds)
        .bind(capability_tier)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Site credentials
    // ========================================================================

    /// Store a new credential bundle for a site, advancing the version.
    ///
    /// The plaintext is sealed at rest under the credential master; the
    /// version is monotonic per site.
    pub async fn bump_site_credentials(
        &self,
        site_id: &str,
        master: &CredentialMaster,
        plaintext: &[u8],
    ) -> Result<i32> {
        self.get_site(site_id).await?;
        let ciphertext = master.seal_for_site(site_id, plaintext)?;

        let version: i32 = sqlx::query(
            "INSERT INTO site_credentials (site_id, version, ciphertext)
             SELECT $1, coalesce(max(version), 0) + 1, $2
             FROM site_credentials WHERE site_id = $1
             RETURNING version",
        )
        .bind(site_id)
        .bind(&ciphertext)
        .fetch_one(&self.pool)
        .await?
        .get("version");

        Ok(version)
    }

    /// Current (highest) credential version for a site, 0 when none stored
    pub async fn current_credentials_version(&self, site_id: &str) -> Result<i32> {
        let version: i32 = sqlx::query(
            "SELECT coalesce(max(version), 0) AS version
             FROM site_credentials WHERE site_id = $1",
        )
        .bind(site_id)
        .fetch_one(&self.pool)
        .await?
        .get("version");
        Ok(version)
    }

    /// Fetch the stored ciphertext for a site credential version
    pub async fn get_credentials(&self, site_id: &str, version: i32) -> Result<String> {
        let row = sqlx::query(
            "SELECT ciphertext FROM site_credentials
             WHERE site_id = $1 AND version = $2",
        )
        .bind(site_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.get("ciphertext"))
            .ok_or_else(|| FleetError::UnknownSite(site_id.to_string()))
    }

    /// Advance an appliance's acknowledged credential version.
    ///
    /// Conditional on the new version being strictly greater, so a replayed
    /// or out-of-order ack is a no-op. Returns whether the row advanced.
    pub async fn advance_credentials_version(
        &self,
        appliance_id: &str,
        version: i32,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE appliances
             SET credentials_version = $2, credentials_provisioned_at = now()
             WHERE appliance_id = $1 AND credentials_version < $2",
        )
        .bind(appliance_id)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }
}

/// Random URL-safe token of `bytes` entropy bytes, hex encoded
fn generate_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token_length_and_charset() {
        let token = generate_token(16);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_token_unique() {
        assert_ne!(generate_token(16), generate_token(16));
    }
}
