//! Rule bundle publication.
//!
//! Packages the enabled rule set for a healing tier as one YAML document,
//! uploads it to the `rule-bundles` bucket, signs its hash with the
//! control-plane key, and records a new monotonic bundle version. The
//! checkin dispatcher advertises the latest version per tier so lagging
//! agents pull it.

use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::signing::ControlPlaneSigner;
use crate::fleet::HealingTier;
use crate::storage::{buckets, ObjectStore};

use super::rules::RuleStore;
use super::Result;

/// Builds and publishes per-tier rule bundles
#[derive(Clone)]
pub struct RuleBundlePublisher {
    pool: PgPool,
    rules: RuleStore,
    store: Arc<dyn ObjectStore>,
}

impl RuleBundlePublisher {
    /// Create a new publisher
    pub fn new(pool: PgPool, rules: RuleStore, store: Arc<dyn ObjectStore>) -> Self {
        Self { pool, rules, store }
    }

    /// Publish the current rule set for a tier. Returns the new bundle
    /// version.
    pub async fn publish(&self, tier: HealingTier) -> Result<i64> {
        let rules = self.rules.list_for_tier(tier).await?;

        let doc = json!({
            "tier": tier,
            "rules": rules.iter().map(|r| json!({
                "rule_id": r.rule_id,
                "incident_pattern": r.incident_pattern,
                "runbook_id": r.runbook_id,
                "confidence": r.confidence,
                "source": r.source,
            })).collect::<Vec<_>>(),
        });
        let yaml = serde_yaml::to_string(&doc)?;

        let sha256 = hex::encode(Sha256::digest(yaml.as_bytes()));
        let signature = ControlPlaneSigner::global()?.sign_hex(sha256.as_bytes());

        let tier_key = match tier {
            HealingTier::Standard => "standard",
            HealingTier::FullCoverage => "full_coverage",
        };
        let object_key = format!("{tier_key}/{}.yaml", Uuid::new_v4());

        // Upload before recording; a crash between the two leaves only an
        // orphaned object, never a dangling version.
        self.store
            .put(buckets::RULE_BUNDLES, &object_key, yaml.as_bytes())
            .await?;

        let version: i64 = sqlx::query(
            "INSERT INTO rule_bundles (healing_tier, object_key, sha256, signature, rule_count)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING bundle_version",
        )
        .bind(tier)
        .bind(&object_key)
        .bind(&sha256)
        .bind(&signature)
        .bind(rules.len() as i32)
        .fetch_one(&self.pool)
        .await?
        .get("bundle_version");

        log::info!(
            "Published rule bundle v{version} for {tier_key} ({} rules)",
            rules.len()
        );
        Ok(version)
    }

    /// Publish both tiers; used after promotions and revocations land.
    pub async fn publish_all(&self) -> Result<(i64, i64)> {
        let standard = self.publish(HealingTier::Standard).await?;
        let full = self.publish(HealingTier::FullCoverage).await?;
        Ok((standard, full))
    }
}
