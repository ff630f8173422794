//! Promotion controller.
//!
//! Candidate state machine:
//!
//! ```text
//! not_submitted -> pending -> approved -> deployed
//!                         \-> rejected
//!                         \-> client_forwarded -> pending
//! ```
//!
//! Site-scoped candidates require partner approval; cross-client platform
//! patterns auto-promote once enough distinct organizations report the
//! same successful pattern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{LearningError, Result};

/// Auto-promotion thresholds for cross-client patterns: distinct orgs
pub const PLATFORM_MIN_ORGS: i32 = 5;
/// Auto-promotion thresholds for cross-client patterns: total occurrences
pub const PLATFORM_MIN_TOTAL: i64 = 20;
/// Auto-promotion thresholds for cross-client patterns: success rate
pub const PLATFORM_MIN_SUCCESS_RATE: f64 = 0.90;

/// Candidate approval status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Created but not yet surfaced to the partner
    NotSubmitted,
    /// Awaiting partner review
    Pending,
    /// Approved; rule generated
    Approved,
    /// Rejected by the partner
    Rejected,
    /// Endorsed by the client, on its way back to partner review
    ClientForwarded,
    /// Rule generated and synced to the site's appliances
    Deployed,
}

impl ApprovalStatus {
    fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::NotSubmitted => "not_submitted",
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::ClientForwarded => "client_forwarded",
            ApprovalStatus::Deployed => "deployed",
        }
    }
}

/// One approval unit: a site pattern proposed for promotion
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PromotionCandidate {
    /// Candidate id
    pub candidate_id: Uuid,
    /// Site whose pattern this is
    pub site_id: String,
    /// Aggregation key
    pub pattern_signature: String,
    /// Approval state
    pub approval_status: ApprovalStatus,
    /// Runbook the pattern resolves with
    pub recommended_action: Option<String>,
    /// Occurrences at emission time
    pub occurrences: i64,
    /// Success rate at emission time
    pub success_rate: f64,
    /// Emission timestamp
    pub created_at: DateTime<Utc>,
    /// Review timestamp
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Reviewing partner
    pub reviewed_by: Option<String>,
    /// Most recent processing error, shown in the partner UI
    pub last_error: Option<String>,
}

const CANDIDATE_COLUMNS: &str =
    "candidate_id, site_id, pattern_signature, approval_status, recommended_action,
     occurrences, success_rate, created_at, reviewed_at, reviewed_by, last_error";

/// The rule id prefix for partner-approved promotions
pub fn promoted_rule_id(pattern_signature: &str) -> String {
    let digest = Sha256::digest(pattern_signature.as_bytes());
    format!("L1-PROMOTED-{}", &hex::encode(digest)[..12])
}

/// The rule id prefix for platform auto-promotions
pub fn platform_rule_id(pattern_key: &str) -> String {
    let digest = Sha256::digest(pattern_key.as_bytes());
    format!("L1-PLATFORM-{}", &hex::encode(digest)[..12])
}

/// Emits candidates, applies review decisions, and generates rules
#[derive(Clone)]
pub struct PromotionController {
    pool: PgPool,
}

impl PromotionController {
    /// Create a new promotion controller
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Scan a site's eligible patterns and open candidates for any without
    /// one. Returns the newly created candidates.
    pub async fn emit_candidates(&self, site_id: &str) -> Result<Vec<PromotionCandidate>> {
        let rows = sqlx::query(
            "INSERT INTO learning_promotion_candidates
                 (candidate_id, site_id, pattern_signature, approval_status,
                  recommended_action, occurrences, success_rate)
             SELECT gen_random_uuid(), s.site_id, s.pattern_signature, 'pending',
                    s.recommended_action, s.total_occurrences, s.success_rate
             FROM aggregated_pattern_stats s
             WHERE s.site_id = $1 AND s.promotion_eligible
               AND NOT EXISTS (
                   SELECT 1 FROM learning_promotion_candidates c
                   WHERE c.site_id = s.site_id
                     AND c.pattern_signature = s.pattern_signature
                     AND c.approval_status IN ('not_submitted', 'pending', 'client_forwarded'))
             ON CONFLICT DO NOTHING
             RETURNING candidate_id",
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            candidates.push(self.get(row.get("candidate_id")).await?);
        }
        Ok(candidates)
    }

    /// Fetch one candidate
    pub async fn get(&self, candidate_id: Uuid) -> Result<PromotionCandidate> {
        sqlx::query_as::<_, PromotionCandidate>(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM learning_promotion_candidates
             WHERE candidate_id = $1"
        ))
        .bind(candidate_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(LearningError::UnknownCandidate(candidate_id))
    }

    /// Candidates awaiting partner review for a site
    pub async fn pending_for_site(&self, site_id: &str) -> Result<Vec<PromotionCandidate>> {
        let rows = sqlx::query_as::<_, PromotionCandidate>(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM learning_promotion_candidates
             WHERE site_id = $1 AND approval_status = 'pending'
             ORDER BY created_at"
        ))
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Approve a candidate: generate the L1 rule, persist the audit
    /// artifact, and open one deployment row per appliance at the site.
    pub async fn approve(&self, candidate_id: Uuid, reviewed_by: &str) -> Result<String> {
        let candidate = self.get(candidate_id).await?;
        if !matches!(
            candidate.approval_status,
            ApprovalStatus::Pending | ApprovalStatus::ClientForwarded
        ) {
            return Err(LearningError::InvalidState {
                candidate_id,
                status: candidate.approval_status.as_str().to_string(),
                expected: "pending".to_string(),
            });
        }
        let runbook_id = candidate
            .recommended_action
            .clone()
            .ok_or(LearningError::NoRecommendedAction(candidate_id))?;

        let rule_id = promoted_rule_id(&candidate.pattern_signature);
        let incident_type = candidate
            .pattern_signature
            .split(':')
            .next()
            .unwrap_or(&candidate.pattern_signature)
            .to_string();

        let rule_json = json!({
            "rule_id": rule_id,
            "incident_pattern": { "incident_type": incident_type },
            "runbook_id": runbook_id,
            "confidence": candidate.success_rate,
            "source": "promoted",
        });
        let rule_yaml = serde_yaml::to_string(&rule_json)?;

        let mut tx = self.pool.begin().await?;

        // Duplicate rule_id (re-approval after an earlier candidate for the
        // same pattern) is an expected conflict: the rule stands.
        sqlx::query(
            "INSERT INTO l1_rules (rule_id, incident_pattern, runbook_id, confidence, source)
             VALUES ($1, $2, $3, $4, 'promoted')
             ON CONFLICT (rule_id) DO NOTHING",
        )
        .bind(&rule_id)
        .bind(rule_json.get("incident_pattern"))
        .bind(&runbook_id)
        .bind(candidate.success_rate)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO promoted_rules
                 (rule_id, site_id, pattern_signature, rule_yaml, rule_json, confidence)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (rule_id) DO NOTHING",
        )
        .bind(&rule_id)
        .bind(&candidate.site_id)
        .bind(&candidate.pattern_signature)
        .bind(&rule_yaml)
        .bind(&rule_json)
        .bind(candidate.success_rate)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO runbook_id_mappings (l1_rule_id, runbook_id)
             VALUES ($1, $2)
             ON CONFLICT (l1_rule_id) DO UPDATE SET runbook_id = EXCLUDED.runbook_id",
        )
        .bind(&rule_id)
        .bind(&runbook_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO promoted_rule_deployments (rule_id, appliance_id)
             SELECT $1, appliance_id FROM appliances WHERE site_id = $2
             ON CONFLICT (rule_id, appliance_id) DO NOTHING",
        )
        .bind(&rule_id)
        .bind(&candidate.site_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE learning_promotion_candidates
             SET approval_status = 'approved', reviewed_at = now(), reviewed_by = $2
             WHERE candidate_id = $1",
        )
        .bind(candidate_id)
        .bind(reviewed_by)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO control_audit_log (actor, action, entity_kind, entity_id, details)
             VALUES ($1, 'promotion_approved', 'rule', $2, $3)",
        )
        .bind(reviewed_by)
        .bind(&rule_id)
        .bind(json!({
            "candidate_id": candidate_id,
            "site_id": candidate.site_id,
            "pattern_signature": candidate.pattern_signature,
        }))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(rule_id)
    }

    /// Reject a candidate
    pub async fn reject(&self, candidate_id: Uuid, reviewed_by: &str) -> Result<()> {
        self.transition(
            candidate_id,
            &[ApprovalStatus::Pending, ApprovalStatus::ClientForwarded],
            ApprovalStatus::Rejected,
            Some(reviewed_by),
        )
        .await
    }

    /// Client endorses a pending candidate to the partner
    pub async fn client_forward(&self, candidate_id: Uuid) -> Result<()> {
        self.transition(
            candidate_id,
            &[ApprovalStatus::Pending],
            ApprovalStatus::ClientForwarded,
            None,
        )
        .await
    }

    /// A forwarded candidate re-enters partner review
    pub async fn resubmit(&self, candidate_id: Uuid) -> Result<()> {
        self.transition(
            candidate_id,
            &[ApprovalStatus::ClientForwarded, ApprovalStatus::NotSubmitted],
            ApprovalStatus::Pending,
            None,
        )
        .await
    }

    /// Mark an approved candidate deployed once every deployment row for
    /// its rule has been acknowledged.
    pub async fn mark_deployed(&self, rule_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE learning_promotion_candidates c
             SET approval_status = 'deployed'
             FROM promoted_rules p
             WHERE p.rule_id = $1
               AND c.site_id = p.site_id
               AND c.pattern_signature = p.pattern_signature
               AND c.approval_status = 'approved'
               AND NOT EXISTS (
                   SELECT 1 FROM promoted_rule_deployments d
                   WHERE d.rule_id = $1 AND d.status IN ('pending', 'delivered'))",
        )
        .bind(rule_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Auto-promote qualifying cross-client patterns: enough distinct
    /// organizations, volume, and success. No approval gate. Returns the
    /// generated rule ids.
    pub async fn auto_promote_platform(&self) -> Result<Vec<String>> {
        let qualifying = sqlx::query(
            "SELECT pattern_key, incident_type, runbook_id, success_rate
             FROM platform_pattern_stats
             WHERE NOT auto_promoted
               AND distinct_orgs >= $1
               AND total_occurrences >= $2
               AND success_rate >= $3",
        )
        .bind(PLATFORM_MIN_ORGS)
        .bind(PLATFORM_MIN_TOTAL)
        .bind(PLATFORM_MIN_SUCCESS_RATE)
        .fetch_all(&self.pool)
        .await?;

        let mut rule_ids = Vec::with_capacity(qualifying.len());
        for row in qualifying {
            let pattern_key: String = row.get("pattern_key");
            let incident_type: String = row.get("incident_type");
            let runbook_id: String = row.get("runbook_id");
            let success_rate: f64 = row.get("success_rate");

            let rule_id = platform_rule_id(&pattern_key);
            let rule_json = json!({
                "rule_id": rule_id,
                "incident_pattern": { "incident_type": incident_type },
                "runbook_id": runbook_id,
                "confidence": success_rate,
                "source": "platform",
            });
            let rule_yaml = serde_yaml::to_string(&rule_json)?;

            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "INSERT INTO l1_rules (rule_id, incident_pattern, runbook_id, confidence, source)
                 VALUES ($1, $2, $3, $4, 'platform')
                 ON CONFLICT (rule_id) DO NOTHING",
            )
            .bind(&rule_id)
            .bind(rule_json.get("incident_pattern"))
            .bind(&runbook_id)
            .bind(success_rate)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO promoted_rules
                     (rule_id, site_id, pattern_signature, rule_yaml, rule_json, confidence)
                 VALUES ($1, NULL, $2, $3, $4, $5)
                 ON CONFLICT (rule_id) DO NOTHING",
            )
            .bind(&rule_id)
            .bind(&pattern_key)
            .bind(&rule_yaml)
            .bind(&rule_json)
            .bind(success_rate)
            .execute(&mut *tx)
            .await?;

            // Fleet-wide sync: one deployment row per appliance
            sqlx::query(
                "INSERT INTO promoted_rule_deployments (rule_id, appliance_id)
                 SELECT $1, appliance_id FROM appliances WHERE status = 'active'
                 ON CONFLICT (rule_id, appliance_id) DO NOTHING",
            )
            .bind(&rule_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE platform_pattern_stats SET auto_promoted = true
                 WHERE pattern_key = $1",
            )
            .bind(&pattern_key)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO control_audit_log (actor, action, entity_kind, entity_id, details)
                 VALUES ('platform', 'platform_auto_promotion', 'rule', $1, $2)",
            )
            .bind(&rule_id)
            .bind(json!({ "pattern_key": pattern_key }))
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            log::info!("Auto-promoted platform pattern {pattern_key} as {rule_id}");
            rule_ids.push(rule_id);
        }
        Ok(rule_ids)
    }

    /// Revoke a promoted rule: disable it and mark its deployments for
    /// removal. The sync service emits `remove_promoted_rule` orders for
    /// every appliance still carrying it.
    pub async fn revoke(&self, rule_id: &str, revoked_by: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE promoted_rules SET revoked_at = now()
             WHERE rule_id = $1 AND revoked_at IS NULL",
        )
        .bind(rule_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(LearningError::UnknownRule(rule_id.to_string()));
        }

        sqlx::query("UPDATE l1_rules SET enabled = false, updated_at = now() WHERE rule_id = $1")
            .bind(rule_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO control_audit_log (actor, action, entity_kind, entity_id)
             VALUES ($1, 'rule_revoked', 'rule', $2)",
        )
        .bind(revoked_by)
        .bind(rule_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn transition(
        &self,
        candidate_id: Uuid,
        from: &[ApprovalStatus],
        to: ApprovalStatus,
        reviewed_by: Option<&str>,
    ) -> Result<()> {
        let from_strs: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let updated = sqlx::query(
            "UPDATE learning_promotion_candidates
             SET approval_status = $2,
                 reviewed_at = CASE WHEN $3::text IS NULL THEN reviewed_at ELSE now() END,
                 reviewed_by = coalesce($3, reviewed_by)
             WHERE candidate_id = $1 AND approval_status = ANY($4)",
        )
        .bind(candidate_id)
        .bind(to)
        .bind(reviewed_by)
        .bind(&from_strs)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let current = self.get(candidate_id).await?;
            return Err(LearningError::InvalidState {
                candidate_id,
                status: current.approval_status.as_str().to_string(),
                expected: from_strs.join("|"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promoted_rule_id_shape() {
        let id = promoted_rule_id("service_down:RB-WIN-SEC-001:ws-07");
        assert!(id.starts_with("L1-PROMOTED-"));
        assert_eq!(id.len(), "L1-PROMOTED-".len() + 12);
    }

    #[test]
    fn test_rule_ids_deterministic() {
        let a = promoted_rule_id("sig");
        let b = promoted_rule_id("sig");
        assert_eq!(a, b);
        assert_ne!(promoted_rule_id("sig"), promoted_rule_id("other"));
    }

    #[test]
    fn test_platform_rule_id_distinct_namespace() {
        let promoted = promoted_rule_id("x");
        let platform = platform_rule_id("x");
        assert!(platform.starts_with("L1-PLATFORM-"));
        assert_ne!(promoted, platform);
    }
}
