//! Chain append, verification, and repair.

use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::database::advisory_lock_key;
use crate::crypto::signing::verify_hex;

use super::models::{chain_hash, BundleSubmission, EvidenceBundle};
use super::{EvidenceError, Result, GENESIS_HASH};

const BUNDLE_COLUMNS: &str =
    "bundle_id, site_id, appliance_id, check_type, check_result, checks, summary,
     bundle_hash, prev_bundle_id, prev_hash, chain_position, chain_hash,
     signature, signed_data, signature_valid, checked_at, ntp_verification,
     ots_status, ots_submitted_at, ots_anchored_at, ots_error, submitted_at";

/// Result of one bundle submission
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    /// Chain position assigned (or already held, for duplicates)
    pub chain_position: i64,
    /// Chain hash at that position
    pub chain_hash: String,
    /// Whether the agent signature verified
    pub signature_valid: bool,
    /// Whether this `bundle_id` had already been chained
    pub duplicate: bool,
}

/// One localized verification failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    /// Position where the break was detected
    pub position: i64,
    /// What failed
    pub reason: String,
}

/// Outcome of a full chain walk
#[derive(Debug, Clone)]
pub struct ChainVerification {
    /// Chain length
    pub length: i64,
    /// Detected breaks, empty when the chain verifies
    pub breaks: Vec<ChainBreak>,
}

impl ChainVerification {
    /// Whether the chain verified end to end
    pub fn is_valid(&self) -> bool {
        self.breaks.is_empty()
    }
}

/// Appends, verifies, and repairs per-site evidence chains
#[derive(Clone)]
pub struct EvidenceChain {
    pool: PgPool,
}

impl EvidenceChain {
    /// Create a new chain service
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one bundle to its site's chain.
    ///
    /// Chain extension for a site is serialized by a transaction-scoped
    /// advisory lock keyed by a hash of the site id; submissions for
    /// different sites proceed in parallel. A duplicate `bundle_id` is
    /// idempotent and reports the existing row.
    pub async fn submit(&self, sub: &BundleSubmission) -> Result<SubmissionOutcome> {
        let site = sqlx::query("SELECT ots_enabled FROM sites WHERE site_id = $1")
            .bind(&sub.site_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EvidenceError::UnknownSite(sub.site_id.clone()))?;
        let ots_enabled: bool = site.get("ots_enabled");

        let appliance = sqlx::query(
            "SELECT public_key FROM appliances WHERE appliance_id = $1 AND site_id = $2",
        )
        .bind(&sub.appliance_id)
        .bind(&sub.site_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EvidenceError::UnknownAppliance(sub.appliance_id.clone()))?;
        let public_key: String = appliance.get("public_key");

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_lock_key(&sub.site_id))
            .execute(&mut *tx)
            .await?;

        // Idempotent duplicate: report the row already chained
        if let Some(existing) = sqlx::query(
            "SELECT chain_position, chain_hash, signature_valid
             FROM evidence_bundles WHERE bundle_id = $1",
        )
        .bind(&sub.bundle_id)
        .fetch_optional(&mut *tx)
        .await?
        {
            tx.commit().await?;
            return Ok(SubmissionOutcome {
                chain_position: existing.get("chain_position"),
                chain_hash: existing.get("chain_hash"),
                signature_valid: existing.get("signature_valid"),
                duplicate: true,
            });
        }

        let head = sqlx::query(
            "SELECT bundle_id, bundle_hash, chain_position FROM evidence_bundles
             WHERE site_id = $1 ORDER BY chain_position DESC LIMIT 1",
        )
        .bind(&sub.site_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (prev_bundle_id, prev_hash, position): (Option<String>, String, i64) = match head {
            Some(row) => (
                Some(row.get("bundle_id")),
                row.get("bundle_hash"),
                row.get::<i64, _>("chain_position") + 1,
            ),
            None => (None, GENESIS_HASH.to_string(), 1),
        };

        let bundle_hash = sub.content_hash();
        let link_hash = chain_hash(&bundle_hash, &prev_hash, position);

        // Verify over the exact bytes the agent signed. A failure is not
        // fatal: the bundle chains anyway with signature_valid = false and
        // the rejection counter is the operator's signal.
        let signature_valid =
            verify_hex(&public_key, sub.signed_data.as_bytes(), &sub.signature).is_ok();
        self.record_verification(&mut tx, &sub.appliance_id, signature_valid)
            .await?;

        sqlx::query(
            "INSERT INTO evidence_bundles
                 (bundle_id, site_id, appliance_id, check_type, check_result, checks,
                  summary, bundle_hash, prev_bundle_id, prev_hash, chain_position,
                  chain_hash, signature, signed_data, signature_valid, checked_at,
                  ntp_verification, ots_status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                     $15, $16, $17, $18)",
        )
        .bind(&sub.bundle_id)
        .bind(&sub.site_id)
        .bind(&sub.appliance_id)
        .bind(&sub.check_type)
        .bind(sub.check_result)
        .bind(&sub.checks)
        .bind(&sub.summary)
        .bind(&bundle_hash)
        .bind(&prev_bundle_id)
        .bind(&prev_hash)
        .bind(position)
        .bind(&link_hash)
        .bind(&sub.signature)
        .bind(&sub.signed_data)
        .bind(signature_valid)
        .bind(sub.checked_at)
        .bind(&sub.ntp_verification)
        .bind(if ots_enabled { "pending" } else { "none" })
        .execute(&mut *tx)
        .await?;

        // Map every check in the bundle to its framework controls
        let check_types = collect_check_types(&sub.check_type, &sub.checks);
        sqlx::query(
            "INSERT INTO evidence_framework_mappings (bundle_id, framework, control_id)
             SELECT $1, m.framework, m.control_id
             FROM check_control_mappings m
             WHERE m.check_type = ANY($2)
             ON CONFLICT DO NOTHING",
        )
        .bind(&sub.bundle_id)
        .bind(&check_types)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(SubmissionOutcome {
            chain_position: position,
            chain_hash: link_hash,
            signature_valid,
            duplicate: false,
        })
    }

    /// Fetch one bundle
    pub async fn get_bundle(&self, bundle_id: &str) -> Result<Option<EvidenceBundle>> {
        let row = sqlx::query_as::<_, EvidenceBundle>(&format!(
            "SELECT {BUNDLE_COLUMNS} FROM evidence_bundles WHERE bundle_id = $1"
        ))
        .bind(bundle_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Walk a site's chain from genesis and verify every link.
    ///
    /// Checks that positions are a dense 1..N sequence, that each
    /// `prev_hash` equals the predecessor's `bundle_hash` (the zero
    /// sentinel at genesis), and that every `chain_hash` matches the
    /// formula. Breaks localize the tampered position.
    pub async fn verify_chain(&self, site_id: &str) -> Result<ChainVerification> {
        let rows = sqlx::query(
            "SELECT bundle_id, bundle_hash, prev_bundle_id, prev_hash,
                    chain_position, chain_hash
             FROM evidence_bundles WHERE site_id = $1 ORDER BY chain_position",
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;

        let mut breaks = Vec::new();
        let mut expected_prev_hash = GENESIS_HASH.to_string();
        let mut expected_prev_id: Option<String> = None;

        for (index, row) in rows.iter().enumerate() {
            let position: i64 = row.get("chain_position");
            let expected_position = index as i64 + 1;
            let bundle_hash: String = row.get("bundle_hash");
            let prev_hash: String = row.get("prev_hash");
            let prev_bundle_id: Option<String> = row.get("prev_bundle_id");
            let stored_chain_hash: String = row.get("chain_hash");

            if position != expected_position {
                breaks.push(ChainBreak {
                    position: expected_position,
                    reason: format!("expected position {expected_position}, found {position}"),
                });
                // Resynchronize on the stored position so later links are
                // still checked against their own predecessors
                expected_prev_hash = bundle_hash.clone();
                expected_prev_id = Some(row.get("bundle_id"));
                continue;
            }
            if prev_hash != expected_prev_hash {
                breaks.push(ChainBreak {
                    position,
                    reason: "prev_hash does not match predecessor bundle_hash".to_string(),
                });
            }
            if prev_bundle_id != expected_prev_id {
                breaks.push(ChainBreak {
                    position,
                    reason: "prev_bundle_id does not match predecessor".to_string(),
                });
            }
            let recomputed = chain_hash(&bundle_hash, &prev_hash, position);
            if recomputed != stored_chain_hash {
                breaks.push(ChainBreak {
                    position,
                    reason: "chain_hash does not match formula".to_string(),
                });
            }

            expected_prev_hash = bundle_hash;
            expected_prev_id = Some(row.get("bundle_id"));
        }

        Ok(ChainVerification {
            length: rows.len() as i64,
            breaks,
        })
    }

    /// Rebuild a site's chain metadata as a whole unit.
    ///
    /// Re-numbers positions densely in existing order and recomputes every
    /// link and chain hash from the immutable `bundle_hash` values. Content
    /// fields are never touched; the append-only trigger enforces that.
    /// Returns the number of rows whose metadata changed.
    pub async fn repair_chain(&self, site_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_lock_key(site_id))
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(
            "SELECT bundle_id, bundle_hash, prev_bundle_id, prev_hash,
                    chain_position, chain_hash
             FROM evidence_bundles WHERE site_id = $1
             ORDER BY chain_position, submitted_at",
        )
        .bind(site_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut repaired = 0u64;
        let mut prev_hash = GENESIS_HASH.to_string();
        let mut prev_id: Option<String> = None;

        for (index, row) in rows.iter().enumerate() {
            let position = index as i64 + 1;
            let bundle_id: String = row.get("bundle_id");
            let bundle_hash: String = row.get("bundle_hash");
            let link_hash = chain_hash(&bundle_hash, &prev_hash, position);

            let unchanged = row.get::<i64, _>("chain_position") == position
                && row.get::<String, _>("prev_hash") == prev_hash
                && row.get::<Option<String>, _>("prev_bundle_id") == prev_id
                && row.get::<String, _>("chain_hash") == link_hash;

            if !unchanged {
                sqlx::query(
                    "UPDATE evidence_bundles
                     SET chain_position = $2, prev_hash = $3, prev_bundle_id = $4,
                         chain_hash = $5
                     WHERE bundle_id = $1",
                )
                .bind(&bundle_id)
                .bind(position)
                .bind(&prev_hash)
                .bind(&prev_id)
                .bind(&link_hash)
                .execute(&mut *tx)
                .await?;
                repaired += 1;
            }

            prev_hash = bundle_hash;
            prev_id = Some(bundle_id);
        }

        tx.commit().await?;
        Ok(repaired)
    }

    async fn record_verification(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        appliance_id: &str,
        signature_valid: bool,
    ) -> Result<()> {
        if signature_valid {
            sqlx::query(
                "UPDATE appliances
                 SET evidence_rejection_count = 0, last_evidence_accepted = now()
                 WHERE appliance_id = $1",
            )
            .bind(appliance_id)
            .execute(&mut **tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE appliances
                 SET evidence_rejection_count = evidence_rejection_count + 1,
                     last_evidence_rejection = now()
                 WHERE appliance_id = $1",
            )
            .bind(appliance_id)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

/// Check types covered by a bundle: the bundle's own type plus any
/// `check_type` fields inside the checks payload.
fn collect_check_types(bundle_check_type: &str, checks: &Value) -> Vec<String> {
    let mut types = vec![bundle_check_type.to_string()];
    if let Value::Array(items) = checks {
        for item in items {
            if let Some(t) = item.get("check_type").and_then(Value::as_str) {
                if !types.iter().any(|existing| existing == t) {
                    types.push(t.to_string());
                }
            }
        }
    }
    types
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collect_check_types_dedupes() {
        let checks = json!([
            {"check_type": "firewall", "status": "pass"},
            {"check_type": "firewall", "status": "pass"},
            {"check_type": "av_status", "status": "fail"},
            {"status": "pass"}
        ]);
        let types = collect_check_types("endpoint_baseline", &checks);
        assert_eq!(types, vec!["endpoint_baseline", "firewall", "av_status"]);
    }

    #[test]
    fn test_collect_check_types_non_array_payload() {
        let types = collect_check_types("disk_encryption", &json!({"status": "pass"}));
        assert_eq!(types, vec!["disk_encryption"]);
    }

    #[test]
    fn test_genesis_sentinel_is_64_zeros() {
        assert_eq!(GENESIS_HASH.len(), 64);
        assert!(GENESIS_HASH.chars().all(|c| c == '0'));
    }
}
