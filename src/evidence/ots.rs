//! OpenTimestamps anchoring.
//!
//! Optional, per-site extension of the evidence chain: bundle hashes are
//! submitted to calendar servers, which later aggregate them into a
//! Bitcoin-anchored attestation. Progress per bundle is
//! `pending -> anchored` (calendar proof held) `-> verified`
//! (Bitcoin-anchored proof held). Every stage is resumable; a failed
//! attempt records a human-readable `ots_error` and the next worker pass
//! retries. The chain itself verifies with no anchoring data at all.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::OtsConfig;

use super::{EvidenceError, Result};

/// Submits digests to calendars and upgrades calendar proofs
#[derive(Clone)]
pub struct OtsService {
    pool: PgPool,
    client: reqwest::Client,
    config: OtsConfig,
}

impl OtsService {
    /// Create a new anchoring service
    pub fn new(pool: PgPool, config: OtsConfig) -> Self {
        Self {
            pool,
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Submit pending bundle hashes to a calendar server.
    ///
    /// Only bundles older than the configured minimum age are submitted,
    /// giving agents time to retry duplicate submissions before the hash
    /// is anchored. Returns the number of bundles advanced to `anchored`.
    pub async fn submit_pending(&self, limit: i64) -> Result<u64> {
        if !self.config.enabled {
            return Ok(0);
        }

        // Snapshot candidates first; calendar HTTP happens outside any
        // transaction.
        let candidates = sqlx::query(
            "SELECT bundle_id, bundle_hash FROM evidence_bundles
             WHERE ots_status = 'pending'
               AND submitted_at < now() - make_interval(secs => $1::double precision)
             ORDER BY submitted_at
             LIMIT $2",
        )
        .bind(self.config.min_age_secs as f64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut advanced = 0u64;
        for row in candidates {
            let bundle_id: String = row.get("bundle_id");
            let bundle_hash: String = row.get("bundle_hash");

            match self.submit_digest(&bundle_hash).await {
                Ok((calendar_url, proof)) => {
                    sqlx::query(
                        "INSERT INTO ots_proofs (proof_id, bundle_id, calendar_url, proof_data)
                         VALUES ($1, $2, $3, $4)",
                    )
                    .bind(Uuid::new_v4())
                    .bind(&bundle_id)
                    .bind(&calendar_url)
                    .bind(BASE64.encode(&proof))
                    .execute(&self.pool)
                    .await?;

                    sqlx::query(
                        "UPDATE evidence_bundles
                         SET ots_status = 'anchored', ots_submitted_at = now(), ots_error = NULL
                         WHERE bundle_id = $1",
                    )
                    .bind(&bundle_id)
                    .execute(&self.pool)
                    .await?;
                    advanced += 1;
                }
                Err(e) => {
                    log::warn!("OTS submission failed for bundle {bundle_id}: {e}");
                    sqlx::query(
                        "UPDATE evidence_bundles SET ots_error = $2 WHERE bundle_id = $1",
                    )
                    .bind(&bundle_id)
                    .bind(e.to_string())
                    .execute(&self.pool)
                    .await?;
                }
            }
        }
        Ok(advanced)
    }

    /// Upgrade calendar proofs whose digests have since been anchored in
    /// Bitcoin. Returns the number of bundles advanced to `verified`.
    pub async fn upgrade_pending(&self, limit: i64) -> Result<u64> {
        if !self.config.enabled {
            return Ok(0);
        }

        let candidates = sqlx::query(
            "SELECT p.proof_id, p.bundle_id, p.calendar_url, b.bundle_hash
             FROM ots_proofs p
             JOIN evidence_bundles b ON b.bundle_id = p.bundle_id
             WHERE p.status = 'calendar'
             ORDER BY p.created_at
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut advanced = 0u64;
        for row in candidates {
            let proof_id: Uuid = row.get("proof_id");
            let bundle_id: String = row.get("bundle_id");
            let calendar_url: String = row.get("calendar_url");
            let bundle_hash: String = row.get("bundle_hash");

            match self.fetch_upgrade(&calendar_url, &bundle_hash).await {
                Ok(Some(proof)) => {
                    sqlx::query(
                        "UPDATE ots_proofs
                         SET proof_data = $2, status = 'bitcoin', upgraded_at = now()
                         WHERE proof_id = $1",
                    )
                    .bind(proof_id)
                    .bind(BASE64.encode(&proof))
                    .execute(&self.pool)
                    .await?;

                    sqlx::query(
                        "UPDATE evidence_bundles
                         SET ots_status = 'verified', ots_anchored_at = now(), ots_error = NULL
                         WHERE bundle_id = $1",
                    )
                    .bind(&bundle_id)
                    .execute(&self.pool)
                    .await?;
                    advanced += 1;
                }
                // Not anchored yet; try again on a later pass
                Ok(None) => {}
                Err(e) => {
                    log::warn!("OTS upgrade failed for bundle {bundle_id}: {e}");
                    sqlx::query(
                        "UPDATE evidence_bundles SET ots_error = $2 WHERE bundle_id = $1",
                    )
                    .bind(&bundle_id)
                    .bind(e.to_string())
                    .execute(&self.pool)
                    .await?;
                }
            }
        }
        Ok(advanced)
    }

    /// POST the digest to the first calendar that accepts it
    async fn submit_digest(&self, bundle_hash: &str) -> Result<(String, Vec<u8>)> {
        let digest = hex::decode(bundle_hash)
            .map_err(|e| EvidenceError::Calendar(format!("bad bundle hash: {e}")))?;

        let mut last_error = "no calendars configured".to_string();
        for calendar in &self.config.calendars {
            let url = format!("{}/digest", calendar.trim_end_matches('/'));
            match self.client.post(&url).body(digest.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let proof = resp
                        .bytes()
                        .await
                        .map_err(|e| EvidenceError::Calendar(e.to_string()))?;
                    return Ok((calendar.clone(), proof.to_vec()));
                }
                Ok(resp) => {
                    last_error = format!("{url} returned {}", resp.status());
                }
                Err(e) => {
                    last_error = format!("{url}: {e}");
                }
            }
        }
        Err(EvidenceError::Calendar(last_error))
    }

    /// Ask the issuing calendar whether the digest has been anchored yet
    async fn fetch_upgrade(&self, calendar_url: &str, bundle_hash: &str) -> Result<Option<Vec<u8>>> {
        let url = format!(
            "{}/timestamp/{bundle_hash}",
            calendar_url.trim_end_matches('/')
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EvidenceError::Calendar(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(EvidenceError::Calendar(format!(
                "{url} returned {}",
                resp.status()
            )));
        }
        let proof = resp
            .bytes()
            .await
            .map_err(|e| EvidenceError::Calendar(e.to_string()))?;
        Ok(Some(proof.to_vec()))
    }
}
