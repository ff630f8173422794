//! Telemetry ingestion.
//!
//! One transaction per record: the raw row, the L1 rule counters, the
//! per-site aggregate, the eligibility flag, and the cross-client
//! aggregate all land together. Aggregate upserts rely on
//! `ON CONFLICT DO UPDATE` row-level atomicity; no advisory locks are
//! taken on this path.

use sqlx::{PgPool, Postgres, Transaction};

use super::models::{
    ResolutionLevel, TelemetryRecord, PROMOTION_MIN_OCCURRENCES, PROMOTION_MIN_SUCCESS_RATE,
    PROMOTION_RECENCY_DAYS,
};
use super::{Result, TelemetryError};

/// Ingests execution telemetry and maintains pattern aggregates
#[derive(Clone)]
pub struct TelemetryIngest {
    pool: PgPool,
}

impl TelemetryIngest {
    /// Create a new ingest service
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ingest a batch, returning how many records were newly stored.
    /// Replayed `execution_id`s are skipped without touching any counter.
    pub async fn ingest_batch(&self, records: &[TelemetryRecord]) -> Result<u64> {
        let mut stored = 0u64;
        for record in records {
            if self.ingest_one(record).await? {
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Ingest one record. Returns false when the execution id was already
    /// stored.
    pub async fn ingest_one(&self, record: &TelemetryRecord) -> Result<bool> {
        let signature = record.effective_pattern_signature();

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO execution_telemetry
                 (execution_id, incident_id, site_id, appliance_id, runbook_id,
                  hostname, platform, incident_type, success, resolution_level,
                  duration_seconds, state_before, state_after, state_diff,
                  failure_type, cost_usd, input_tokens, output_tokens,
                  pattern_signature, chaos_campaign_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                     $15, $16, $17, $18, $19, $20)
             ON CONFLICT (execution_id) DO NOTHING",
        )
        .bind(&record.execution_id)
        .bind(&record.incident_id)
        .bind(&record.site_id)
        .bind(&record.appliance_id)
        .bind(&record.runbook_id)
        .bind(&record.hostname)
        .bind(&record.platform)
        .bind(&record.incident_type)
        .bind(record.success)
        .bind(record.resolution_level)
        .bind(record.duration_seconds)
        .bind(&record.state_before)
        .bind(&record.state_after)
        .bind(&record.state_diff)
        .bind(&record.failure_type)
        .bind(record.cost_usd)
        .bind(record.input_tokens)
        .bind(record.output_tokens)
        .bind(&signature)
        .bind(&record.chaos_campaign_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.constraint().is_some() => {
                classify_fk_violation(db.constraint().unwrap_or(""), record, e.to_string())
            }
            _ => TelemetryError::Database(e),
        })?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if record.resolution_level == ResolutionLevel::L1 {
            if let Some(runbook_id) = &record.runbook_id {
                // Agents report the internal rule id in runbook_id
                self.bump_rule_counters(&mut tx, runbook_id, record.success)
                    .await?;
            }
        }

        self.upsert_site_aggregate(&mut tx, record, &signature).await?;
        self.apply_eligibility(&mut tx, &record.site_id, &signature).await?;
        self.upsert_platform_aggregate(&mut tx, record).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn bump_rule_counters(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        rule_id: &str,
        success: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE l1_rules
             SET match_count = match_count + 1,
                 success_count = success_count + CASE WHEN $2 THEN 1 ELSE 0 END,
                 failure_count = failure_count + CASE WHEN $2 THEN 0 ELSE 1 END,
                 updated_at = now()
             WHERE rule_id = $1",
        )
        .bind(rule_id)
        .bind(success)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_site_aggregate(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &TelemetryRecord,
        signature: &str,
    ) -> Result<()> {
        let duration_ms = record.duration_seconds.map(|s| s * 1000.0);
        let (l1, l2, l3) = match record.resolution_level {
            ResolutionLevel::L1 => (1i64, 0i64, 0i64),
            ResolutionLevel::L2 => (0, 1, 0),
            ResolutionLevel::L3 => (0, 0, 1),
        };

        sqlx::query(
            "INSERT INTO aggregated_pattern_stats
                 (site_id, pattern_signature, total_occurrences, l1_count, l2_count,
                  l3_count, success_count, success_rate, avg_resolution_time_ms,
                  recommended_action, last_seen)
             VALUES ($1, $2, 1, $3, $4, $5,
                     CASE WHEN $6 THEN 1 ELSE 0 END,
                     CASE WHEN $6 THEN 1.0 ELSE 0.0 END,
                     $7,
                     CASE WHEN $6 THEN $8 ELSE NULL END,
                     now())
             ON CONFLICT (site_id, pattern_signature) DO UPDATE SET
                 total_occurrences = aggregated_pattern_stats.total_occurrences + 1,
                 l1_count = aggregated_pattern_stats.l1_count + $3,
                 l2_count = aggregated_pattern_stats.l2_count + $4,
                 l3_count = aggregated_pattern_stats.l3_count + $5,
                 success_count = aggregated_pattern_stats.success_count
                                 + CASE WHEN $6 THEN 1 ELSE 0 END,
                 success_rate = (aggregated_pattern_stats.success_count
                                 + CASE WHEN $6 THEN 1 ELSE 0 END)::double precision
                                / (aggregated_pattern_stats.total_occurrences + 1),
                 avg_resolution_time_ms = CASE
                     WHEN $7::double precision IS NULL
                         THEN aggregated_pattern_stats.avg_resolution_time_ms
                     WHEN aggregated_pattern_stats.avg_resolution_time_ms IS NULL
                         THEN $7
                     ELSE (aggregated_pattern_stats.avg_resolution_time_ms
                           * aggregated_pattern_stats.total_occurrences + $7)
                          / (aggregated_pattern_stats.total_occurrences + 1)
                 END,
                 recommended_action = CASE
                     WHEN $6 THEN coalesce($8, aggregated_pattern_stats.recommended_action)
                     ELSE aggregated_pattern_stats.recommended_action
                 END,
                 last_seen = now()",
        )
        .bind(&record.site_id)
        .bind(signature)
        .bind(l1)
        .bind(l2)
        .bind(l3)
        .bind(record.success)
        .bind(duration_ms)
        .bind(&record.runbook_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Re-evaluate the promotion predicate on the freshly updated row.
    /// Both transitions obey the same inequality.
    async fn apply_eligibility(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        site_id: &str,
        signature: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE aggregated_pattern_stats
             SET promotion_eligible =
                     total_occurrences >= $3
                 AND success_rate >= $4
                 AND last_seen > now() - make_interval(days => $5::int)
             WHERE site_id = $1 AND pattern_signature = $2",
        )
        .bind(site_id)
        .bind(signature)
        .bind(PROMOTION_MIN_OCCURRENCES)
        .bind(PROMOTION_MIN_SUCCESS_RATE)
        .bind(PROMOTION_RECENCY_DAYS)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_platform_aggregate(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &TelemetryRecord,
    ) -> Result<()> {
        let Some(pattern_key) = record.platform_pattern_key() else {
            return Ok(());
        };
        let runbook_id = record
            .runbook_id
            .as_deref()
            .expect("platform key implies runbook id");

        sqlx::query(
            "INSERT INTO platform_pattern_stats
                 (pattern_key, incident_type, runbook_id, total_occurrences,
                  success_count, success_rate, last_seen)
             VALUES ($1, $2, $3, 1,
                     CASE WHEN $4 THEN 1 ELSE 0 END,
                     CASE WHEN $4 THEN 1.0 ELSE 0.0 END,
                     now())
             ON CONFLICT (pattern_key) DO UPDATE SET
                 total_occurrences = platform_pattern_stats.total_occurrences + 1,
                 success_count = platform_pattern_stats.success_count
                                 + CASE WHEN $4 THEN 1 ELSE 0 END,
                 success_rate = (platform_pattern_stats.success_count
                                 + CASE WHEN $4 THEN 1 ELSE 0 END)::double precision
                                / (platform_pattern_stats.total_occurrences + 1),
                 last_seen = now()",
        )
        .bind(&pattern_key)
        .bind(&record.incident_type)
        .bind(runbook_id)
        .bind(record.success)
        .execute(&mut **tx)
        .await?;

        // Track site membership, then refresh the distinct counters from it
        sqlx::query(
            "INSERT INTO platform_pattern_sites (pattern_key, site_id, org_id)
             SELECT $1, s.site_id, s.org_id FROM sites s WHERE s.site_id = $2
             ON CONFLICT DO NOTHING",
        )
        .bind(&pattern_key)
        .bind(&record.site_id)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            "UPDATE platform_pattern_stats SET
                 distinct_sites = (SELECT count(*) FROM platform_pattern_sites
                                   WHERE pattern_key = $1),
                 distinct_orgs = (SELECT count(DISTINCT org_id) FROM platform_pattern_sites
                                  WHERE pattern_key = $1 AND org_id IS NOT NULL)
             WHERE pattern_key = $1",
        )
        .bind(&pattern_key)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn classify_fk_violation(
    constraint: &str,
    record: &TelemetryRecord,
    detail: String,
) -> TelemetryError {
    if constraint.contains("site") {
        TelemetryError::UnknownSite(record.site_id.clone())
    } else if constraint.contains("appliance") {
        TelemetryError::UnknownAppliance(record.appliance_id.clone())
    } else {
        TelemetryError::Database(sqlx::Error::Protocol(detail))
    }
}
