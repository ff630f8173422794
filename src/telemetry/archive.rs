//! Telemetry archival.
//!
//! A daily job summarizes hot rows past the retention window into
//! `telemetry_archive` (per site, pattern, and day), then deletes them.
//! Re-running the job over an overlapping window folds counts into the
//! existing archive rows rather than double-inserting.

use sqlx::PgPool;

use super::Result;

/// Summarizes and prunes aged telemetry
#[derive(Clone)]
pub struct TelemetryArchiver {
    pool: PgPool,
    retention_days: i64,
}

impl TelemetryArchiver {
    /// Create a new archiver
    pub fn new(pool: PgPool, retention_days: i64) -> Self {
        Self {
            pool,
            retention_days,
        }
    }

    /// Roll up and delete rows older than the retention window.
    /// Returns `(archived_groups, deleted_rows)`.
    pub async fn run(&self) -> Result<(u64, u64)> {
        let mut tx = self.pool.begin().await?;

        let archived = sqlx::query(
            "INSERT INTO telemetry_archive
                 (site_id, pattern_signature, period, total_occurrences,
                  success_count, l1_count, l2_count, l3_count, avg_duration_seconds)
             SELECT site_id,
                    pattern_signature,
                    recorded_at::date,
                    count(*),
                    count(*) FILTER (WHERE success),
                    count(*) FILTER (WHERE resolution_level = 'L1'),
                    count(*) FILTER (WHERE resolution_level = 'L2'),
                    count(*) FILTER (WHERE resolution_level = 'L3'),
                    avg(duration_seconds)
             FROM execution_telemetry
             WHERE recorded_at < now() - make_interval(days => $1::int)
             GROUP BY site_id, pattern_signature, recorded_at::date
             ON CONFLICT (site_id, pattern_signature, period) DO UPDATE SET
                 total_occurrences = telemetry_archive.total_occurrences
                                     + EXCLUDED.total_occurrences,
                 success_count = telemetry_archive.success_count + EXCLUDED.success_count,
                 l1_count = telemetry_archive.l1_count + EXCLUDED.l1_count,
                 l2_count = telemetry_archive.l2_count + EXCLUDED.l2_count,
                 l3_count = telemetry_archive.l3_count + EXCLUDED.l3_count,
                 avg_duration_seconds = CASE
                     WHEN EXCLUDED.avg_duration_seconds IS NULL
                         THEN telemetry_archive.avg_duration_seconds
                     WHEN telemetry_archive.avg_duration_seconds IS NULL
                         THEN EXCLUDED.avg_duration_seconds
                     ELSE (telemetry_archive.avg_duration_seconds
                           * telemetry_archive.total_occurrences
                           + EXCLUDED.avg_duration_seconds
                           * EXCLUDED.total_occurrences)
                          / (telemetry_archive.total_occurrences
                             + EXCLUDED.total_occurrences)
                 END,
                 archived_at = now()",
        )
        .bind(self.retention_days)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let deleted = sqlx::query(
            "DELETE FROM execution_telemetry
             WHERE recorded_at < now() - make_interval(days => $1::int)",
        )
        .bind(self.retention_days)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if deleted > 0 {
            log::info!("Archived {archived} telemetry groups, deleted {deleted} hot rows");
        }
        Ok((archived, deleted))
    }
}
