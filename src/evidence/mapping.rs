//! Framework control mapping and compliance scoring.
//!
//! Each check type maps to one or more `(framework, control_id)` tuples;
//! a single bundle can satisfy controls across several frameworks. The
//! compliance score per `(appliance, framework)` is the share of mapped
//! controls with a passing bundle inside the scoring window, refreshed
//! asynchronously rather than on the submit path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

use super::Result;

/// Days of evidence considered when scoring
pub const SCORE_WINDOW_DAYS: i64 = 30;

/// One compliance score row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ComplianceScore {
    /// Scored appliance
    pub appliance_id: String,
    /// Framework name
    pub framework: String,
    /// controls_passing / controls_total, 0 when nothing is mapped
    pub score: f64,
    /// Distinct controls with a passing bundle in the window
    pub controls_passing: i32,
    /// Distinct controls with any bundle
    pub controls_total: i32,
    /// When the score was computed
    pub computed_at: DateTime<Utc>,
}

/// Maintains check-to-control mappings and compliance scores
#[derive(Clone)]
pub struct FrameworkMapper {
    pool: PgPool,
}

impl FrameworkMapper {
    /// Create a new mapper
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a check-to-control mapping (idempotent)
    pub async fn add_mapping(
        &self,
        check_type: &str,
        framework: &str,
        control_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO check_control_mappings (check_type, framework, control_id)
             VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(check_type)
        .bind(framework)
        .bind(control_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Controls a bundle satisfied, as recorded at submit time
    pub async fn controls_for_bundle(&self, bundle_id: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT framework, control_id FROM evidence_framework_mappings
             WHERE bundle_id = $1 ORDER BY framework, control_id",
        )
        .bind(bundle_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("framework"), r.get("control_id")))
            .collect())
    }

    /// Recompute the compliance score for one `(appliance, framework)`.
    pub async fn refresh_compliance_score(
        &self,
        appliance_id: &str,
        framework: &str,
    ) -> Result<ComplianceScore> {
        let row = sqlx::query(
            "WITH mapped AS (
                 SELECT m.control_id,
                        bool_or(b.check_result = 'pass'
                                AND b.submitted_at > now() - make_interval(days => $3::int))
                            AS passing
                 FROM evidence_framework_mappings m
                 JOIN evidence_bundles b ON b.bundle_id = m.bundle_id
                 WHERE b.appliance_id = $1 AND m.framework = $2
                 GROUP BY m.control_id
             )
             SELECT count(*)::int AS total,
                    count(*) FILTER (WHERE passing)::int AS passing
             FROM mapped",
        )
        .bind(appliance_id)
        .bind(framework)
        .bind(SCORE_WINDOW_DAYS)
        .fetch_one(&self.pool)
        .await?;

        let total: i32 = row.get("total");
        let passing: i32 = row.get("passing");
        let score = compute_score(passing, total);
        let computed_at = Utc::now();

        sqlx::query(
            "INSERT INTO compliance_scores
                 (appliance_id, framework, score, controls_passing, controls_total, computed_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (appliance_id, framework) DO UPDATE
             SET score = EXCLUDED.score,
                 controls_passing = EXCLUDED.controls_passing,
                 controls_total = EXCLUDED.controls_total,
                 computed_at = EXCLUDED.computed_at",
        )
        .bind(appliance_id)
        .bind(framework)
        .bind(score)
        .bind(passing)
        .bind(total)
        .bind(computed_at)
        .execute(&self.pool)
        .await?;

        Ok(ComplianceScore {
            appliance_id: appliance_id.to_string(),
            framework: framework.to_string(),
            score,
            controls_passing: passing,
            controls_total: total,
            computed_at,
        })
    }

    /// Refresh scores for every `(appliance, framework)` pair with evidence.
    /// Returns the number of pairs refreshed.
    pub async fn refresh_all(&self) -> Result<u64> {
        let pairs = sqlx::query(
            "SELECT DISTINCT b.appliance_id, m.framework
             FROM evidence_framework_mappings m
             JOIN evidence_bundles b ON b.bundle_id = m.bundle_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut refreshed = 0u64;
        for pair in &pairs {
            let appliance_id: String = pair.get("appliance_id");
            let framework: String = pair.get("framework");
            self.refresh_compliance_score(&appliance_id, &framework)
                .await?;
            refreshed += 1;
        }
        Ok(refreshed)
    }

    /// Read a stored score
    pub async fn get_score(
        &self,
        appliance_id: &str,
        framework: &str,
    ) -> Result<Option<ComplianceScore>> {
        let row = sqlx::query_as::<_, ComplianceScore>(
            "SELECT appliance_id, framework, score, controls_passing, controls_total,
                    computed_at
             FROM compliance_scores
             WHERE appliance_id = $1 AND framework = $2",
        )
        .bind(appliance_id)
        .bind(framework)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

fn compute_score(passing: i32, total: i32) -> f64 {
    if total == 0 {
        0.0
    } else {
        f64::from(passing) / f64::from(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_zero_when_nothing_mapped() {
        assert_eq!(compute_score(0, 0), 0.0);
    }

    #[test]
    fn test_score_ratio() {
        assert!((compute_score(3, 4) - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_score_full_compliance() {
        assert_eq!(compute_score(7, 7), 1.0);
    }
}
