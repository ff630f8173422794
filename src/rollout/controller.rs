//! Staged rollout controller.

use chrono::{Duration, Utc};
use semver::Version;
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use uuid::Uuid;

use crate::orders::{NewOrder, OrderKind, OrderManager};
use crate::storage::{buckets, ObjectStore};

use super::models::{
    stage_target_count, window_open, RolloutStage, RolloutStatus, UpdateRelease, UpdateRollout,
    UpdateStatus,
};
use super::{Result, RolloutError};

const RELEASE_COLUMNS: &str =
    "release_id, version, object_key, sha256, size_bytes, notes, is_latest, created_at";
const ROLLOUT_COLUMNS: &str =
    "rollout_id, release_id, name, stages, failure_threshold_percent, auto_rollback,
     maintenance_window, target_filter, status, current_stage, stage_started_at,
     stage_completed_at, created_at";

const DOWNLOAD_ORDER_TTL_HOURS: i64 = 24;
const REBOOT_ORDER_TTL_HOURS: i64 = 4;

/// Drives releases and staged rollout campaigns
#[derive(Clone)]
pub struct RolloutController {
    pool: PgPool,
    orders: OrderManager,
    store: Arc<dyn ObjectStore>,
}

impl RolloutController {
    /// Create a new rollout controller
    pub fn new(pool: PgPool, orders: OrderManager, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            pool,
            orders,
            store,
        }
    }

    // ========================================================================
    // Releases
    // ========================================================================

    /// Register an immutable release
    pub async fn register_release(
        &self,
        version: &str,
        object_key: &str,
        sha256: &str,
        size_bytes: i64,
        notes: Option<&str>,
    ) -> Result<UpdateRelease> {
        Version::parse(version)
            .map_err(|_| RolloutError::InvalidVersion(version.to_string()))?;

        let release_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO update_releases (release_id, version, object_key, sha256,
                                          size_bytes, notes)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(release_id)
        .bind(version)
        .bind(object_key)
        .bind(sha256)
        .bind(size_bytes)
        .bind(notes)
        .execute(&self.pool)
        .await?;

        self.get_release(version).await
    }

    /// Fetch a release by version
    pub async fn get_release(&self, version: &str) -> Result<UpdateRelease> {
        sqlx::query_as::<_, UpdateRelease>(&format!(
            "SELECT {RELEASE_COLUMNS} FROM update_releases WHERE version = $1"
        ))
        .bind(version)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RolloutError::UnknownRelease(version.to_string()))
    }

    /// Mark one release as the advertised latest
    pub async fn mark_latest(&self, version: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE update_releases SET is_latest = false WHERE is_latest")
            .execute(&mut *tx)
            .await?;
        let updated = sqlx::query(
            "UPDATE update_releases SET is_latest = true WHERE version = $1",
        )
        .bind(version)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RolloutError::UnknownRelease(version.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Campaign lifecycle
    // ========================================================================

    /// Start a staged rollout for a release
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        &self,
        release_version: &str,
        name: &str,
        stages: &[RolloutStage],
        failure_threshold_percent: f64,
        auto_rollback: bool,
        maintenance_window: Option<Value>,
        target_filter: Option<Value>,
    ) -> Result<UpdateRollout> {
        if stages.is_empty() {
            return Err(RolloutError::InvalidStages("empty stage plan".to_string()));
        }
        for stage in stages {
            if stage.percent <= 0.0 || stage.percent > 100.0 {
                return Err(RolloutError::InvalidStages(format!(
                    "stage percent {} out of range",
                    stage.percent
                )));
            }
        }

        let release = self.get_release(release_version).await?;
        let rollout_id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO update_rollouts
                 (rollout_id, release_id, name, stages, failure_threshold_percent,
                  auto_rollback, maintenance_window, target_filter, stage_started_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())",
        )
        .bind(rollout_id)
        .bind(release.release_id)
        .bind(name)
        .bind(serde_json::to_value(stages).expect("stage plan serializes"))
        .bind(failure_threshold_percent)
        .bind(auto_rollback)
        .bind(&maintenance_window)
        .bind(&target_filter)
        .execute(&self.pool)
        .await?;

        self.get(rollout_id).await
    }

    /// Fetch one rollout
    pub async fn get(&self, rollout_id: Uuid) -> Result<UpdateRollout> {
        sqlx::query_as::<_, UpdateRollout>(&format!(
            "SELECT {ROLLOUT_COLUMNS} FROM update_rollouts WHERE rollout_id = $1"
        ))
        .bind(rollout_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RolloutError::UnknownRollout(rollout_id))
    }

    /// Pause an active rollout
    pub async fn pause(&self, rollout_id: Uuid) -> Result<()> {
        self.transition(rollout_id, RolloutStatus::Active, RolloutStatus::Paused)
            .await
    }

    /// Resume a paused rollout
    pub async fn resume(&self, rollout_id: Uuid) -> Result<()> {
        self.transition(rollout_id, RolloutStatus::Paused, RolloutStatus::Active)
            .await
    }

    /// Cancel a rollout that is not already terminal
    pub async fn cancel(&self, rollout_id: Uuid) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE update_rollouts SET status = 'cancelled'
             WHERE rollout_id = $1 AND status IN ('active', 'paused')",
        )
        .bind(rollout_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            let current = self.get(rollout_id).await?;
            return Err(RolloutError::InvalidState {
                rollout_id,
                status: format!("{:?}", current.status).to_lowercase(),
                expected: "active|paused".to_string(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Cycle advance
    // ========================================================================

    /// Advance every active rollout one cycle
    pub async fn advance_all(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT rollout_id FROM update_rollouts WHERE status = 'active'",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let rollout_id: Uuid = row.get("rollout_id");
            if let Err(e) = self.advance(rollout_id).await {
                log::error!("Rollout {rollout_id} advance failed: {e}");
            }
        }
        Ok(())
    }

    /// One cycle for one rollout: assign stage targets, issue orders,
    /// enforce the failure threshold, and move to the next stage after the
    /// soak delay.
    pub async fn advance(&self, rollout_id: Uuid) -> Result<()> {
        let rollout = self.get(rollout_id).await?;
        if rollout.status != RolloutStatus::Active {
            return Ok(());
        }
        let plan = rollout.stage_plan()?;
        let stage_index = rollout.current_stage as usize;
        if stage_index >= plan.len() {
            self.transition(rollout_id, RolloutStatus::Active, RolloutStatus::Completed)
                .await?;
            return Ok(());
        }
        let stage = plan[stage_index];

        let total_targets = self.count_targets(&rollout).await?;
        let cumulative_target = stage_target_count(stage.percent, total_targets);

        self.assign_targets(&rollout, cumulative_target, stage_index as i32)
            .await?;
        self.issue_download_orders(&rollout).await?;
        self.issue_reboot_orders(&rollout).await?;

        if self.enforce_failure_threshold(&rollout, stage_index as i32).await? {
            // Threshold tripped; the rollout is paused and no further
            // stage work happens this cycle.
            return Ok(());
        }

        self.maybe_advance_stage(&rollout, &plan, cumulative_target)
            .await?;
        Ok(())
    }

    /// Agent-side progress report for an assigned update
    pub async fn report_progress(
        &self,
        rollout_id: Uuid,
        appliance_id: &str,
        status: UpdateStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE appliance_updates
             SET status = $3, error = $4, updated_at = now()
             WHERE rollout_id = $1 AND appliance_id = $2
               AND status NOT IN ('succeeded', 'failed', 'rolled_back')",
        )
        .bind(rollout_id)
        .bind(appliance_id)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply an agent's result for an update order. Non-update orders are
    /// ignored.
    pub async fn handle_order_result(
        &self,
        command_type: &str,
        parameters: &Value,
        appliance_id: &str,
        success: bool,
    ) -> Result<()> {
        let Some(rollout_id) = parameters
            .get("rollout_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            return Ok(());
        };

        let status = match (command_type, success) {
            ("download_update", true) => UpdateStatus::Ready,
            ("download_update", false) => UpdateStatus::Failed,
            ("reboot_into_new_partition", true) => UpdateStatus::Verifying,
            ("reboot_into_new_partition", false) => UpdateStatus::Failed,
            ("rollback_to_previous_partition", true) => UpdateStatus::RolledBack,
            ("rollback_to_previous_partition", false) => UpdateStatus::Failed,
            _ => return Ok(()),
        };
        self.report_progress(rollout_id, appliance_id, status, None)
            .await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn transition(
        &self,
        rollout_id: Uuid,
        from: RolloutStatus,
        to: RolloutStatus,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE update_rollouts SET status = $3 WHERE rollout_id = $1 AND status = $2",
        )
        .bind(rollout_id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            let current = self.get(rollout_id).await?;
            return Err(RolloutError::InvalidState {
                rollout_id,
                status: format!("{:?}", current.status).to_lowercase(),
                expected: format!("{from:?}").to_lowercase(),
            });
        }
        Ok(())
    }

    /// Active appliances matching the rollout's target filter
    async fn count_targets(&self, rollout: &UpdateRollout) -> Result<i64> {
        let (site_filter, tier_filter) = parse_target_filter(rollout.target_filter.as_ref());
        let count: i64 = sqlx::query(
            "SELECT count(*) AS n FROM appliances
             WHERE status = 'active'
               AND ($1::text IS NULL OR site_id = $1)
               AND ($2::smallint IS NULL OR capability_tier = $2)",
        )
        .bind(&site_filter)
        .bind(tier_filter)
        .fetch_one(&self.pool)
        .await?
        .get("n");
        Ok(count)
    }

    /// Bring assignments up to the stage's cumulative target
    async fn assign_targets(
        &self,
        rollout: &UpdateRollout,
        cumulative_target: i64,
        stage: i32,
    ) -> Result<()> {
        let assigned: i64 = sqlx::query(
            "SELECT count(*) AS n FROM appliance_updates WHERE rollout_id = $1",
        )
        .bind(rollout.rollout_id)
        .fetch_one(&self.pool)
        .await?
        .get("n");

        let to_assign = cumulative_target - assigned;
        if to_assign <= 0 {
            return Ok(());
        }

        let (site_filter, tier_filter) = parse_target_filter(rollout.target_filter.as_ref());
        sqlx::query(
            "INSERT INTO appliance_updates (rollout_id, appliance_id, stage_assigned)
             SELECT $1, a.appliance_id, $2
             FROM appliances a
             WHERE a.status = 'active'
               AND ($3::text IS NULL OR a.site_id = $3)
               AND ($4::smallint IS NULL OR a.capability_tier = $4)
               AND NOT EXISTS (SELECT 1 FROM appliance_updates u
                               WHERE u.rollout_id = $1 AND u.appliance_id = a.appliance_id)
             ORDER BY a.appliance_id
             LIMIT $5",
        )
        .bind(rollout.rollout_id)
        .bind(stage)
        .bind(&site_filter)
        .bind(tier_filter)
        .bind(to_assign)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Issue a signed download order for every freshly assigned appliance
    async fn issue_download_orders(&self, rollout: &UpdateRollout) -> Result<()> {
        let release = sqlx::query_as::<_, UpdateRelease>(&format!(
            "SELECT {RELEASE_COLUMNS} FROM update_releases WHERE release_id = $1"
        ))
        .bind(rollout.release_id)
        .fetch_one(&self.pool)
        .await?;

        let pending = sqlx::query(
            "SELECT appliance_id FROM appliance_updates
             WHERE rollout_id = $1 AND status = 'pending'",
        )
        .bind(rollout.rollout_id)
        .fetch_all(&self.pool)
        .await?;

        for row in pending {
            let appliance_id: String = row.get("appliance_id");
            let url = self
                .store
                .presign_get(buckets::RELEASES, &release.object_key)
                .await?;

            let order = self
                .orders
                .create(NewOrder {
                    kind: OrderKind::Appliance,
                    appliance_id: Some(appliance_id.clone()),
                    site_id: None,
                    command_type: "download_update".to_string(),
                    parameters: json!({
                        "rollout_id": rollout.rollout_id.to_string(),
                        "release_version": release.version,
                        "url": url,
                        "sha256": release.sha256,
                        "size_bytes": release.size_bytes,
                    }),
                    runbook_id: None,
                    skip_version: Some(release.version.clone()),
                    dedup_key: Some(format!("download:{}", rollout.rollout_id)),
                    ttl: Duration::hours(DOWNLOAD_ORDER_TTL_HOURS),
                    created_by: "rollout-controller".to_string(),
                })
                .await?;

            sqlx::query(
                "UPDATE appliance_updates
                 SET status = 'notified', order_id = $3, updated_at = now()
                 WHERE rollout_id = $1 AND appliance_id = $2 AND status = 'pending'",
            )
            .bind(rollout.rollout_id)
            .bind(&appliance_id)
            .bind(order.order_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Reboot staged appliances once the maintenance window opens
    async fn issue_reboot_orders(&self, rollout: &UpdateRollout) -> Result<()> {
        if !window_open(rollout.maintenance_window.as_ref(), Utc::now()) {
            return Ok(());
        }

        let ready = sqlx::query(
            "SELECT appliance_id FROM appliance_updates
             WHERE rollout_id = $1 AND status = 'ready'",
        )
        .bind(rollout.rollout_id)
        .fetch_all(&self.pool)
        .await?;

        for row in ready {
            let appliance_id: String = row.get("appliance_id");
            let order = self
                .orders
                .create(NewOrder {
                    kind: OrderKind::Appliance,
                    appliance_id: Some(appliance_id.clone()),
                    site_id: None,
                    command_type: "reboot_into_new_partition".to_string(),
                    parameters: json!({ "rollout_id": rollout.rollout_id.to_string() }),
                    runbook_id: None,
                    skip_version: None,
                    dedup_key: Some(format!("reboot:{}", rollout.rollout_id)),
                    ttl: Duration::hours(REBOOT_ORDER_TTL_HOURS),
                    created_by: "rollout-controller".to_string(),
                })
                .await?;

            sqlx::query(
                "UPDATE appliance_updates
                 SET status = 'rebooting', order_id = $3, updated_at = now()
                 WHERE rollout_id = $1 AND appliance_id = $2 AND status = 'ready'",
            )
            .bind(rollout.rollout_id)
            .bind(&appliance_id)
            .bind(order.order_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Pause when the stage failure ratio crosses the threshold; with
    /// auto_rollback, send failed appliances back to their previous
    /// partition. Returns whether the threshold tripped.
    async fn enforce_failure_threshold(
        &self,
        rollout: &UpdateRollout,
        stage: i32,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT count(*) AS total,
                    count(*) FILTER (WHERE status = 'failed') AS failed
             FROM appliance_updates
             WHERE rollout_id = $1 AND stage_assigned = $2",
        )
        .bind(rollout.rollout_id)
        .bind(stage)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.get("total");
        let failed: i64 = row.get("failed");

        if total == 0 || (failed as f64 / total as f64) * 100.0 <= rollout.failure_threshold_percent
        {
            return Ok(false);
        }

        log::warn!(
            "Rollout {} stage {stage}: {failed}/{total} failed, pausing",
            rollout.rollout_id
        );
        self.transition(rollout.rollout_id, RolloutStatus::Active, RolloutStatus::Paused)
            .await?;

        if rollout.auto_rollback {
            let failed_rows = sqlx::query(
                "SELECT appliance_id FROM appliance_updates
                 WHERE rollout_id = $1 AND stage_assigned = $2 AND status = 'failed'",
            )
            .bind(rollout.rollout_id)
            .bind(stage)
            .fetch_all(&self.pool)
            .await?;

            for row in failed_rows {
                let appliance_id: String = row.get("appliance_id");
                self.orders
                    .create(NewOrder {
                        kind: OrderKind::Appliance,
                        appliance_id: Some(appliance_id.clone()),
                        site_id: None,
                        command_type: "rollback_to_previous_partition".to_string(),
                        parameters: json!({ "rollout_id": rollout.rollout_id.to_string() }),
                        runbook_id: None,
                        skip_version: None,
                        dedup_key: Some(format!("rollback:{}", rollout.rollout_id)),
                        ttl: Duration::hours(REBOOT_ORDER_TTL_HOURS),
                        created_by: "rollout-controller".to_string(),
                    })
                    .await?;
            }
        }
        Ok(true)
    }

    /// Close out a finished stage and, after the soak delay, open the next
    async fn maybe_advance_stage(
        &self,
        rollout: &UpdateRollout,
        plan: &[RolloutStage],
        cumulative_target: i64,
    ) -> Result<()> {
        let row = sqlx::query(
            "SELECT count(*) AS total,
                    count(*) FILTER (WHERE status IN ('succeeded', 'failed', 'rolled_back'))
                        AS terminal
             FROM appliance_updates WHERE rollout_id = $1",
        )
        .bind(rollout.rollout_id)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.get("total");
        let terminal: i64 = row.get("terminal");

        let stage_complete = total >= cumulative_target && total > 0 && terminal == total;
        if !stage_complete {
            return Ok(());
        }

        let stage = plan[rollout.current_stage as usize];

        if rollout.stage_completed_at.is_none() {
            sqlx::query(
                "UPDATE update_rollouts SET stage_completed_at = now()
                 WHERE rollout_id = $1 AND stage_completed_at IS NULL",
            )
            .bind(rollout.rollout_id)
            .execute(&self.pool)
            .await?;
            if stage.delay_hours > 0 {
                return Ok(());
            }
        }

        let soaked = match rollout.stage_completed_at {
            Some(completed) => Utc::now() - completed >= Duration::hours(stage.delay_hours),
            None => stage.delay_hours == 0,
        };
        if !soaked {
            return Ok(());
        }

        if (rollout.current_stage as usize) + 1 >= plan.len() {
            self.transition(rollout.rollout_id, RolloutStatus::Active, RolloutStatus::Completed)
                .await?;
        } else {
            sqlx::query(
                "UPDATE update_rollouts
                 SET current_stage = current_stage + 1,
                     stage_started_at = now(), stage_completed_at = NULL
                 WHERE rollout_id = $1 AND status = 'active'",
            )
            .bind(rollout.rollout_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

/// Supported target filter keys: `site_id` and `capability_tier`
fn parse_target_filter(filter: Option<&Value>) -> (Option<String>, Option<i16>) {
    let Some(filter) = filter else {
        return (None, None);
    };
    let site = filter
        .get("site_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let tier = filter
        .get("capability_tier")
        .and_then(Value::as_i64)
        .map(|t| t as i16);
    (site, tier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_filter_empty() {
        assert_eq!(parse_target_filter(None), (None, None));
        assert_eq!(parse_target_filter(Some(&json!({}))), (None, None));
    }

    #[test]
    fn test_parse_target_filter_keys() {
        let filter = json!({"site_id": "clinic-1", "capability_tier": 2});
        assert_eq!(
            parse_target_filter(Some(&filter)),
            (Some("clinic-1".to_string()), Some(2))
        );
    }
}
