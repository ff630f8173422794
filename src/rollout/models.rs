//! Rollout data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{Result, RolloutError};

/// An immutable OS image release
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UpdateRelease {
    /// Release identifier
    pub release_id: Uuid,
    /// Semver version string, unique
    pub version: String,
    /// Object key in the `releases` bucket
    pub object_key: String,
    /// SHA-256 of the image
    pub sha256: String,
    /// Image size
    pub size_bytes: i64,
    /// Release notes
    pub notes: Option<String>,
    /// Whether this is the advertised latest release
    pub is_latest: bool,
    /// Registration timestamp
    pub created_at: DateTime<Utc>,
}

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    /// Progressing through stages
    Active,
    /// Halted by the failure threshold or an operator
    Paused,
    /// Terminal: every stage finished
    Completed,
    /// Terminal: abandoned after failures
    Failed,
    /// Terminal: cancelled by an operator
    Cancelled,
}

impl RolloutStatus {
    /// Whether the campaign can still issue work
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RolloutStatus::Completed | RolloutStatus::Failed | RolloutStatus::Cancelled
        )
    }
}

/// Per-appliance update progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    /// Assigned, no order issued yet
    Pending,
    /// Download order issued
    Notified,
    /// Agent reports the image downloading
    Downloading,
    /// Image staged on the inactive partition
    Ready,
    /// Reboot order issued
    Rebooting,
    /// Booted the new partition, health checks running
    Verifying,
    /// Terminal: healthy on the new version
    Succeeded,
    /// Terminal: failed at any step
    Failed,
    /// Terminal: reverted to the previous partition
    RolledBack,
}

impl UpdateStatus {
    /// Whether this appliance's update is finished
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdateStatus::Succeeded | UpdateStatus::Failed | UpdateStatus::RolledBack
        )
    }
}

/// One stage of a campaign: cumulative fleet percentage plus the soak
/// delay before the next stage starts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RolloutStage {
    /// Cumulative percentage of the target set covered by this stage
    pub percent: f64,
    /// Hours to soak after the stage completes
    pub delay_hours: i64,
}

/// A staged update campaign
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UpdateRollout {
    /// Rollout identifier
    pub rollout_id: Uuid,
    /// Release being deployed
    pub release_id: Uuid,
    /// Operator-facing name
    pub name: String,
    /// Stage plan, JSON array of [`RolloutStage`]
    pub stages: Value,
    /// Pause once `failed / total_in_stage` exceeds this percentage
    pub failure_threshold_percent: f64,
    /// Whether threshold breaches also send rollback orders
    pub auto_rollback: bool,
    /// Optional `{start_hour, end_hour}` UTC reboot window
    pub maintenance_window: Option<Value>,
    /// Optional appliance filter, e.g. `{"platform": "windows"}`
    pub target_filter: Option<Value>,
    /// Campaign status
    pub status: RolloutStatus,
    /// Index into the stage plan
    pub current_stage: i32,
    /// When the current stage started
    pub stage_started_at: Option<DateTime<Utc>>,
    /// When the current stage finished (soak timer starts here)
    pub stage_completed_at: Option<DateTime<Utc>>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl UpdateRollout {
    /// Parse the stage plan
    pub fn stage_plan(&self) -> Result<Vec<RolloutStage>> {
        let stages: Vec<RolloutStage> = serde_json::from_value(self.stages.clone())
            .map_err(|e| RolloutError::InvalidStages(e.to_string()))?;
        if stages.is_empty() {
            return Err(RolloutError::InvalidStages("empty stage plan".to_string()));
        }
        Ok(stages)
    }
}

/// Appliances covered by a stage: `ceil(percent / 100 × total)`
pub fn stage_target_count(percent: f64, total_targets: i64) -> i64 {
    ((percent / 100.0) * total_targets as f64).ceil() as i64
}

/// Whether the current hour falls inside a `{start_hour, end_hour}` UTC
/// window. A missing window means reboots are always allowed; a window
/// wrapping midnight (start > end) covers the overnight hours.
pub fn window_open(window: Option<&Value>, now: DateTime<Utc>) -> bool {
    let Some(window) = window else {
        return true;
    };
    let (Some(start), Some(end)) = (
        window.get("start_hour").and_then(Value::as_i64),
        window.get("end_hour").and_then(Value::as_i64),
    ) else {
        return true;
    };

    let hour = i64::from(chrono::Timelike::hour(&now));
    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_stage_target_count_rounds_up() {
        assert_eq!(stage_target_count(5.0, 20), 1);
        assert_eq!(stage_target_count(25.0, 20), 5);
        assert_eq!(stage_target_count(100.0, 20), 20);
        assert_eq!(stage_target_count(33.0, 10), 4);
    }

    #[test]
    fn test_stage_target_count_tiny_fleet() {
        assert_eq!(stage_target_count(5.0, 1), 1);
        assert_eq!(stage_target_count(5.0, 0), 0);
    }

    #[test]
    fn test_window_absent_is_open() {
        assert!(window_open(None, Utc::now()));
    }

    #[test]
    fn test_window_daytime() {
        let window = json!({"start_hour": 2, "end_hour": 5});
        let at_3 = Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap();
        let at_6 = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).unwrap();
        assert!(window_open(Some(&window), at_3));
        assert!(!window_open(Some(&window), at_6));
    }

    #[test]
    fn test_window_wrapping_midnight() {
        let window = json!({"start_hour": 22, "end_hour": 4});
        let at_23 = Utc.with_ymd_and_hms(2026, 3, 1, 23, 0, 0).unwrap();
        let at_2 = Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap();
        let at_12 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert!(window_open(Some(&window), at_23));
        assert!(window_open(Some(&window), at_2));
        assert!(!window_open(Some(&window), at_12));
    }

    #[test]
    fn test_stage_plan_parses() {
        let rollout = UpdateRollout {
            rollout_id: Uuid::nil(),
            release_id: Uuid::nil(),
            name: "r2".to_string(),
            stages: json!([{"percent": 5.0, "delay_hours": 24},
                           {"percent": 25.0, "delay_hours": 24},
                           {"percent": 100.0, "delay_hours": 0}]),
            failure_threshold_percent: 10.0,
            auto_rollback: true,
            maintenance_window: None,
            target_filter: None,
            status: RolloutStatus::Active,
            current_stage: 0,
            stage_started_at: None,
            stage_completed_at: None,
            created_at: Utc::now(),
        };
        let plan = rollout.stage_plan().unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].percent, 5.0);
        assert_eq!(plan[2].delay_hours, 0);
    }
}
