//! Telemetry data model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Promotion eligibility thresholds: minimum occurrences
pub const PROMOTION_MIN_OCCURRENCES: i64 = 5;
/// Promotion eligibility thresholds: minimum success rate
pub const PROMOTION_MIN_SUCCESS_RATE: f64 = 0.90;
/// Promotion eligibility thresholds: recency window in days
pub const PROMOTION_RECENCY_DAYS: i64 = 7;

/// Which tier resolved an incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum ResolutionLevel {
    /// Deterministic rule
    L1,
    /// LLM-planned remediation
    L2,
    /// Human operator
    L3,
}

/// One runbook execution report from an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Agent-assigned execution id (idempotency key)
    pub execution_id: String,
    /// Incident the execution addressed
    #[serde(default)]
    pub incident_id: Option<String>,
    /// Reporting site
    pub site_id: String,
    /// Reporting appliance
    pub appliance_id: String,
    /// Runbook that ran. Raw agent-reported id; unresolved ids are stored
    /// as-is and reconciled through `runbook_id_mappings`.
    #[serde(default)]
    pub runbook_id: Option<String>,
    /// Affected endpoint hostname
    pub hostname: String,
    /// Endpoint platform
    pub platform: String,
    /// Incident classification
    pub incident_type: String,
    /// Whether remediation succeeded
    pub success: bool,
    /// Resolving tier
    pub resolution_level: ResolutionLevel,
    /// Wall-clock runbook duration
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    /// Endpoint state snapshot before remediation
    #[serde(default)]
    pub state_before: Option<Value>,
    /// Endpoint state snapshot after remediation
    #[serde(default)]
    pub state_after: Option<Value>,
    /// Structured diff of the two snapshots
    #[serde(default)]
    pub state_diff: Option<Value>,
    /// Failure classification when `success` is false
    #[serde(default)]
    pub failure_type: Option<String>,
    /// LLM spend for L2 executions
    #[serde(default)]
    pub cost_usd: Option<f64>,
    /// LLM input tokens for L2 executions
    #[serde(default)]
    pub input_tokens: Option<i64>,
    /// LLM output tokens for L2 executions
    #[serde(default)]
    pub output_tokens: Option<i64>,
    /// Aggregation key; computed when absent
    #[serde(default)]
    pub pattern_signature: Option<String>,
    /// Chaos campaign that provoked the incident, if any
    #[serde(default)]
    pub chaos_campaign_id: Option<String>,
}

impl TelemetryRecord {
    /// The canonical aggregation key: `incident_type:runbook_id:hostname`.
    pub fn effective_pattern_signature(&self) -> String {
        match &self.pattern_signature {
            Some(sig) => sig.clone(),
            None => format!(
                "{}:{}:{}",
                self.incident_type,
                self.runbook_id.as_deref().unwrap_or(""),
                self.hostname
            ),
        }
    }

    /// The cross-client aggregation key, when the record names a runbook.
    pub fn platform_pattern_key(&self) -> Option<String> {
        self.runbook_id
            .as_deref()
            .map(|runbook| format!("{}:{runbook}", self.incident_type))
    }
}

/// The promotion eligibility predicate, applied after every aggregate
/// update: enough occurrences, high enough success rate, recent enough.
pub fn promotion_eligible(
    total_occurrences: i64,
    success_rate: f64,
    last_seen: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    total_occurrences >= PROMOTION_MIN_OCCURRENCES
        && success_rate >= PROMOTION_MIN_SUCCESS_RATE
        && now - last_seen <= Duration::days(PROMOTION_RECENCY_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> TelemetryRecord {
        serde_json::from_value(json!({
            "execution_id": "ex-1",
            "site_id": "clinic-1",
            "appliance_id": "ap-001",
            "runbook_id": "RB-WIN-SEC-001",
            "hostname": "ws-07",
            "platform": "windows",
            "incident_type": "service_down",
            "success": true,
            "resolution_level": "L2"
        }))
        .unwrap()
    }

    #[test]
    fn test_signature_computed_when_absent() {
        assert_eq!(
            record().effective_pattern_signature(),
            "service_down:RB-WIN-SEC-001:ws-07"
        );
    }

    #[test]
    fn test_supplied_signature_wins() {
        let mut r = record();
        r.pattern_signature = Some("custom:sig:here".to_string());
        assert_eq!(r.effective_pattern_signature(), "custom:sig:here");
    }

    #[test]
    fn test_signature_with_unresolved_runbook() {
        let mut r = record();
        r.runbook_id = None;
        assert_eq!(r.effective_pattern_signature(), "service_down::ws-07");
        assert!(r.platform_pattern_key().is_none());
    }

    #[test]
    fn test_platform_key() {
        assert_eq!(
            record().platform_pattern_key().as_deref(),
            Some("service_down:RB-WIN-SEC-001")
        );
    }

    #[test]
    fn test_eligibility_thresholds() {
        let now = Utc::now();
        assert!(promotion_eligible(5, 0.90, now, now));
        assert!(!promotion_eligible(4, 1.0, now, now));
        assert!(!promotion_eligible(100, 0.899, now, now));
        assert!(!promotion_eligible(100, 1.0, now - Duration::days(8), now));
        assert!(promotion_eligible(100, 1.0, now - Duration::days(7), now));
    }
}
