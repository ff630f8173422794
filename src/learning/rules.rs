//! L1 rule store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::fleet::HealingTier;

use super::{LearningError, Result};

/// Where a rule came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    /// Shipped with the agent
    Builtin,
    /// Promoted from a site's healing pattern with partner approval
    Promoted,
    /// Auto-promoted from a cross-client pattern
    Platform,
}

/// One deterministic remediation rule
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct L1Rule {
    /// Rule id; equals the runbook id agents report in telemetry
    pub rule_id: String,
    /// Structured incident match
    pub incident_pattern: Value,
    /// Canonical runbook the rule binds to
    pub runbook_id: String,
    /// Confidence carried from the promoting pattern
    pub confidence: f64,
    /// Whether agents should apply the rule
    pub enabled: bool,
    /// Rule provenance
    pub source: RuleSource,
    /// Telemetry-maintained match counter
    pub match_count: i64,
    /// Telemetry-maintained success counter
    pub success_count: i64,
    /// Telemetry-maintained failure counter
    pub failure_count: i64,
    /// Generated column: success_count / match_count
    pub success_rate: f64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last counter update
    pub updated_at: DateTime<Utc>,
}

const RULE_COLUMNS: &str =
    "rule_id, incident_pattern, runbook_id, confidence, enabled, source,
     match_count, success_count, failure_count, success_rate, created_at, updated_at";

/// CRUD over `l1_rules` plus runbook id reconciliation
#[derive(Clone)]
pub struct RuleStore {
    pool: PgPool,
}

impl RuleStore {
    /// Create a new rule store
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a rule. An existing `rule_id` is left untouched and the
    /// stored row is returned; duplicate registration is an expected
    /// conflict, not an error.
    pub async fn register(
        &self,
        rule_id: &str,
        incident_pattern: &Value,
        runbook_id: &str,
        confidence: f64,
        source: RuleSource,
    ) -> Result<L1Rule> {
        sqlx::query(
            "INSERT INTO l1_rules (rule_id, incident_pattern, runbook_id, confidence, source)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (rule_id) DO NOTHING",
        )
        .bind(rule_id)
        .bind(incident_pattern)
        .bind(runbook_id)
        .bind(confidence)
        .bind(source)
        .execute(&self.pool)
        .await?;

        self.get(rule_id).await
    }

    /// Fetch one rule
    pub async fn get(&self, rule_id: &str) -> Result<L1Rule> {
        sqlx::query_as::<_, L1Rule>(&format!(
            "SELECT {RULE_COLUMNS} FROM l1_rules WHERE rule_id = $1"
        ))
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LearningError::UnknownRule(rule_id.to_string()))
    }

    /// Enabled rules visible to a healing tier: the standard tier gets the
    /// builtin core set, full coverage gets everything.
    pub async fn list_for_tier(&self, tier: HealingTier) -> Result<Vec<L1Rule>> {
        let rows = match tier {
            HealingTier::Standard => {
                sqlx::query_as::<_, L1Rule>(&format!(
                    "SELECT {RULE_COLUMNS} FROM l1_rules
                     WHERE enabled AND source = 'builtin' ORDER BY rule_id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
            HealingTier::FullCoverage => {
                sqlx::query_as::<_, L1Rule>(&format!(
                    "SELECT {RULE_COLUMNS} FROM l1_rules
                     WHERE enabled ORDER BY rule_id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// Enable or disable a rule
    pub async fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE l1_rules SET enabled = $2, updated_at = now() WHERE rule_id = $1",
        )
        .bind(rule_id)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(LearningError::UnknownRule(rule_id.to_string()));
        }
        Ok(())
    }

    /// Record a mapping from an agent-internal rule id to its canonical
    /// runbook. Three namespaces exist historically (`L1-*` builtin,
    /// `RB-*` catalog, `RB-AUTO-*` promoted); they are reconciled here,
    /// never collapsed.
    pub async fn map_runbook_id(&self, l1_rule_id: &str, runbook_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO runbook_id_mappings (l1_rule_id, runbook_id)
             VALUES ($1, $2)
             ON CONFLICT (l1_rule_id) DO UPDATE SET runbook_id = EXCLUDED.runbook_id",
        )
        .bind(l1_rule_id)
        .bind(runbook_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resolve an agent-internal rule id to its canonical runbook, if mapped
    pub async fn resolve_runbook_id(&self, l1_rule_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT runbook_id FROM runbook_id_mappings WHERE l1_rule_id = $1",
        )
        .bind(l1_rule_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("runbook_id")))
    }
}
