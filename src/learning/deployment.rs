//! Promoted rule delivery.
//!
//! Each `(rule_id, appliance_id)` deployment row tracks
//! `pending -> delivered -> acknowledged`. Delivery is a signed
//! `sync_promoted_rule` appliance order carrying the rule YAML; revoked
//! rules travel as `remove_promoted_rule` orders and land in
//! `rolled_back`.

use chrono::Duration;
use serde_json::json;
use sqlx::{PgPool, Row};

use crate::orders::{NewOrder, OrderKind, OrderManager};

use super::promotion::PromotionController;
use super::Result;

/// Order TTL for rule sync
const SYNC_ORDER_TTL_HOURS: i64 = 24;

/// Drives deployment rows to their terminal state via signed orders
#[derive(Clone)]
pub struct RuleSyncService {
    pool: PgPool,
    orders: OrderManager,
    promotion: PromotionController,
}

impl RuleSyncService {
    /// Create a new sync service
    pub fn new(pool: PgPool, orders: OrderManager, promotion: PromotionController) -> Self {
        Self {
            pool,
            orders,
            promotion,
        }
    }

    /// Create sync orders for every pending deployment. The dedup key makes
    /// re-runs idempotent: an open order per `(appliance, rule)` absorbs
    /// repeats. Returns the number of deployments moved to `delivered`.
    pub async fn deliver_pending(&self) -> Result<u64> {
        let pending = sqlx::query(
            "SELECT d.rule_id, d.appliance_id, p.rule_yaml, p.confidence
             FROM promoted_rule_deployments d
             JOIN promoted_rules p ON p.rule_id = d.rule_id
             WHERE d.status = 'pending' AND p.revoked_at IS NULL
             ORDER BY d.updated_at",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut delivered = 0u64;
        for row in pending {
            let rule_id: String = row.get("rule_id");
            let appliance_id: String = row.get("appliance_id");
            let rule_yaml: String = row.get("rule_yaml");
            let confidence: f64 = row.get("confidence");

            let order = self
                .orders
                .create(NewOrder {
                    kind: OrderKind::Appliance,
                    appliance_id: Some(appliance_id.clone()),
                    site_id: None,
                    command_type: "sync_promoted_rule".to_string(),
                    parameters: json!({
                        "rule_id": rule_id,
                        "rule_yaml": rule_yaml,
                        "confidence": confidence,
                    }),
                    runbook_id: None,
                    skip_version: None,
                    dedup_key: Some(rule_id.clone()),
                    ttl: Duration::hours(SYNC_ORDER_TTL_HOURS),
                    created_by: "rule-sync".to_string(),
                })
                .await?;

            sqlx::query(
                "UPDATE promoted_rule_deployments
                 SET status = 'delivered', order_id = $3, updated_at = now()
                 WHERE rule_id = $1 AND appliance_id = $2 AND status = 'pending'",
            )
            .bind(&rule_id)
            .bind(&appliance_id)
            .bind(order.order_id)
            .execute(&self.pool)
            .await?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Create removal orders for deployments of revoked rules. Returns the
    /// number of removal orders issued.
    pub async fn deliver_revocations(&self) -> Result<u64> {
        let revoked = sqlx::query(
            "SELECT d.rule_id, d.appliance_id
             FROM promoted_rule_deployments d
             JOIN promoted_rules p ON p.rule_id = d.rule_id
             WHERE p.revoked_at IS NOT NULL
               AND d.status IN ('delivered', 'acknowledged')",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut issued = 0u64;
        for row in revoked {
            let rule_id: String = row.get("rule_id");
            let appliance_id: String = row.get("appliance_id");

            self.orders
                .create(NewOrder {
                    kind: OrderKind::Appliance,
                    appliance_id: Some(appliance_id.clone()),
                    site_id: None,
                    command_type: "remove_promoted_rule".to_string(),
                    parameters: json!({ "rule_id": rule_id }),
                    runbook_id: None,
                    skip_version: None,
                    dedup_key: Some(format!("remove:{rule_id}")),
                    ttl: Duration::hours(SYNC_ORDER_TTL_HOURS),
                    created_by: "rule-sync".to_string(),
                })
                .await?;
            issued += 1;
        }
        Ok(issued)
    }

    /// Apply an agent's result for a rule sync order. Called from the order
    /// result path; non-sync orders are ignored.
    pub async fn handle_order_result(
        &self,
        command_type: &str,
        parameters: &serde_json::Value,
        appliance_id: &str,
        success: bool,
    ) -> Result<()> {
        let Some(rule_id) = parameters.get("rule_id").and_then(|v| v.as_str()) else {
            return Ok(());
        };

        match (command_type, success) {
            ("sync_promoted_rule", true) => {
                sqlx::query(
                    "UPDATE promoted_rule_deployments
                     SET status = 'acknowledged', updated_at = now()
                     WHERE rule_id = $1 AND appliance_id = $2 AND status = 'delivered'",
                )
                .bind(rule_id)
                .bind(appliance_id)
                .execute(&self.pool)
                .await?;
                self.promotion.mark_deployed(rule_id).await?;
            }
            ("sync_promoted_rule", false) => {
                // Back to pending; the next delivery pass retries
                sqlx::query(
                    "UPDATE promoted_rule_deployments
                     SET status = 'pending', updated_at = now()
                     WHERE rule_id = $1 AND appliance_id = $2 AND status = 'delivered'",
                )
                .bind(rule_id)
                .bind(appliance_id)
                .execute(&self.pool)
                .await?;
            }
            ("remove_promoted_rule", true) => {
                sqlx::query(
                    "UPDATE promoted_rule_deployments
                     SET status = 'rolled_back', updated_at = now()
                     WHERE rule_id = $1 AND appliance_id = $2",
                )
                .bind(rule_id)
                .bind(appliance_id)
                .execute(&self.pool)
                .await?;
            }
            _ => {}
        }
        Ok(())
    }
}
