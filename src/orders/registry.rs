//! Order creation, signing, dequeue, and lifecycle transitions.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::crypto::canonical::{canonical_json, canonical_timestamp};
use crate::crypto::signing::ControlPlaneSigner;

use super::models::{Order, OrderKind, OrderStatus};
use super::{OrderError, Result};

const ORDER_COLUMNS: &str =
    "order_id, kind, appliance_id, site_id, command_type, parameters, runbook_id,
     skip_version, dedup_key, nonce, signed_payload, signature, issued_at,
     expires_at, status, result, error, created_by, acknowledged_at,
     completed_at, created_at";

/// Parameters for creating one order
#[derive(Debug, Clone)]
pub struct NewOrder {
    /// Order kind
    pub kind: OrderKind,
    /// Target appliance (required unless fleet)
    pub appliance_id: Option<String>,
    /// Site context
    pub site_id: Option<String>,
    /// Command type
    pub command_type: String,
    /// Command parameters
    pub parameters: Value,
    /// Bound runbook for healing orders
    pub runbook_id: Option<String>,
    /// Version that lets fleet appliances skip this order
    pub skip_version: Option<String>,
    /// Idempotent-upsert key; orders sharing
    /// `(appliance_id, command_type, dedup_key)` collapse while open
    pub dedup_key: Option<String>,
    /// Time to live
    pub ttl: Duration,
    /// Issuer provenance
    pub created_by: String,
}

impl NewOrder {
    /// An appliance-targeted order with the given command and TTL
    pub fn appliance(appliance_id: &str, command_type: &str, parameters: Value, ttl: Duration) -> Self {
        Self {
            kind: OrderKind::Appliance,
            appliance_id: Some(appliance_id.to_string()),
            site_id: None,
            command_type: command_type.to_string(),
            parameters,
            runbook_id: None,
            skip_version: None,
            dedup_key: None,
            ttl,
            created_by: "control-plane".to_string(),
        }
    }

    /// A fleet-wide order
    pub fn fleet(command_type: &str, parameters: Value, ttl: Duration) -> Self {
        Self {
            kind: OrderKind::Fleet,
            appliance_id: None,
            site_id: None,
            command_type: command_type.to_string(),
            parameters,
            runbook_id: None,
            skip_version: None,
            dedup_key: None,
            ttl,
            created_by: "control-plane".to_string(),
        }
    }

    /// A runbook-bound healing order
    pub fn healing(appliance_id: &str, runbook_id: &str, parameters: Value, ttl: Duration) -> Self {
        Self {
            kind: OrderKind::Healing,
            appliance_id: Some(appliance_id.to_string()),
            site_id: None,
            command_type: "execute_runbook".to_string(),
            parameters,
            runbook_id: Some(runbook_id.to_string()),
            skip_version: None,
            dedup_key: None,
            ttl,
            created_by: "control-plane".to_string(),
        }
    }
}

/// Outcome of an acknowledge or result report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The transition applied
    Applied,
    /// The order was already terminal; replay dropped silently
    AlreadyTerminal,
    /// The `(order_id, nonce)` pair did not match any order for this appliance
    Mismatch,
}

/// Creates, signs, delivers, and retires orders
#[derive(Clone)]
pub struct OrderManager {
    pool: PgPool,
}

impl OrderManager {
    /// Create a new order manager
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build the canonical payload an order signature covers.
    ///
    /// Deterministic JSON of the order's identity and command; agents
    /// recompute this exact string to verify the signature.
    pub fn signed_payload(
        order_id: Uuid,
        target: &str,
        command_type: &str,
        parameters: &Value,
        nonce: Uuid,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> String {
        canonical_json(&json!({
            "order_id": order_id.to_string(),
            "target": target,
            "type": command_type,
            "parameters": parameters,
            "nonce": nonce.to_string(),
            "issued_at": canonical_timestamp(issued_at),
            "expires_at": canonical_timestamp(expires_at),
        }))
    }

    /// Create and sign an order.
    ///
    /// When `dedup_key` is set and an open order with the same
    /// `(appliance_id, command_type, dedup_key)` exists, the existing order
    /// is returned and nothing new is inserted.
    pub async fn create(&self, new: NewOrder) -> Result<Order> {
        let order_id = Uuid::new_v4();
        let nonce = Uuid::new_v4();
        let issued_at = Utc::now();
        let expires_at = issued_at + new.ttl;
        let target = new.appliance_id.as_deref().unwrap_or("fleet");

        let payload = Self::signed_payload(
            order_id,
            target,
            &new.command_type,
            &new.parameters,
            nonce,
            issued_at,
            expires_at,
        );
        let signature = ControlPlaneSigner::global()?.sign_hex(payload.as_bytes());

        // The conflict clause mirrors idx_orders_dedup's predicate so
        // Postgres infers the arbiter index.
        let inserted = sqlx::query(
            "INSERT INTO orders (order_id, kind, appliance_id, site_id, command_type,
                                 parameters, runbook_id, skip_version, dedup_key, nonce,
                                 signed_payload, signature, issued_at, expires_at, created_by)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
             ON CONFLICT (appliance_id, command_type, dedup_key)
                WHERE dedup_key IS NOT NULL
                  AND status IN ('pending', 'acknowledged', 'executing')
             DO NOTHING",
        )
        .bind(order_id)
        .bind(new.kind)
        .bind(&new.appliance_id)
        .bind(&new.site_id)
        .bind(&new.command_type)
        .bind(&new.parameters)
        .bind(&new.runbook_id)
        .bind(&new.skip_version)
        .bind(&new.dedup_key)
        .bind(nonce)
        .bind(&payload)
        .bind(&signature)
        .bind(issued_at)
        .bind(expires_at)
        .bind(&new.created_by)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            // Deduped against an existing open sync order
            let existing = sqlx::query_as::<_, Order>(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE appliance_id = $1 AND command_type = $2 AND dedup_key = $3
                   AND status IN ('pending', 'acknowledged', 'executing')"
            ))
            .bind(&new.appliance_id)
            .bind(&new.command_type)
            .bind(&new.dedup_key)
            .fetch_one(&self.pool)
            .await?;
            return Ok(existing);
        }

        self.get(order_id).await
    }

    /// Fetch one order
    pub async fn get(&self, order_id: Uuid) -> Result<Order> {
        sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(OrderError::UnknownOrder(order_id))
    }

    /// Every order due for an appliance at checkin.
    ///
    /// Pending, unexpired orders targeting the appliance directly, plus
    /// fleet orders the appliance has not completed and whose
    /// `skip_version` is not its reported agent version. Dequeue does not
    /// consume: the same set reappears until acknowledged or expired.
    pub async fn dequeue_for_appliance(
        &self,
        appliance_id: &str,
        agent_version: &str,
    ) -> Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE status = 'pending' AND expires_at > now()
               AND (appliance_id = $1
                    OR (kind = 'fleet'
                        AND (skip_version IS NULL OR skip_version <> $2)
                        AND NOT EXISTS (
                            SELECT 1 FROM fleet_order_completions c
                            WHERE c.fleet_order_id = orders.order_id
                              AND c.appliance_id = $1)))
             ORDER BY issued_at"
        ))
        .bind(appliance_id)
        .bind(agent_version)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Agent confirms receipt: `pending -> acknowledged`.
    pub async fn acknowledge(
        &self,
        order_id: Uuid,
        nonce: Uuid,
        appliance_id: &str,
    ) -> Result<AckOutcome> {
        let updated = sqlx::query(
            "UPDATE orders SET status = 'acknowledged', acknowledged_at = now()
             WHERE order_id = $1 AND nonce = $2 AND status = 'pending'
               AND (appliance_id = $3 OR kind = 'fleet')",
        )
        .bind(order_id)
        .bind(nonce)
        .bind(appliance_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            return Ok(AckOutcome::Applied);
        }
        self.classify_miss(order_id, nonce).await
    }

    /// Agent reports the order running: `acknowledged -> executing`.
    pub async fn mark_executing(
        &self,
        order_id: Uuid,
        nonce: Uuid,
        appliance_id: &str,
    ) -> Result<AckOutcome> {
        let updated = sqlx::query(
            "UPDATE orders SET status = 'executing'
             WHERE order_id = $1 AND nonce = $2
               AND status IN ('pending', 'acknowledged')
               AND (appliance_id = $3 OR kind = 'fleet')",
        )
        .bind(order_id)
        .bind(nonce)
        .bind(appliance_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            return Ok(AckOutcome::Applied);
        }
        self.classify_miss(order_id, nonce).await
    }

    /// Agent reports a terminal result.
    ///
    /// Appliance and healing orders transition in place; fleet orders
    /// record a per-appliance completion row instead, leaving the fleet
    /// order itself pending for the rest of the fleet.
    pub async fn report_result(
        &self,
        order_id: Uuid,
        nonce: Uuid,
        appliance_id: &str,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<AckOutcome> {
        let order = match self.get(order_id).await {
            Ok(order) => order,
            Err(OrderError::UnknownOrder(_)) => return Ok(AckOutcome::Mismatch),
            Err(e) => return Err(e),
        };
        if order.nonce != nonce {
            return Ok(AckOutcome::Mismatch);
        }

        if order.kind == OrderKind::Fleet {
            let inserted = sqlx::query(
                "INSERT INTO fleet_order_completions (fleet_order_id, appliance_id, status, result)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (fleet_order_id, appliance_id) DO NOTHING",
            )
            .bind(order_id)
            .bind(appliance_id)
            .bind(if success { "completed" } else { "failed" })
            .bind(&result)
            .execute(&self.pool)
            .await?;
            return Ok(if inserted.rows_affected() > 0 {
                AckOutcome::Applied
            } else {
                AckOutcome::AlreadyTerminal
            });
        }

        let status = if success {
            OrderStatus::Completed
        } else {
            OrderStatus::Failed
        };
        let updated = sqlx::query(
            "UPDATE orders
             SET status = $4, result = $5, error = $6, completed_at = now()
             WHERE order_id = $1 AND nonce = $2 AND appliance_id = $3
               AND status IN ('pending', 'acknowledged', 'executing')",
        )
        .bind(order_id)
        .bind(nonce)
        .bind(appliance_id)
        .bind(status)
        .bind(&result)
        .bind(&error)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            return Ok(AckOutcome::Applied);
        }
        self.classify_miss(order_id, nonce).await
    }

    /// Cancel an order that has not been picked up yet.
    ///
    /// Only `pending` orders are cancellable; once acknowledged, the
    /// outcome comes back through the agent's result report.
    pub async fn cancel(&self, order_id: Uuid, cancelled_by: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE orders
             SET status = 'failed', error = 'cancelled by ' || $2, completed_at = now()
             WHERE order_id = $1 AND status = 'pending'",
        )
        .bind(order_id)
        .bind(cancelled_by)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            // Distinguish unknown from non-pending for the operator surface
            self.get(order_id).await?;
            return Err(OrderError::NotPending(order_id));
        }
        Ok(())
    }

    /// Flip pending orders past their TTL to `expired`. Returns the count.
    pub async fn expire_sweep(&self) -> Result<u64> {
        let updated = sqlx::query(
            "UPDATE orders SET status = 'expired', completed_at = now()
             WHERE status = 'pending' AND expires_at <= now()",
        )
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }

    async fn classify_miss(&self, order_id: Uuid, nonce: Uuid) -> Result<AckOutcome> {
        match self.get(order_id).await {
            Ok(order) if order.nonce == nonce && order.status.is_terminal() => {
                Ok(AckOutcome::AlreadyTerminal)
            }
            Ok(_) => Ok(AckOutcome::Mismatch),
            Err(OrderError::UnknownOrder(_)) => Ok(AckOutcome::Mismatch),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_payload_is_canonical() {
        let order_id = Uuid::parse_str("0a0b0c0d-0000-0000-0000-000000000001").unwrap();
        let nonce = Uuid::parse_str("0a0b0c0d-0000-0000-0000-000000000002").unwrap();
        let issued = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let expires = issued + Duration::hours(1);

        let payload = OrderManager::signed_payload(
            order_id,
            "ap-001",
            "restart_service",
            &json!({"service": "winrm"}),
            nonce,
            issued,
            expires,
        );

        assert_eq!(
            payload,
            "{\"expires_at\":\"2026-01-02T04:04:05Z\",\
             \"issued_at\":\"2026-01-02T03:04:05Z\",\
             \"nonce\":\"0a0b0c0d-0000-0000-0000-000000000002\",\
             \"order_id\":\"0a0b0c0d-0000-0000-0000-000000000001\",\
             \"parameters\":{\"service\":\"winrm\"},\
             \"target\":\"ap-001\",\
             \"type\":\"restart_service\"}"
        );
    }

    #[test]
    fn test_signed_payload_deterministic() {
        let order_id = Uuid::new_v4();
        let nonce = Uuid::new_v4();
        let now = Utc::now();
        let later = now + Duration::minutes(30);
        let a = OrderManager::signed_payload(
            order_id, "fleet", "update_agent", &json!({"v": 2}), nonce, now, later,
        );
        let b = OrderManager::signed_payload(
            order_id, "fleet", "update_agent", &json!({"v": 2}), nonce, now, later,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_new_order_builders() {
        let o = NewOrder::healing("ap-1", "RB-WIN-SEC-001", json!({}), Duration::hours(2));
        assert_eq!(o.kind, OrderKind::Healing);
        assert_eq!(o.command_type, "execute_runbook");
        assert_eq!(o.runbook_id.as_deref(), Some("RB-WIN-SEC-001"));

        let f = NewOrder::fleet("refresh_rules", json!({}), Duration::hours(1));
        assert_eq!(f.kind, OrderKind::Fleet);
        assert!(f.appliance_id.is_none());
    }
}
