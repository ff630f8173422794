//! Order data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The three kinds of order the control plane issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// Targets a single appliance
    Appliance,
    /// Targets every appliance in the fleet, skippable by version
    Fleet,
    /// Executes a runbook on a single appliance
    Healing,
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, not yet seen by the agent
    Pending,
    /// Agent has confirmed receipt
    Acknowledged,
    /// Agent reports the order running
    Executing,
    /// Terminal: succeeded
    Completed,
    /// Terminal: failed
    Failed,
    /// Terminal: TTL lapsed before execution
    Expired,
}

impl OrderStatus {
    /// Whether this status is terminal; terminal orders never transition
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Failed | OrderStatus::Expired
        )
    }
}

/// One stored order
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    /// Order identifier
    pub order_id: Uuid,
    /// Order kind
    pub kind: OrderKind,
    /// Target appliance (absent for fleet orders)
    pub appliance_id: Option<String>,
    /// Site of the target appliance, when known
    pub site_id: Option<String>,
    /// Command type the agent dispatches on
    pub command_type: String,
    /// Command parameters
    pub parameters: Value,
    /// Bound runbook for healing orders
    pub runbook_id: Option<String>,
    /// Fleet orders are skipped by appliances already at this version
    pub skip_version: Option<String>,
    /// Idempotent-upsert key for sync orders
    pub dedup_key: Option<String>,
    /// Replay-protection nonce, unique per order
    pub nonce: Uuid,
    /// Exact canonical bytes that were signed
    pub signed_payload: String,
    /// Hex Ed25519 signature over `signed_payload`
    pub signature: String,
    /// Issue timestamp
    pub issued_at: DateTime<Utc>,
    /// Expiry timestamp
    pub expires_at: DateTime<Utc>,
    /// Lifecycle status
    pub status: OrderStatus,
    /// Agent-reported result payload
    pub result: Option<Value>,
    /// Agent-reported error
    pub error: Option<String>,
    /// Issuer provenance
    pub created_by: String,
    /// When the agent acknowledged
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// When the order reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Row creation timestamp
    pub created_at: DateTime<Utc>,
}

/// The order representation delivered to agents at checkin.
///
/// Carries the signature and the exact signed payload so the agent can
/// verify without reconstructing canonical bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOrder {
    /// Order identifier
    pub order_id: Uuid,
    /// Command type
    #[serde(rename = "type")]
    pub command_type: String,
    /// Command parameters
    pub parameters: Value,
    /// Replay-protection nonce
    pub nonce: Uuid,
    /// Issue timestamp
    pub issued_at: DateTime<Utc>,
    /// Expiry timestamp
    pub expires_at: DateTime<Utc>,
    /// Hex Ed25519 signature
    pub signature: String,
    /// Exact signed bytes
    pub signed_payload: String,
}

impl From<Order> for WireOrder {
    fn from(order: Order) -> Self {
        Self {
            order_id: order.order_id,
            command_type: order.command_type,
            parameters: order.parameters,
            nonce: order.nonce,
            issued_at: order.issued_at,
            expires_at: order.expires_at,
            signature: order.signature,
            signed_payload: order.signed_payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Acknowledged.is_terminal());
        assert!(!OrderStatus::Executing.is_terminal());
    }

    #[test]
    fn test_wire_order_type_field_name() {
        let order = WireOrder {
            order_id: Uuid::nil(),
            command_type: "sync_promoted_rule".to_string(),
            parameters: serde_json::json!({}),
            nonce: Uuid::nil(),
            issued_at: Utc::now(),
            expires_at: Utc::now(),
            signature: String::new(),
            signed_payload: String::new(),
        };
        let json = serde_json::to_value(&order).unwrap();
        assert!(json.get("type").is_some());
        assert!(json.get("command_type").is_none());
    }
}
