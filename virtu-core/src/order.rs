use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use virtu_shared::ProductKind;

/// Order status in the fulfillment lifecycle.
///
/// `Pending -> Processing -> {Completed | Failed}`, with side exits
/// `Cancelled`, `Refunded`, `Expired` reachable from the two live states.
/// Terminal states are never mutated again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed
                | OrderStatus::Failed
                | OrderStatus::Cancelled
                | OrderStatus::Refunded
                | OrderStatus::Expired
        )
    }

    /// States a cancel request may start from.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Processing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
            OrderStatus::Expired => "EXPIRED",
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "COMPLETED" => Ok(OrderStatus::Completed),
            "FAILED" => Ok(OrderStatus::Failed),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            "REFUNDED" => Ok(OrderStatus::Refunded),
            "EXPIRED" => Ok(OrderStatus::Expired),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// One fulfillment request and its lifecycle.
///
/// An order exists only after funds were reserved: its paired debit
/// transaction is created in the same atomic unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: ProductKind,
    pub status: OrderStatus,
    pub amount_charged: Decimal,
    pub provider_identifier: String,
    /// Upstream order id; absent until the provider accepted the request.
    pub provider_reference: Option<String>,
    pub item_code: String,
    pub region: String,
    pub delivered_payload: Option<String>,
    pub failure_reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// The debit transaction that reserved the funds.
    pub transaction_id: Uuid,
    /// Carries the pricing-policy snapshot used at charge time.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub account_id: Uuid,
    pub kind: ProductKind,
    pub amount_charged: Decimal,
    pub provider_identifier: String,
    pub item_code: String,
    pub region: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Processing.is_terminal());
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Refunded.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
    }

    #[test]
    fn test_cancellable_states() {
        assert!(OrderStatus::Pending.is_cancellable());
        assert!(OrderStatus::Processing.is_cancellable());
        assert!(!OrderStatus::Completed.is_cancellable());
        assert!(!OrderStatus::Cancelled.is_cancellable());
    }
}
