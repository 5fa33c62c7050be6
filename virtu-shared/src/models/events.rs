use rust_decimal::Decimal;
use uuid::Uuid;

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct TransactionCompletedEvent {
    pub transaction_id: Uuid,
    pub account_id: Uuid,
    pub direction: String,
    pub amount: Decimal,
    pub reference: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct OrderStatusChangedEvent {
    pub order_id: Uuid,
    pub account_id: Uuid,
    pub kind: super::kind::ProductKind,
    pub status: String,
    pub provider_identifier: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct CommissionEarnedEvent {
    pub referrer_account_id: Uuid,
    pub referred_account_id: Uuid,
    pub source_transaction_id: Uuid,
    pub amount: Decimal,
    pub timestamp: i64,
}
