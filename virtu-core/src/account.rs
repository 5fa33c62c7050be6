use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a ledger movement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "CREDIT",
            Direction::Debit => "DEBIT",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREDIT" => Ok(Direction::Credit),
            "DEBIT" => Ok(Direction::Debit),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Cancelled => "CANCELLED",
            TransactionStatus::Expired => "EXPIRED",
        }
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "COMPLETED" => Ok(TransactionStatus::Completed),
            "FAILED" => Ok(TransactionStatus::Failed),
            "CANCELLED" => Ok(TransactionStatus::Cancelled),
            "EXPIRED" => Ok(TransactionStatus::Expired),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

/// A wallet: one owner, one running balance, mutated only through the Ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub owner: String,
    /// Invariant: never negative.
    pub balance: Decimal,
    pub referral_code: String,
    pub referred_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub owner: String,
    pub referral_code: String,
    pub referred_by: Option<Uuid>,
}

/// Append-only ledger entry. Immutable once completed; corrections are new
/// compensating rows, never edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub direction: Direction,
    pub amount: Decimal,
    /// Stamped at mutation time; None while no balance has moved.
    pub balance_before: Option<Decimal>,
    pub balance_after: Option<Decimal>,
    pub status: TransactionStatus,
    /// Globally unique; the idempotency key for gateway callbacks.
    pub reference: String,
    pub payment_method: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for a transaction row; id, timestamps and balances are assigned by
/// the repository inside the atomic unit.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub direction: Direction,
    pub amount: Decimal,
    pub reference: String,
    pub payment_method: String,
    pub description: String,
}

impl NewTransaction {
    pub fn new(
        direction: Direction,
        amount: Decimal,
        payment_method: &str,
        description: &str,
    ) -> Self {
        Self {
            direction,
            amount,
            reference: generate_reference(),
            payment_method: payment_method.to_string(),
            description: description.to_string(),
        }
    }

    /// Debit charged against the wallet for a fulfillment purchase.
    pub fn purchase(amount: Decimal, description: &str) -> Self {
        Self::new(Direction::Debit, amount, "wallet", description)
    }

    /// Compensating credit returning funds to the wallet.
    pub fn refund(amount: Decimal, description: &str) -> Self {
        Self::new(Direction::Credit, amount, "wallet", description)
    }

    pub fn with_reference(mut self, reference: &str) -> Self {
        self.reference = reference.to_string();
        self
    }
}

/// Generate a unique transaction reference.
/// Format: VTX-{timestamp}-{short_uuid}
fn generate_reference() -> String {
    let timestamp = Utc::now().timestamp();
    let short_id = Uuid::new_v4().simple().to_string()[..12].to_uppercase();
    format!("VTX-{}-{}", timestamp, short_id)
}
