use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::account::{Account, NewAccount, NewTransaction, Transaction, TransactionStatus};
use crate::order::{NewOrder, Order, OrderStatus};
use crate::CoreResult;

/// Funds reserved and durably marked: the phase-1 output of a purchase.
#[derive(Debug, Clone)]
pub struct PurchaseReservation {
    pub order: Order,
    pub transaction: Transaction,
}

/// Provider result applied to an order when fulfillment succeeded.
#[derive(Debug, Clone)]
pub struct FulfillmentRecord {
    pub provider_reference: String,
    pub status: OrderStatus,
    pub delivered_payload: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Repository trait for wallet balance and transaction-log access.
///
/// Compound methods are single atomic units: the balance mutation and its
/// transaction row commit together or not at all. `debit_and_record` must use
/// an atomic conditional decrement; a caller-side sufficiency check is
/// advisory only.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn insert_account(&self, account: NewAccount) -> CoreResult<Account>;

    async fn get_account(&self, id: Uuid) -> CoreResult<Option<Account>>;

    async fn find_account_by_referral_code(&self, code: &str) -> CoreResult<Option<Account>>;

    /// Conditional decrement plus a completed debit row. Fails with
    /// `InsufficientFunds` and writes nothing when the balance cannot cover it.
    async fn debit_and_record(
        &self,
        account_id: Uuid,
        txn: NewTransaction,
    ) -> CoreResult<Transaction>;

    /// Unconditional increment plus a completed credit row.
    async fn credit_and_record(
        &self,
        account_id: Uuid,
        txn: NewTransaction,
    ) -> CoreResult<Transaction>;

    /// Insert a pending transaction with no balance movement (deposit init).
    async fn insert_pending(
        &self,
        account_id: Uuid,
        txn: NewTransaction,
    ) -> CoreResult<Transaction>;

    /// Apply a pending credit to the balance and complete it, stamping
    /// `balance_before`/`balance_after` at mutation time. Guarded on the
    /// pending status so a re-verification cannot credit twice.
    async fn complete_pending_credit(&self, reference: &str) -> CoreResult<Transaction>;

    async fn find_by_reference(&self, reference: &str) -> CoreResult<Option<Transaction>>;

    async fn mark_transaction(&self, id: Uuid, status: TransactionStatus) -> CoreResult<()>;

    async fn list_transactions(&self, account_id: Uuid) -> CoreResult<Vec<Transaction>>;
}

/// Repository trait for order data access.
///
/// The compound methods are the money-moving atomic units of the fulfillment
/// lifecycle; provider I/O never happens inside them.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Phase 1: conditional debit + pending debit row + pending order, one
    /// unit. The pending order is the durable marker the reconciliation
    /// sweep keys on.
    async fn reserve_purchase(
        &self,
        order: NewOrder,
        charge: NewTransaction,
    ) -> CoreResult<PurchaseReservation>;

    /// Phase 3, success: complete the charge and advance the order with the
    /// provider's result.
    async fn finalize_success(
        &self,
        order_id: Uuid,
        transaction_id: Uuid,
        record: FulfillmentRecord,
    ) -> CoreResult<Order>;

    /// Phase 3, definite failure: compensating credit + original charge
    /// marked failed + order failed with a reason, one unit.
    async fn finalize_failure(
        &self,
        order_id: Uuid,
        transaction_id: Uuid,
        refund: NewTransaction,
        reason: &str,
    ) -> CoreResult<Order>;

    /// Refund-and-close used by cancel, report-bad, expiry and
    /// provider-reported failures. The `from` set guards the transition, so
    /// a second close is an `InvalidTransition`, never a double refund.
    async fn close_with_refund(
        &self,
        order_id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
        refund: NewTransaction,
        reason: Option<&str>,
    ) -> CoreResult<Order>;

    /// Mark a live order completed with no money movement (finish/confirm).
    async fn set_completed(&self, order_id: Uuid) -> CoreResult<Order>;

    async fn get(&self, id: Uuid) -> CoreResult<Option<Order>>;

    /// Update status/payload of a live order after a status check; terminal
    /// orders are left untouched.
    async fn update_progress(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        delivered_payload: Option<String>,
    ) -> CoreResult<()>;

    async fn count_open(&self, account_id: Uuid) -> CoreResult<i64>;

    /// All non-terminal orders, for the reconciliation sweep.
    async fn list_unresolved(&self) -> CoreResult<Vec<Order>>;

    async fn list_for_account(&self, account_id: Uuid) -> CoreResult<Vec<Order>>;
}

#[derive(Debug, Clone)]
pub struct NewCommission {
    pub referred_account_id: Uuid,
    pub referrer_account_id: Uuid,
    pub source_transaction_id: Uuid,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct CommissionRecord {
    pub id: Uuid,
    pub referred_account_id: Uuid,
    pub referrer_account_id: Uuid,
    pub source_transaction_id: Uuid,
    pub credit_transaction_id: Uuid,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Repository trait for referral links and commission records.
#[async_trait]
pub trait ReferralRepository: Send + Sync {
    async fn referrer_of(&self, account_id: Uuid) -> CoreResult<Option<Uuid>>;

    /// Commissions already earned off this referred account.
    async fn commission_count(&self, referred_account_id: Uuid) -> CoreResult<i64>;

    /// Credit the referrer and insert the linked commission record, one unit.
    async fn record_commission(
        &self,
        commission: NewCommission,
        credit: NewTransaction,
    ) -> CoreResult<CommissionRecord>;
}

/// Outbound domain-event seam; the Kafka producer lives behind it so core
/// flows do not link a broker client.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> CoreResult<()>;
}

/// Cross-instance mutual exclusion for background sweeps; the Redis lock
/// lives behind it.
#[async_trait]
pub trait SweepLock: Send + Sync {
    /// Returns false when another holder has the lock.
    async fn acquire(&self, holder: &str, ttl_seconds: u64) -> CoreResult<bool>;

    /// Releases only if `holder` still owns the lock.
    async fn release(&self, holder: &str) -> CoreResult<bool>;
}
