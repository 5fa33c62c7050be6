use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use virtu_core::account::{
    Account, Direction, NewAccount, NewTransaction, Transaction, TransactionStatus,
};
use virtu_core::order::{NewOrder, Order, OrderStatus};
use virtu_core::repository::{
    CommissionRecord, FulfillmentRecord, LedgerRepository, NewCommission, OrderRepository,
    PurchaseReservation, ReferralRepository,
};
use virtu_core::{CoreError, CoreResult};

#[derive(Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    transactions: Vec<Transaction>,
    orders: HashMap<Uuid, Order>,
    commissions: Vec<CommissionRecord>,
}

/// In-memory implementation of all repository traits, used by tests and
/// local runs. One mutex guards the whole state, so every compound method is
/// an atomic unit exactly like its Postgres counterpart.
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn build_transaction(
    account_id: Uuid,
    txn: NewTransaction,
    status: TransactionStatus,
    balance_before: Option<Decimal>,
    balance_after: Option<Decimal>,
) -> Transaction {
    let now = Utc::now();
    Transaction {
        id: Uuid::new_v4(),
        account_id,
        direction: txn.direction,
        amount: txn.amount,
        balance_before,
        balance_after,
        status,
        reference: txn.reference,
        payment_method: txn.payment_method,
        description: txn.description,
        created_at: now,
        updated_at: now,
    }
}

impl State {
    fn ensure_unique_reference(&self, reference: &str) -> CoreResult<()> {
        if self.transactions.iter().any(|t| t.reference == reference) {
            return Err(CoreError::Storage(format!(
                "duplicate transaction reference {}",
                reference
            )));
        }
        Ok(())
    }

    /// Conditional decrement; the caller picks the resulting row status.
    fn debit(
        &mut self,
        account_id: Uuid,
        txn: NewTransaction,
        status: TransactionStatus,
    ) -> CoreResult<Transaction> {
        self.ensure_unique_reference(&txn.reference)?;
        let account = self
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| CoreError::NotFound(format!("account {}", account_id)))?;
        if account.balance < txn.amount {
            return Err(CoreError::InsufficientFunds {
                requested: txn.amount,
                available: account.balance,
            });
        }
        let before = account.balance;
        account.balance -= txn.amount;
        account.updated_at = Utc::now();
        let after = account.balance;
        let transaction = build_transaction(account_id, txn, status, Some(before), Some(after));
        self.transactions.push(transaction.clone());
        Ok(transaction)
    }

    fn credit(&mut self, account_id: Uuid, txn: NewTransaction) -> CoreResult<Transaction> {
        self.ensure_unique_reference(&txn.reference)?;
        let account = self
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| CoreError::NotFound(format!("account {}", account_id)))?;
        let before = account.balance;
        account.balance += txn.amount;
        account.updated_at = Utc::now();
        let after = account.balance;
        let transaction = build_transaction(
            account_id,
            txn,
            TransactionStatus::Completed,
            Some(before),
            Some(after),
        );
        self.transactions.push(transaction.clone());
        Ok(transaction)
    }

    fn mark_transaction(&mut self, id: Uuid, status: TransactionStatus) -> CoreResult<()> {
        let txn = self
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("transaction {}", id)))?;
        txn.status = status;
        txn.updated_at = Utc::now();
        Ok(())
    }

    fn live_order_mut(&mut self, order_id: Uuid) -> CoreResult<&mut Order> {
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| CoreError::NotFound(format!("order {}", order_id)))?;
        if order.status.is_terminal() {
            return Err(CoreError::InvalidTransition(format!(
                "order {} is {}",
                order_id,
                order.status.as_str()
            )));
        }
        Ok(order)
    }
}

#[async_trait]
impl LedgerRepository for MemoryRepository {
    async fn insert_account(&self, account: NewAccount) -> CoreResult<Account> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let record = Account {
            id: Uuid::new_v4(),
            owner: account.owner,
            balance: Decimal::ZERO,
            referral_code: account.referral_code,
            referred_by: account.referred_by,
            created_at: now,
            updated_at: now,
        };
        state.accounts.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_account(&self, id: Uuid) -> CoreResult<Option<Account>> {
        Ok(self.state.lock().unwrap().accounts.get(&id).cloned())
    }

    async fn find_account_by_referral_code(&self, code: &str) -> CoreResult<Option<Account>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .accounts
            .values()
            .find(|a| a.referral_code == code)
            .cloned())
    }

    async fn debit_and_record(
        &self,
        account_id: Uuid,
        txn: NewTransaction,
    ) -> CoreResult<Transaction> {
        self.state
            .lock()
            .unwrap()
            .debit(account_id, txn, TransactionStatus::Completed)
    }

    async fn credit_and_record(
        &self,
        account_id: Uuid,
        txn: NewTransaction,
    ) -> CoreResult<Transaction> {
        self.state.lock().unwrap().credit(account_id, txn)
    }

    async fn insert_pending(
        &self,
        account_id: Uuid,
        txn: NewTransaction,
    ) -> CoreResult<Transaction> {
        let mut state = self.state.lock().unwrap();
        state.ensure_unique_reference(&txn.reference)?;
        if !state.accounts.contains_key(&account_id) {
            return Err(CoreError::NotFound(format!("account {}", account_id)));
        }
        let transaction =
            build_transaction(account_id, txn, TransactionStatus::Pending, None, None);
        state.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn complete_pending_credit(&self, reference: &str) -> CoreResult<Transaction> {
        let mut state = self.state.lock().unwrap();
        let index = state
            .transactions
            .iter()
            .position(|t| t.reference == reference)
            .ok_or_else(|| CoreError::NotFound(format!("transaction {}", reference)))?;
        {
            let txn = &state.transactions[index];
            if txn.status != TransactionStatus::Pending || txn.direction != Direction::Credit {
                return Err(CoreError::InvalidTransition(format!(
                    "transaction {} is not a pending credit",
                    reference
                )));
            }
        }
        let (account_id, amount) = {
            let txn = &state.transactions[index];
            (txn.account_id, txn.amount)
        };
        let (before, after) = {
            let account = state
                .accounts
                .get_mut(&account_id)
                .ok_or_else(|| CoreError::NotFound(format!("account {}", account_id)))?;
            let before = account.balance;
            account.balance += amount;
            account.updated_at = Utc::now();
            (before, account.balance)
        };
        let txn = &mut state.transactions[index];
        txn.status = TransactionStatus::Completed;
        txn.balance_before = Some(before);
        txn.balance_after = Some(after);
        txn.updated_at = Utc::now();
        Ok(txn.clone())
    }

    async fn find_by_reference(&self, reference: &str) -> CoreResult<Option<Transaction>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .transactions
            .iter()
            .find(|t| t.reference == reference)
            .cloned())
    }

    async fn mark_transaction(&self, id: Uuid, status: TransactionStatus) -> CoreResult<()> {
        self.state.lock().unwrap().mark_transaction(id, status)
    }

    async fn list_transactions(&self, account_id: Uuid) -> CoreResult<Vec<Transaction>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OrderRepository for MemoryRepository {
    async fn reserve_purchase(
        &self,
        order: NewOrder,
        charge: NewTransaction,
    ) -> CoreResult<PurchaseReservation> {
        let mut state = self.state.lock().unwrap();
        let transaction =
            state.debit(order.account_id, charge, TransactionStatus::Pending)?;
        let now = Utc::now();
        let record = Order {
            id: Uuid::new_v4(),
            account_id: order.account_id,
            kind: order.kind,
            status: OrderStatus::Pending,
            amount_charged: order.amount_charged,
            provider_identifier: order.provider_identifier,
            provider_reference: None,
            item_code: order.item_code,
            region: order.region,
            delivered_payload: None,
            failure_reason: None,
            expires_at: order.expires_at,
            transaction_id: transaction.id,
            metadata: order.metadata,
            created_at: now,
            updated_at: now,
        };
        state.orders.insert(record.id, record.clone());
        Ok(PurchaseReservation {
            order: record,
            transaction,
        })
    }

    async fn finalize_success(
        &self,
        order_id: Uuid,
        transaction_id: Uuid,
        record: FulfillmentRecord,
    ) -> CoreResult<Order> {
        let mut state = self.state.lock().unwrap();
        state.mark_transaction(transaction_id, TransactionStatus::Completed)?;
        let order = state.live_order_mut(order_id)?;
        order.provider_reference = Some(record.provider_reference);
        order.status = record.status;
        order.delivered_payload = record.delivered_payload;
        if record.expires_at.is_some() {
            order.expires_at = record.expires_at;
        }
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn finalize_failure(
        &self,
        order_id: Uuid,
        transaction_id: Uuid,
        refund: NewTransaction,
        reason: &str,
    ) -> CoreResult<Order> {
        let mut state = self.state.lock().unwrap();
        // Transition first; a second call fails here before any credit.
        let account_id = {
            let order = state.live_order_mut(order_id)?;
            order.status = OrderStatus::Failed;
            order.failure_reason = Some(reason.to_string());
            order.updated_at = Utc::now();
            order.account_id
        };
        state.credit(account_id, refund)?;
        state.mark_transaction(transaction_id, TransactionStatus::Failed)?;
        Ok(state.orders[&order_id].clone())
    }

    async fn close_with_refund(
        &self,
        order_id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
        refund: NewTransaction,
        reason: Option<&str>,
    ) -> CoreResult<Order> {
        let mut state = self.state.lock().unwrap();
        let (account_id, current) = {
            let order = state
                .orders
                .get(&order_id)
                .ok_or_else(|| CoreError::NotFound(format!("order {}", order_id)))?;
            (order.account_id, order.status)
        };
        if !from.contains(&current) {
            return Err(CoreError::InvalidTransition(format!(
                "order {} is {}",
                order_id,
                current.as_str()
            )));
        }
        state.credit(account_id, refund)?;
        let order = state.orders.get_mut(&order_id).unwrap();
        order.status = to;
        if let Some(reason) = reason {
            order.failure_reason = Some(reason.to_string());
        }
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn set_completed(&self, order_id: Uuid) -> CoreResult<Order> {
        let mut state = self.state.lock().unwrap();
        let order = state.live_order_mut(order_id)?;
        order.status = OrderStatus::Completed;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Order>> {
        Ok(self.state.lock().unwrap().orders.get(&id).cloned())
    }

    async fn update_progress(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        delivered_payload: Option<String>,
    ) -> CoreResult<()> {
        let mut state = self.state.lock().unwrap();
        let order = state.live_order_mut(order_id)?;
        order.status = status;
        if delivered_payload.is_some() {
            order.delivered_payload = delivered_payload;
        }
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn count_open(&self, account_id: Uuid) -> CoreResult<i64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| o.account_id == account_id && !o.status.is_terminal())
            .count() as i64)
    }

    async fn list_unresolved(&self) -> CoreResult<Vec<Order>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_for_account(&self, account_id: Uuid) -> CoreResult<Vec<Order>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| o.account_id == account_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ReferralRepository for MemoryRepository {
    async fn referrer_of(&self, account_id: Uuid) -> CoreResult<Option<Uuid>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .accounts
            .get(&account_id)
            .and_then(|a| a.referred_by))
    }

    async fn commission_count(&self, referred_account_id: Uuid) -> CoreResult<i64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .commissions
            .iter()
            .filter(|c| c.referred_account_id == referred_account_id)
            .count() as i64)
    }

    async fn record_commission(
        &self,
        commission: NewCommission,
        credit: NewTransaction,
    ) -> CoreResult<CommissionRecord> {
        let mut state = self.state.lock().unwrap();
        let transaction = state.credit(commission.referrer_account_id, credit)?;
        let record = CommissionRecord {
            id: Uuid::new_v4(),
            referred_account_id: commission.referred_account_id,
            referrer_account_id: commission.referrer_account_id,
            source_transaction_id: commission.source_transaction_id,
            credit_transaction_id: transaction.id,
            amount: commission.amount,
            created_at: Utc::now(),
        };
        state.commissions.push(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_order(account_id: Uuid, amount: i64) -> NewOrder {
        NewOrder {
            account_id,
            kind: virtu_shared::ProductKind::TempNumber,
            amount_charged: Decimal::from(amount),
            provider_identifier: "alpha".to_string(),
            item_code: "whatsapp".to_string(),
            region: "ng".to_string(),
            expires_at: None,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_reserve_purchase_is_conditional() {
        let repo = MemoryRepository::new();
        let account = repo
            .insert_account(NewAccount {
                owner: "user".to_string(),
                referral_code: "REF-A".to_string(),
                referred_by: None,
            })
            .await
            .unwrap();
        repo.credit_and_record(
            account.id,
            NewTransaction::refund(Decimal::from(500), "Seed"),
        )
        .await
        .unwrap();

        let reservation = repo
            .reserve_purchase(
                new_order(account.id, 300),
                NewTransaction::purchase(Decimal::from(300), "Purchase"),
            )
            .await
            .unwrap();
        assert_eq!(reservation.order.status, OrderStatus::Pending);
        assert_eq!(
            reservation.transaction.status,
            TransactionStatus::Pending
        );

        let err = repo
            .reserve_purchase(
                new_order(account.id, 300),
                NewTransaction::purchase(Decimal::from(300), "Purchase"),
            )
            .await
            .unwrap_err();
        // The error reports what is actually left, not a placeholder.
        match err {
            CoreError::InsufficientFunds {
                requested,
                available,
            } => {
                assert_eq!(requested, Decimal::from(300));
                assert_eq!(available, Decimal::from(200));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_close_with_refund_guards_double_close() {
        let repo = MemoryRepository::new();
        let account = repo
            .insert_account(NewAccount {
                owner: "user".to_string(),
                referral_code: "REF-B".to_string(),
                referred_by: None,
            })
            .await
            .unwrap();
        repo.credit_and_record(
            account.id,
            NewTransaction::refund(Decimal::from(500), "Seed"),
        )
        .await
        .unwrap();
        let reservation = repo
            .reserve_purchase(
                new_order(account.id, 300),
                NewTransaction::purchase(Decimal::from(300), "Purchase"),
            )
            .await
            .unwrap();

        let from = [OrderStatus::Pending, OrderStatus::Processing];
        repo.close_with_refund(
            reservation.order.id,
            &from,
            OrderStatus::Cancelled,
            NewTransaction::refund(Decimal::from(300), "Refund"),
            None,
        )
        .await
        .unwrap();

        let err = repo
            .close_with_refund(
                reservation.order.id,
                &from,
                OrderStatus::Cancelled,
                NewTransaction::refund(Decimal::from(300), "Refund"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));

        // Exactly one refund applied.
        let account = repo.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(500));
    }
}
