use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, Pool, Postgres};
use std::str::FromStr;
use uuid::Uuid;

use virtu_core::account::{
    Account, Direction, NewAccount, NewTransaction, Transaction, TransactionStatus,
};
use virtu_core::{CoreError, CoreResult};

pub(crate) fn storage(err: sqlx::Error) -> CoreError {
    CoreError::Storage(err.to_string())
}

#[derive(FromRow)]
pub(crate) struct AccountRow {
    pub id: Uuid,
    pub owner: String,
    pub balance: Decimal,
    pub referral_code: String,
    pub referred_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: row.id,
            owner: row.owner,
            balance: row.balance,
            referral_code: row.referral_code,
            referred_by: row.referred_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
pub(crate) struct TransactionRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub direction: String,
    pub amount: Decimal,
    pub balance_before: Option<Decimal>,
    pub balance_after: Option<Decimal>,
    pub status: String,
    pub reference: String,
    pub payment_method: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = CoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Transaction {
            id: row.id,
            account_id: row.account_id,
            direction: Direction::from_str(&row.direction).map_err(CoreError::Storage)?,
            amount: row.amount,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            status: TransactionStatus::from_str(&row.status).map_err(CoreError::Storage)?,
            reference: row.reference,
            payment_method: row.payment_method,
            description: row.description,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const INSERT_TRANSACTION: &str = "INSERT INTO transactions \
     (id, account_id, direction, amount, balance_before, balance_after, status, \
      reference, payment_method, description) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
     RETURNING id, account_id, direction, amount, balance_before, balance_after, \
               status, reference, payment_method, description, created_at, updated_at";

/// Insert a transaction row inside the caller's unit of work.
pub(crate) async fn insert_transaction<'e, E>(
    executor: E,
    account_id: Uuid,
    txn: &NewTransaction,
    status: TransactionStatus,
    balance_before: Option<Decimal>,
    balance_after: Option<Decimal>,
) -> CoreResult<Transaction>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row: TransactionRow = sqlx::query_as(INSERT_TRANSACTION)
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(txn.direction.as_str())
        .bind(txn.amount)
        .bind(balance_before)
        .bind(balance_after)
        .bind(status.as_str())
        .bind(&txn.reference)
        .bind(&txn.payment_method)
        .bind(&txn.description)
        .fetch_one(executor)
        .await
        .map_err(storage)?;
    row.try_into()
}

/// Conditional decrement. Returns the pre/post balances, or
/// `InsufficientFunds` without touching the row.
pub(crate) async fn conditional_debit<'e, E>(
    executor: E,
    account_id: Uuid,
    amount: Decimal,
) -> CoreResult<(Decimal, Decimal)>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    #[derive(FromRow)]
    struct BalanceRow {
        balance: Decimal,
    }

    let updated: Option<BalanceRow> = sqlx::query_as(
        "UPDATE accounts SET balance = balance - $2, updated_at = NOW() \
         WHERE id = $1 AND balance >= $2 RETURNING balance",
    )
    .bind(account_id)
    .bind(amount)
    .fetch_optional(executor)
    .await
    .map_err(storage)?;

    match updated {
        Some(row) => Ok((row.balance + amount, row.balance)),
        None => Err(CoreError::InsufficientFunds {
            requested: amount,
            available: Decimal::ZERO,
        }),
    }
}

pub(crate) async fn credit_balance<'e, E>(
    executor: E,
    account_id: Uuid,
    amount: Decimal,
) -> CoreResult<(Decimal, Decimal)>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    #[derive(FromRow)]
    struct BalanceRow {
        balance: Decimal,
    }

    let row: Option<BalanceRow> = sqlx::query_as(
        "UPDATE accounts SET balance = balance + $2, updated_at = NOW() \
         WHERE id = $1 RETURNING balance",
    )
    .bind(account_id)
    .bind(amount)
    .fetch_optional(executor)
    .await
    .map_err(storage)?;

    match row {
        Some(row) => Ok((row.balance - amount, row.balance)),
        None => Err(CoreError::NotFound(format!("account {}", account_id))),
    }
}

/// Current balance, or None when the account does not exist. Used to turn the
/// guarded debit's ambiguous miss into an accurate error.
pub(crate) async fn fetch_balance(
    pool: &Pool<Postgres>,
    account_id: Uuid,
) -> CoreResult<Option<Decimal>> {
    #[derive(FromRow)]
    struct BalanceRow {
        balance: Decimal,
    }
    let row: Option<BalanceRow> = sqlx::query_as("SELECT balance FROM accounts WHERE id = $1")
        .bind(account_id)
        .fetch_optional(pool)
        .await
        .map_err(storage)?;
    Ok(row.map(|r| r.balance))
}

pub struct StoreLedgerRepository {
    pool: Pool<Postgres>,
}

impl StoreLedgerRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl virtu_core::repository::LedgerRepository for StoreLedgerRepository {
    async fn insert_account(&self, account: NewAccount) -> CoreResult<Account> {
        let row: AccountRow = sqlx::query_as(
            "INSERT INTO accounts (id, owner, balance, referral_code, referred_by) \
             VALUES ($1, $2, 0, $3, $4) \
             RETURNING id, owner, balance, referral_code, referred_by, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(&account.owner)
        .bind(&account.referral_code)
        .bind(account.referred_by)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.into())
    }

    async fn get_account(&self, id: Uuid) -> CoreResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT id, owner, balance, referral_code, referred_by, created_at, updated_at \
             FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(Into::into))
    }

    async fn find_account_by_referral_code(&self, code: &str) -> CoreResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT id, owner, balance, referral_code, referred_by, created_at, updated_at \
             FROM accounts WHERE referral_code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(Into::into))
    }

    async fn debit_and_record(
        &self,
        account_id: Uuid,
        txn: NewTransaction,
    ) -> CoreResult<Transaction> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let (before, after) = match conditional_debit(&mut *tx, account_id, txn.amount).await {
            Ok(balances) => balances,
            Err(CoreError::InsufficientFunds { requested, .. }) => {
                // The guarded UPDATE cannot tell "too low" from "missing";
                // re-read outside the unit for an accurate error.
                tx.rollback().await.ok();
                return match fetch_balance(&self.pool, account_id).await? {
                    Some(available) => Err(CoreError::InsufficientFunds {
                        requested,
                        available,
                    }),
                    None => Err(CoreError::NotFound(format!("account {}", account_id))),
                };
            }
            Err(e) => return Err(e),
        };
        let transaction = insert_transaction(
            &mut *tx,
            account_id,
            &txn,
            TransactionStatus::Completed,
            Some(before),
            Some(after),
        )
        .await?;
        tx.commit().await.map_err(storage)?;
        Ok(transaction)
    }

    async fn credit_and_record(
        &self,
        account_id: Uuid,
        txn: NewTransaction,
    ) -> CoreResult<Transaction> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let (before, after) = credit_balance(&mut *tx, account_id, txn.amount).await?;
        let transaction = insert_transaction(
            &mut *tx,
            account_id,
            &txn,
            TransactionStatus::Completed,
            Some(before),
            Some(after),
        )
        .await?;
        tx.commit().await.map_err(storage)?;
        Ok(transaction)
    }

    async fn insert_pending(
        &self,
        account_id: Uuid,
        txn: NewTransaction,
    ) -> CoreResult<Transaction> {
        insert_transaction(
            &self.pool,
            account_id,
            &txn,
            TransactionStatus::Pending,
            None,
            None,
        )
        .await
    }

    async fn complete_pending_credit(&self, reference: &str) -> CoreResult<Transaction> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // Row lock so a concurrent verification serializes behind us and then
        // fails the pending-status guard.
        let row: Option<TransactionRow> = sqlx::query_as(
            "SELECT id, account_id, direction, amount, balance_before, balance_after, \
                    status, reference, payment_method, description, created_at, updated_at \
             FROM transactions WHERE reference = $1 FOR UPDATE",
        )
        .bind(reference)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage)?;

        let pending: Transaction = row
            .ok_or_else(|| CoreError::NotFound(format!("transaction {}", reference)))?
            .try_into()?;
        if pending.status != TransactionStatus::Pending || pending.direction != Direction::Credit {
            return Err(CoreError::InvalidTransition(format!(
                "transaction {} is not a pending credit",
                reference
            )));
        }

        let (before, after) =
            credit_balance(&mut *tx, pending.account_id, pending.amount).await?;

        let row: TransactionRow = sqlx::query_as(
            "UPDATE transactions \
             SET status = $2, balance_before = $3, balance_after = $4, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING id, account_id, direction, amount, balance_before, balance_after, \
                       status, reference, payment_method, description, created_at, updated_at",
        )
        .bind(pending.id)
        .bind(TransactionStatus::Completed.as_str())
        .bind(before)
        .bind(after)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        row.try_into()
    }

    async fn find_by_reference(&self, reference: &str) -> CoreResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(
            "SELECT id, account_id, direction, amount, balance_before, balance_after, \
                    status, reference, payment_method, description, created_at, updated_at \
             FROM transactions WHERE reference = $1",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn mark_transaction(&self, id: Uuid, status: TransactionStatus) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE transactions SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("transaction {}", id)));
        }
        Ok(())
    }

    async fn list_transactions(&self, account_id: Uuid) -> CoreResult<Vec<Transaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(
            "SELECT id, account_id, direction, amount, balance_before, balance_after, \
                    status, reference, payment_method, description, created_at, updated_at \
             FROM transactions WHERE account_id = $1 ORDER BY created_at DESC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
