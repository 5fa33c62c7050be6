use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, Pool, Postgres};
use uuid::Uuid;

use virtu_core::account::{NewTransaction, TransactionStatus};
use virtu_core::repository::{CommissionRecord, NewCommission, ReferralRepository};
use virtu_core::{CoreError, CoreResult};

use crate::ledger_repo::{credit_balance, insert_transaction, storage};

#[derive(FromRow)]
struct CommissionRow {
    id: Uuid,
    referred_account_id: Uuid,
    referrer_account_id: Uuid,
    source_transaction_id: Uuid,
    credit_transaction_id: Uuid,
    amount: Decimal,
    created_at: DateTime<Utc>,
}

impl From<CommissionRow> for CommissionRecord {
    fn from(row: CommissionRow) -> Self {
        CommissionRecord {
            id: row.id,
            referred_account_id: row.referred_account_id,
            referrer_account_id: row.referrer_account_id,
            source_transaction_id: row.source_transaction_id,
            credit_transaction_id: row.credit_transaction_id,
            amount: row.amount,
            created_at: row.created_at,
        }
    }
}

pub struct StoreReferralRepository {
    pool: Pool<Postgres>,
}

impl StoreReferralRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReferralRepository for StoreReferralRepository {
    async fn referrer_of(&self, account_id: Uuid) -> CoreResult<Option<Uuid>> {
        #[derive(FromRow)]
        struct Row {
            referred_by: Option<Uuid>,
        }
        let row: Option<Row> = sqlx::query_as("SELECT referred_by FROM accounts WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        match row {
            Some(row) => Ok(row.referred_by),
            None => Err(CoreError::NotFound(format!("account {}", account_id))),
        }
    }

    async fn commission_count(&self, referred_account_id: Uuid) -> CoreResult<i64> {
        #[derive(FromRow)]
        struct CountRow {
            count: i64,
        }
        let row: CountRow = sqlx::query_as(
            "SELECT COUNT(*) AS count FROM commissions WHERE referred_account_id = $1",
        )
        .bind(referred_account_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.count)
    }

    async fn record_commission(
        &self,
        commission: NewCommission,
        credit: NewTransaction,
    ) -> CoreResult<CommissionRecord> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let (before, after) =
            credit_balance(&mut *tx, commission.referrer_account_id, credit.amount).await?;
        let transaction = insert_transaction(
            &mut *tx,
            commission.referrer_account_id,
            &credit,
            TransactionStatus::Completed,
            Some(before),
            Some(after),
        )
        .await?;

        let row: CommissionRow = sqlx::query_as(
            "INSERT INTO commissions \
             (id, referred_account_id, referrer_account_id, source_transaction_id, \
              credit_transaction_id, amount) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING id, referred_account_id, referrer_account_id, \
                       source_transaction_id, credit_transaction_id, amount, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(commission.referred_account_id)
        .bind(commission.referrer_account_id)
        .bind(commission.source_transaction_id)
        .bind(transaction.id)
        .bind(commission.amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(row.into())
    }
}
