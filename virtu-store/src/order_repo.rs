use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, Pool, Postgres};
use std::str::FromStr;
use uuid::Uuid;

use virtu_core::account::{NewTransaction, TransactionStatus};
use virtu_core::order::{NewOrder, Order, OrderStatus};
use virtu_core::repository::{FulfillmentRecord, OrderRepository, PurchaseReservation};
use virtu_core::{CoreError, CoreResult};
use virtu_shared::models::kind::ProductKind;

use crate::ledger_repo::{
    conditional_debit, credit_balance, fetch_balance, insert_transaction, storage,
};

#[derive(FromRow)]
struct OrderRow {
    id: Uuid,
    account_id: Uuid,
    kind: String,
    status: String,
    amount_charged: Decimal,
    provider_identifier: String,
    provider_reference: Option<String>,
    item_code: String,
    region: String,
    delivered_payload: Option<String>,
    failure_reason: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    transaction_id: Uuid,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = CoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: row.id,
            account_id: row.account_id,
            kind: ProductKind::from_str(&row.kind).map_err(CoreError::Storage)?,
            status: OrderStatus::from_str(&row.status).map_err(CoreError::Storage)?,
            amount_charged: row.amount_charged,
            provider_identifier: row.provider_identifier,
            provider_reference: row.provider_reference,
            item_code: row.item_code,
            region: row.region,
            delivered_payload: row.delivered_payload,
            failure_reason: row.failure_reason,
            expires_at: row.expires_at,
            transaction_id: row.transaction_id,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const ORDER_COLUMNS: &str = "id, account_id, kind, status, amount_charged, provider_identifier, \
     provider_reference, item_code, region, delivered_payload, failure_reason, \
     expires_at, transaction_id, metadata, created_at, updated_at";

fn terminal_statuses() -> Vec<String> {
    [
        OrderStatus::Completed,
        OrderStatus::Failed,
        OrderStatus::Cancelled,
        OrderStatus::Refunded,
        OrderStatus::Expired,
    ]
    .iter()
    .map(|s| s.as_str().to_string())
    .collect()
}

pub struct StoreOrderRepository {
    pool: Pool<Postgres>,
}

impl StoreOrderRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderRepository for StoreOrderRepository {
    async fn reserve_purchase(
        &self,
        order: NewOrder,
        charge: NewTransaction,
    ) -> CoreResult<PurchaseReservation> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let (before, after) =
            match conditional_debit(&mut *tx, order.account_id, charge.amount).await {
                Ok(balances) => balances,
                Err(CoreError::InsufficientFunds { requested, .. }) => {
                    // The guarded UPDATE cannot tell "too low" from "missing";
                    // re-read outside the unit for an accurate error.
                    tx.rollback().await.ok();
                    return match fetch_balance(&self.pool, order.account_id).await? {
                        Some(available) => Err(CoreError::InsufficientFunds {
                            requested,
                            available,
                        }),
                        None => Err(CoreError::NotFound(format!(
                            "account {}",
                            order.account_id
                        ))),
                    };
                }
                Err(e) => return Err(e),
            };
        let transaction = insert_transaction(
            &mut *tx,
            order.account_id,
            &charge,
            TransactionStatus::Pending,
            Some(before),
            Some(after),
        )
        .await?;

        let sql = format!(
            "INSERT INTO orders \
             (id, account_id, kind, status, amount_charged, provider_identifier, \
              item_code, region, expires_at, transaction_id, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {ORDER_COLUMNS}"
        );
        let row: OrderRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(order.account_id)
            .bind(order.kind.as_str())
            .bind(OrderStatus::Pending.as_str())
            .bind(order.amount_charged)
            .bind(&order.provider_identifier)
            .bind(&order.item_code)
            .bind(&order.region)
            .bind(order.expires_at)
            .bind(transaction.id)
            .bind(&order.metadata)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        Ok(PurchaseReservation {
            order: row.try_into()?,
            transaction,
        })
    }

    async fn finalize_success(
        &self,
        order_id: Uuid,
        transaction_id: Uuid,
        record: FulfillmentRecord,
    ) -> CoreResult<Order> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        sqlx::query("UPDATE transactions SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(transaction_id)
            .bind(TransactionStatus::Completed.as_str())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        let sql = format!(
            "UPDATE orders \
             SET status = $2, provider_reference = $3, delivered_payload = $4, \
                 expires_at = COALESCE($5, expires_at), updated_at = NOW() \
             WHERE id = $1 AND status != ALL($6) \
             RETURNING {ORDER_COLUMNS}"
        );
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .bind(record.status.as_str())
            .bind(&record.provider_reference)
            .bind(&record.delivered_payload)
            .bind(record.expires_at)
            .bind(terminal_statuses())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;

        let row = row.ok_or_else(|| {
            CoreError::InvalidTransition(format!("order {} is already closed", order_id))
        })?;
        tx.commit().await.map_err(storage)?;
        row.try_into()
    }

    async fn finalize_failure(
        &self,
        order_id: Uuid,
        transaction_id: Uuid,
        refund: NewTransaction,
        reason: &str,
    ) -> CoreResult<Order> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let sql = format!(
            "UPDATE orders SET status = $2, failure_reason = $3, updated_at = NOW() \
             WHERE id = $1 AND status != ALL($4) \
             RETURNING {ORDER_COLUMNS}"
        );
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .bind(OrderStatus::Failed.as_str())
            .bind(reason)
            .bind(terminal_statuses())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;
        let row = row.ok_or_else(|| {
            CoreError::InvalidTransition(format!("order {} is already closed", order_id))
        })?;

        let account_id = row.account_id;
        let (before, after) = credit_balance(&mut *tx, account_id, refund.amount).await?;
        insert_transaction(
            &mut *tx,
            account_id,
            &refund,
            TransactionStatus::Completed,
            Some(before),
            Some(after),
        )
        .await?;

        sqlx::query("UPDATE transactions SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(transaction_id)
            .bind(TransactionStatus::Failed.as_str())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        row.try_into()
    }

    async fn close_with_refund(
        &self,
        order_id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
        refund: NewTransaction,
        reason: Option<&str>,
    ) -> CoreResult<Order> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let allowed: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            "UPDATE orders \
             SET status = $2, failure_reason = COALESCE($3, failure_reason), updated_at = NOW() \
             WHERE id = $1 AND status = ANY($4) \
             RETURNING {ORDER_COLUMNS}"
        );
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .bind(to.as_str())
            .bind(reason)
            .bind(allowed)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;

        // The guard doubles as the double-refund barrier: no matching row
        // means no credit happens.
        let row = row.ok_or_else(|| {
            CoreError::InvalidTransition(format!("order {} not in a closable state", order_id))
        })?;

        let account_id = row.account_id;
        let (before, after) = credit_balance(&mut *tx, account_id, refund.amount).await?;
        insert_transaction(
            &mut *tx,
            account_id,
            &refund,
            TransactionStatus::Completed,
            Some(before),
            Some(after),
        )
        .await?;

        tx.commit().await.map_err(storage)?;
        row.try_into()
    }

    async fn set_completed(&self, order_id: Uuid) -> CoreResult<Order> {
        let sql = format!(
            "UPDATE orders SET status = $2, updated_at = NOW() \
             WHERE id = $1 AND status != ALL($3) \
             RETURNING {ORDER_COLUMNS}"
        );
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .bind(OrderStatus::Completed.as_str())
            .bind(terminal_statuses())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        let row = row.ok_or_else(|| {
            CoreError::InvalidTransition(format!("order {} is already closed", order_id))
        })?;
        row.try_into()
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update_progress(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        delivered_payload: Option<String>,
    ) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE orders \
             SET status = $2, delivered_payload = COALESCE($3, delivered_payload), \
                 updated_at = NOW() \
             WHERE id = $1 AND status != ALL($4)",
        )
        .bind(order_id)
        .bind(status.as_str())
        .bind(delivered_payload)
        .bind(terminal_statuses())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::InvalidTransition(format!(
                "order {} is already closed",
                order_id
            )));
        }
        Ok(())
    }

    async fn count_open(&self, account_id: Uuid) -> CoreResult<i64> {
        #[derive(FromRow)]
        struct CountRow {
            count: i64,
        }
        let row: CountRow = sqlx::query_as(
            "SELECT COUNT(*) AS count FROM orders \
             WHERE account_id = $1 AND status != ALL($2)",
        )
        .bind(account_id)
        .bind(terminal_statuses())
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.count)
    }

    async fn list_unresolved(&self) -> CoreResult<Vec<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE status != ALL($1) ORDER BY created_at ASC"
        );
        let rows: Vec<OrderRow> = sqlx::query_as(&sql)
            .bind(terminal_statuses())
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_for_account(&self, account_id: Uuid) -> CoreResult<Vec<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE account_id = $1 ORDER BY created_at DESC"
        );
        let rows: Vec<OrderRow> = sqlx::query_as(&sql)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
