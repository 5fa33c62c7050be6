use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use virtu_catalog::PricingEngine;
use virtu_core::account::{NewTransaction, Transaction};
use virtu_core::order::{NewOrder, Order, OrderStatus};
use virtu_core::provider::{FulfillmentOutcome, FulfillmentRequest, Provider};
use virtu_core::repository::{
    EventSink, FulfillmentRecord, LedgerRepository, OrderRepository,
};
use virtu_core::{CoreError, CoreResult};
use virtu_provider::registry::{ProviderRegistry, SelectionStrategy};
use virtu_shared::models::events::{OrderStatusChangedEvent, TransactionCompletedEvent};
use virtu_shared::{PlatformSettings, ProductKind};

use crate::commission::CommissionTrigger;

const TOPIC_ORDER_STATUS_CHANGED: &str = "order.status.changed";
const TOPIC_TRANSACTION_COMPLETED: &str = "wallet.transaction.completed";

#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub account_id: Uuid,
    pub kind: ProductKind,
    pub region: String,
    pub item_code: String,
    pub strategy: SelectionStrategy,
}

/// Drives the order lifecycle: purchase, status check, cancel, dispute,
/// confirm.
///
/// Every money-moving step is a single repository unit; provider I/O happens
/// strictly between units, never inside one. A purchase is therefore three
/// phases: reserve funds durably, call the provider with no lock held, then
/// finalize or compensate from the result.
pub struct FulfillmentOrchestrator {
    registry: Arc<ProviderRegistry>,
    engine: PricingEngine,
    ledger: Arc<dyn LedgerRepository>,
    orders: Arc<dyn OrderRepository>,
    commission: Option<Arc<CommissionTrigger>>,
    events: Option<Arc<dyn EventSink>>,
}

impl FulfillmentOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        engine: PricingEngine,
        ledger: Arc<dyn LedgerRepository>,
        orders: Arc<dyn OrderRepository>,
    ) -> Self {
        Self {
            registry,
            engine,
            ledger,
            orders,
            commission: None,
            events: None,
        }
    }

    pub fn with_commission(mut self, trigger: Arc<CommissionTrigger>) -> Self {
        self.commission = Some(trigger);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Place a purchase. The returned order carries the outcome: `Processing`
    /// or `Completed` when the provider accepted, `Failed` with a reason when
    /// it definitively declined, and `Processing` with no provider reference
    /// when the outcome is unknown and left to the reconciliation sweep.
    pub async fn purchase(
        &self,
        request: PurchaseRequest,
        settings: &PlatformSettings,
    ) -> CoreResult<Order> {
        let account = self
            .ledger
            .get_account(request.account_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("account {}", request.account_id)))?;

        let open = self.orders.count_open(request.account_id).await?;
        if open >= settings.max_open_orders {
            return Err(CoreError::PurchaseLimit(format!(
                "{} open orders, limit {}",
                open, settings.max_open_orders
            )));
        }

        let selected = self
            .registry
            .select_best(
                request.kind,
                &request.region,
                &request.item_code,
                &request.strategy,
                &self.engine,
                settings,
            )
            .await?;
        let price = selected.retail_price;

        let minimum = settings.min_purchase_for(request.kind);
        if price < minimum {
            return Err(CoreError::Validation(format!(
                "purchase amount {} is below the {} minimum {}",
                price, request.kind, minimum
            )));
        }

        // Advisory; the reservation below re-checks atomically.
        if account.balance < price {
            return Err(CoreError::InsufficientFunds {
                requested: price,
                available: account.balance,
            });
        }

        let provider_identifier = selected.provider.descriptor().identifier;
        let expires_at =
            Utc::now() + Duration::minutes(settings.order_ttl_for(request.kind));
        // Snapshot the policy that produced this price, for later audit.
        let metadata = serde_json::json!({
            "pricing_policy": settings.pricing,
            "settings_version": settings.version,
            "operator": selected.operator,
            "provider_cost": selected.cost,
        });

        // Phase 1: reserve funds and the durable pending marker.
        let reservation = self
            .orders
            .reserve_purchase(
                NewOrder {
                    account_id: request.account_id,
                    kind: request.kind,
                    amount_charged: price,
                    provider_identifier: provider_identifier.clone(),
                    item_code: request.item_code.clone(),
                    region: request.region.clone(),
                    expires_at: Some(expires_at),
                    metadata,
                },
                NewTransaction::purchase(
                    price,
                    &format!("{} {}", request.kind, request.item_code),
                ),
            )
            .await?;
        let order = reservation.order;
        let charge = reservation.transaction;

        // Phase 2: provider I/O, no lock held.
        let deadline = std::time::Duration::from_secs(settings.fulfillment_timeout_secs);
        let fulfill_request = FulfillmentRequest {
            order_id: order.id,
            account_id: request.account_id,
            region: request.region,
            operator: selected.operator,
            item_code: request.item_code,
        };
        let result = timeout(deadline, selected.provider.fulfill(&fulfill_request)).await;

        // Phase 3: finalize or compensate.
        match result {
            Ok(Ok(outcome)) if outcome.success => {
                self.finalize_accepted(order, &charge, selected.provider, outcome, settings)
                    .await
            }
            Ok(Ok(outcome)) => {
                let reason = outcome
                    .error_message
                    .unwrap_or_else(|| "provider declined".to_string());
                self.compensate_declined(order, &charge, &reason).await
            }
            Ok(Err(err)) if !matches!(err, CoreError::ProviderTimeout(_)) => {
                self.compensate_declined(order, &charge, &err.to_string())
                    .await
            }
            // Timed out or the client reported a timeout: outcome unknown.
            // Neither refund nor complete; the sweep resolves it.
            _ => {
                warn!(
                    order_id = %order.id,
                    provider = %order.provider_identifier,
                    "fulfillment outcome unknown, leaving order for reconciliation"
                );
                self.orders
                    .update_progress(order.id, OrderStatus::Processing, None)
                    .await?;
                self.orders
                    .get(order.id)
                    .await?
                    .ok_or_else(|| CoreError::NotFound(format!("order {}", order.id)))
            }
        }
    }

    async fn finalize_accepted(
        &self,
        order: Order,
        charge: &Transaction,
        provider: Arc<dyn Provider>,
        outcome: FulfillmentOutcome,
        settings: &PlatformSettings,
    ) -> CoreResult<Order> {
        let mapped = provider.map_status(&outcome.native_status);
        // A provider acknowledgment always advances past Pending.
        let status = if mapped == OrderStatus::Pending {
            OrderStatus::Processing
        } else {
            mapped
        };
        let finalized = self
            .orders
            .finalize_success(
                order.id,
                charge.id,
                FulfillmentRecord {
                    provider_reference: outcome.provider_order_id,
                    status,
                    delivered_payload: outcome.delivered_payload,
                    expires_at: None,
                },
            )
            .await?;

        info!(
            order_id = %finalized.id,
            provider = %finalized.provider_identifier,
            status = finalized.status.as_str(),
            "purchase fulfilled"
        );

        if let Some(trigger) = &self.commission {
            let mut completed = charge.clone();
            completed.status = virtu_core::account::TransactionStatus::Completed;
            trigger
                .on_completed_purchase(finalized.account_id, &completed, &settings.commission)
                .await;
        }

        self.emit_transaction_completed(charge).await;
        self.emit_status_changed(&finalized).await;
        Ok(finalized)
    }

    async fn compensate_declined(
        &self,
        order: Order,
        charge: &Transaction,
        reason: &str,
    ) -> CoreResult<Order> {
        warn!(order_id = %order.id, reason, "fulfillment declined, refunding");
        let failed = self
            .orders
            .finalize_failure(
                order.id,
                charge.id,
                NewTransaction::refund(order.amount_charged, "Fulfillment refund"),
                reason,
            )
            .await?;
        self.emit_status_changed(&failed).await;
        Ok(failed)
    }

    /// Refresh an order from its provider. Terminal orders are returned
    /// as-is with no upstream call.
    pub async fn check_status(&self, order_id: Uuid) -> CoreResult<Order> {
        let order = self
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("order {}", order_id)))?;

        if order.status.is_terminal() {
            return Ok(order);
        }
        let Some(reference) = order.provider_reference.clone() else {
            // Never acknowledged upstream; only the sweep can resolve it.
            return Ok(order);
        };

        let provider = self.registry.for_order(&order)?;
        let outcome = provider.check_status(&reference, order.account_id).await?;
        if !outcome.success {
            warn!(
                order_id = %order.id,
                error = outcome.error_message.as_deref().unwrap_or("unknown"),
                "status check failed upstream, keeping current state"
            );
            return Ok(order);
        }

        let mapped = provider.map_status(&outcome.native_status);
        match mapped {
            OrderStatus::Failed | OrderStatus::Cancelled => {
                // Close under the provider's reported terminal state; both
                // refund in full.
                let reason = if mapped == OrderStatus::Cancelled {
                    "provider reported cancellation"
                } else {
                    "provider reported failure"
                };
                let closed = self
                    .orders
                    .close_with_refund(
                        order.id,
                        &[OrderStatus::Pending, OrderStatus::Processing],
                        mapped,
                        NewTransaction::refund(order.amount_charged, "Fulfillment refund"),
                        Some(reason),
                    )
                    .await?;
                self.emit_status_changed(&closed).await;
                Ok(closed)
            }
            status if status != order.status || outcome.delivered_payload.is_some() => {
                self.orders
                    .update_progress(order.id, status, outcome.delivered_payload)
                    .await?;
                let refreshed = self
                    .orders
                    .get(order.id)
                    .await?
                    .ok_or_else(|| CoreError::NotFound(format!("order {}", order.id)))?;
                self.emit_status_changed(&refreshed).await;
                Ok(refreshed)
            }
            _ => Ok(order),
        }
    }

    /// Cancel a live order. The provider must confirm before any money
    /// moves; a refused cancel leaves the order untouched.
    pub async fn cancel(&self, order_id: Uuid) -> CoreResult<Order> {
        let order = self
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("order {}", order_id)))?;
        if !order.status.is_cancellable() {
            return Err(CoreError::InvalidTransition(format!(
                "order {} is {}",
                order_id,
                order.status.as_str()
            )));
        }

        // No provider reference means the upstream outcome is unknown; a
        // refund now could pay for goods that were actually delivered. The
        // sweep resolves it first.
        let Some(reference) = &order.provider_reference else {
            return Err(CoreError::ReconciliationRequired(format!(
                "order {} has no provider acknowledgment yet",
                order_id
            )));
        };
        let provider = self.registry.for_order(&order)?;
        let confirmed = provider.cancel(reference, order.account_id).await?;
        if !confirmed {
            return Err(CoreError::ProviderRejected(format!(
                "provider refused to cancel order {}",
                order_id
            )));
        }

        let cancelled = self
            .orders
            .close_with_refund(
                order.id,
                &[OrderStatus::Pending, OrderStatus::Processing],
                OrderStatus::Cancelled,
                NewTransaction::refund(order.amount_charged, "Cancellation refund"),
                None,
            )
            .await?;
        self.emit_status_changed(&cancelled).await;
        Ok(cancelled)
    }

    /// Dispute a bad deliverable; the provider must acknowledge before the
    /// refund is issued.
    pub async fn report_bad(&self, order_id: Uuid) -> CoreResult<Order> {
        let order = self
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("order {}", order_id)))?;
        let reference = order.provider_reference.clone().ok_or_else(|| {
            CoreError::InvalidTransition(format!("order {} was never fulfilled", order_id))
        })?;

        let provider = self.registry.for_order(&order)?;
        let acknowledged = provider.report_bad(&reference, order.account_id).await?;
        if !acknowledged {
            return Err(CoreError::ProviderRejected(format!(
                "provider rejected the dispute for order {}",
                order_id
            )));
        }

        let refunded = self
            .orders
            .close_with_refund(
                order.id,
                &[
                    OrderStatus::Pending,
                    OrderStatus::Processing,
                    OrderStatus::Completed,
                ],
                OrderStatus::Refunded,
                NewTransaction::refund(order.amount_charged, "Dispute refund"),
                Some("reported bad by account"),
            )
            .await?;
        self.emit_status_changed(&refunded).await;
        Ok(refunded)
    }

    /// Confirm receipt of the deliverable; allowed only once the provider
    /// actually delivered something.
    pub async fn finish(&self, order_id: Uuid) -> CoreResult<Order> {
        let order = self
            .orders
            .get(order_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("order {}", order_id)))?;
        if order.status.is_terminal() {
            return Err(CoreError::InvalidTransition(format!(
                "order {} is {}",
                order_id,
                order.status.as_str()
            )));
        }
        let reference = order.provider_reference.clone().ok_or_else(|| {
            CoreError::InvalidTransition(format!("order {} was never fulfilled", order_id))
        })?;
        if order.delivered_payload.is_none() {
            return Err(CoreError::InvalidTransition(format!(
                "order {} has no deliverable to confirm",
                order_id
            )));
        }

        let provider = self.registry.for_order(&order)?;
        let confirmed = provider.finish(&reference, order.account_id).await?;
        if !confirmed {
            return Err(CoreError::ProviderRejected(format!(
                "provider refused to finish order {}",
                order_id
            )));
        }

        let completed = self.orders.set_completed(order.id).await?;
        self.emit_status_changed(&completed).await;
        Ok(completed)
    }

    pub async fn orders_for_account(&self, account_id: Uuid) -> CoreResult<Vec<Order>> {
        self.orders.list_for_account(account_id).await
    }

    async fn emit_status_changed(&self, order: &Order) {
        let Some(events) = &self.events else {
            return;
        };
        let event = OrderStatusChangedEvent {
            order_id: order.id,
            account_id: order.account_id,
            kind: order.kind,
            status: order.status.as_str().to_string(),
            provider_identifier: order.provider_identifier.clone(),
            timestamp: Utc::now().timestamp(),
        };
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(order_id = %order.id, error = %err, "event serialization failed");
                return;
            }
        };
        if let Err(err) = events
            .publish(TOPIC_ORDER_STATUS_CHANGED, &order.id.to_string(), &payload)
            .await
        {
            warn!(order_id = %order.id, error = %err, "event publish failed");
        }
    }

    async fn emit_transaction_completed(&self, transaction: &Transaction) {
        let Some(events) = &self.events else {
            return;
        };
        let event = TransactionCompletedEvent {
            transaction_id: transaction.id,
            account_id: transaction.account_id,
            direction: transaction.direction.as_str().to_string(),
            amount: transaction.amount,
            reference: transaction.reference.clone(),
            timestamp: Utc::now().timestamp(),
        };
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(transaction_id = %transaction.id, error = %err, "event serialization failed");
                return;
            }
        };
        if let Err(err) = events
            .publish(
                TOPIC_TRANSACTION_COMPLETED,
                &transaction.reference,
                &payload,
            )
            .await
        {
            warn!(transaction_id = %transaction.id, error = %err, "event publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::sync::atomic::Ordering;
    use virtu_core::account::{NewAccount, TransactionStatus};
    use virtu_provider::mock::MockProvider;
    use virtu_shared::PricingPolicy;
    use virtu_store::memory::MemoryRepository;

    fn settings() -> PlatformSettings {
        PlatformSettings {
            pricing: PricingPolicy {
                markup_percentage: Decimal::from(200),
                min_price: Decimal::from(100),
                platform_fee: Decimal::ZERO,
                exchange_rate: Decimal::from(1600),
            },
            ..PlatformSettings::default()
        }
    }

    async fn seeded_account(repo: &Arc<MemoryRepository>, balance: i64) -> Uuid {
        let account = repo
            .insert_account(NewAccount {
                owner: "user".to_string(),
                referral_code: format!("REF-{}", Uuid::new_v4().simple()),
                referred_by: None,
            })
            .await
            .unwrap();
        if balance > 0 {
            repo.credit_and_record(
                account.id,
                NewTransaction::refund(Decimal::from(balance), "Seed"),
            )
            .await
            .unwrap();
        }
        account.id
    }

    fn orchestrator(
        repo: Arc<MemoryRepository>,
        provider: Arc<MockProvider>,
    ) -> FulfillmentOrchestrator {
        let registry = Arc::new(ProviderRegistry::new(vec![provider]));
        FulfillmentOrchestrator::new(
            registry,
            PricingEngine::default(),
            repo.clone(),
            repo,
        )
    }

    fn request(account_id: Uuid) -> PurchaseRequest {
        PurchaseRequest {
            account_id,
            kind: ProductKind::TempNumber,
            region: "ng".to_string(),
            item_code: "whatsapp".to_string(),
            strategy: SelectionStrategy::Cheapest,
        }
    }

    // cost * 1600 * 200% = retail; 0.21875 -> 700
    fn provider_priced(retail: i64) -> MockProvider {
        let cost = Decimal::from(retail) / Decimal::from(3200);
        MockProvider::new("alpha", ProductKind::TempNumber).with_quote("mtn", cost, 10)
    }

    #[tokio::test]
    async fn test_successful_purchase_debits_exact_price() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(None));
        let orch = orchestrator(repo.clone(), provider);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();

        assert_eq!(order.status, OrderStatus::Processing);
        assert_eq!(order.amount_charged, Decimal::from(700));
        assert!(order.provider_reference.is_some());
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(300));

        let transactions = repo.list_transactions(account_id).await.unwrap();
        let charge = transactions
            .iter()
            .find(|t| t.amount == Decimal::from(700))
            .unwrap();
        assert_eq!(charge.status, TransactionStatus::Completed);
        assert_eq!(charge.balance_before, Some(Decimal::from(1000)));
        assert_eq!(charge.balance_after, Some(Decimal::from(300)));
    }

    #[tokio::test]
    async fn test_declined_purchase_refunds_in_full() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 300).await;
        let provider = Arc::new(provider_priced(200).with_fulfill_decline("no stock"));
        let orch = orchestrator(repo.clone(), provider);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();

        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(order.failure_reason.as_deref(), Some("no stock"));
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(300));

        // Charge failed, refund completed.
        let transactions = repo.list_transactions(account_id).await.unwrap();
        assert!(transactions
            .iter()
            .any(|t| t.status == TransactionStatus::Failed && t.amount == Decimal::from(200)));
        assert!(transactions.iter().any(|t| {
            t.status == TransactionStatus::Completed
                && t.amount == Decimal::from(200)
                && t.direction == virtu_core::account::Direction::Credit
        }));
    }

    #[tokio::test]
    async fn test_concurrent_oversubscribed_purchases() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(600).with_fulfill_success(None));
        let orch = Arc::new(orchestrator(repo.clone(), provider));

        let a = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.purchase(request(account_id), &settings()).await })
        };
        let b = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.purchase(request(account_id), &settings()).await })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        let failure = [a, b].into_iter().find(|r| r.is_err()).unwrap();
        assert!(matches!(
            failure.unwrap_err(),
            CoreError::InsufficientFunds { .. }
        ));

        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(400));
    }

    #[tokio::test]
    async fn test_timeout_leaves_order_processing_without_refund() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_timeout());
        let orch = orchestrator(repo.clone(), provider);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();

        assert_eq!(order.status, OrderStatus::Processing);
        assert!(order.provider_reference.is_none());
        // Funds stay reserved until the sweep resolves the outcome.
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(300));
        let transactions = repo.list_transactions(account_id).await.unwrap();
        assert!(transactions
            .iter()
            .any(|t| t.status == TransactionStatus::Pending && t.amount == Decimal::from(700)));
    }

    #[tokio::test]
    async fn test_cancel_refunds_once_and_only_once() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(None));
        let orch = orchestrator(repo.clone(), provider);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();
        assert_eq!(order.status, OrderStatus::Processing);

        let cancelled = orch.cancel(order.id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(1000));

        let err = orch.cancel(order.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(1000));
    }

    #[tokio::test]
    async fn test_unacknowledged_order_cannot_be_cancelled() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_timeout());
        let orch = orchestrator(repo.clone(), provider);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();
        assert!(order.provider_reference.is_none());

        let err = orch.cancel(order.id).await.unwrap_err();
        assert!(matches!(err, CoreError::ReconciliationRequired(_)));
        // No refund happened.
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(300));
    }

    #[tokio::test]
    async fn test_refused_cancel_leaves_order_untouched() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(
            provider_priced(700)
                .with_fulfill_success(None)
                .with_cancel_refused(),
        );
        let orch = orchestrator(repo.clone(), provider);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();
        let err = orch.cancel(order.id).await.unwrap_err();
        assert!(matches!(err, CoreError::ProviderRejected(_)));

        let order = repo.get(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Processing);
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(300));
    }

    #[tokio::test]
    async fn test_terminal_status_check_skips_provider() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(Some("+23480000")));
        let mock = provider.clone();
        let orch = orchestrator(repo.clone(), provider);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();
        mock.push_status("finished", Some("+23480000"));
        let refreshed = orch.check_status(order.id).await.unwrap();
        assert_eq!(refreshed.status, OrderStatus::Completed);
        assert_eq!(mock.status_calls.load(Ordering::SeqCst), 1);

        // Terminal now; further checks answer from the stored row.
        let again = orch.check_status(order.id).await.unwrap();
        assert_eq!(again.status, OrderStatus::Completed);
        assert_eq!(mock.status_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_status_check_failure_refunds() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(None));
        let mock = provider.clone();
        let orch = orchestrator(repo.clone(), provider);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();
        mock.push_status("banned", None);
        let refreshed = orch.check_status(order.id).await.unwrap();

        assert_eq!(refreshed.status, OrderStatus::Failed);
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(1000));
    }

    #[tokio::test]
    async fn test_status_check_cancellation_closes_as_cancelled() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(None));
        let mock = provider.clone();
        let orch = orchestrator(repo.clone(), provider);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();
        mock.push_status("cancelled", None);
        let refreshed = orch.check_status(order.id).await.unwrap();

        // The provider's terminal state is preserved, money comes back.
        assert_eq!(refreshed.status, OrderStatus::Cancelled);
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(1000));
    }

    #[tokio::test]
    async fn test_report_bad_refunds_completed_order() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(Some("+23480000")));
        let mock = provider.clone();
        let orch = orchestrator(repo.clone(), provider);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();
        mock.push_status("finished", Some("+23480000"));
        orch.check_status(order.id).await.unwrap();

        let refunded = orch.report_bad(order.id).await.unwrap();
        assert_eq!(refunded.status, OrderStatus::Refunded);
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(1000));
    }

    #[tokio::test]
    async fn test_finish_requires_deliverable() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(None));
        let orch = orchestrator(repo.clone(), provider);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();
        let err = orch.finish(order.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_finish_completes_delivered_order() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(Some("+23480000")));
        let orch = orchestrator(repo.clone(), provider);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();
        let completed = orch.finish(order.id).await.unwrap();
        assert_eq!(completed.status, OrderStatus::Completed);
        // Confirmation moves no money.
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(300));
    }

    #[tokio::test]
    async fn test_open_order_limit() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 10_000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(None));
        let orch = orchestrator(repo.clone(), provider);

        let mut settings = settings();
        settings.max_open_orders = 2;

        orch.purchase(request(account_id), &settings).await.unwrap();
        orch.purchase(request(account_id), &settings).await.unwrap();
        let err = orch.purchase(request(account_id), &settings).await.unwrap_err();
        assert!(matches!(err, CoreError::PurchaseLimit(_)));
    }

    #[tokio::test]
    async fn test_minimum_purchase_enforced() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(200).with_fulfill_success(None));
        let orch = orchestrator(repo.clone(), provider);

        let mut settings = settings();
        settings
            .min_purchase
            .insert(ProductKind::TempNumber, Decimal::from(500));

        let err = orch.purchase(request(account_id), &settings).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(1000));
    }

    #[tokio::test]
    async fn test_commission_credited_on_referred_purchase() {
        let repo = Arc::new(MemoryRepository::new());
        let referrer = repo
            .insert_account(NewAccount {
                owner: "referrer".to_string(),
                referral_code: "REF-X".to_string(),
                referred_by: None,
            })
            .await
            .unwrap();
        let referred = repo
            .insert_account(NewAccount {
                owner: "referred".to_string(),
                referral_code: "REF-Y".to_string(),
                referred_by: Some(referrer.id),
            })
            .await
            .unwrap();
        repo.credit_and_record(
            referred.id,
            NewTransaction::refund(Decimal::from(2000), "Seed"),
        )
        .await
        .unwrap();

        let provider = Arc::new(provider_priced(1000).with_fulfill_success(None));
        let registry = Arc::new(ProviderRegistry::new(vec![provider]));
        let orch = FulfillmentOrchestrator::new(
            registry,
            PricingEngine::default(),
            repo.clone(),
            repo.clone(),
        )
        .with_commission(Arc::new(CommissionTrigger::new(repo.clone())));

        orch.purchase(request(referred.id), &settings()).await.unwrap();

        // 10% of the 1000 charge.
        let referrer = repo.get_account(referrer.id).await.unwrap().unwrap();
        assert_eq!(referrer.balance, Decimal::from(100));
    }
}
