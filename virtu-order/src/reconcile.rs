use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use uuid::Uuid;
use virtu_core::account::NewTransaction;
use virtu_core::order::{Order, OrderStatus};
use virtu_core::repository::{OrderRepository, SweepLock};
use virtu_core::{CoreError, CoreResult};
use virtu_provider::registry::ProviderRegistry;
use virtu_shared::PlatformSettings;

#[derive(Debug, Default, PartialEq)]
pub struct SweepReport {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    pub expired: usize,
    pub timed_out: usize,
    pub updated: usize,
    pub errors: usize,
    /// True when another instance held the lock and this run did nothing.
    pub skipped: bool,
}

/// Resolves orders the happy path left behind: phase-2 crashes, provider
/// timeouts, and orders past their lifetime.
///
/// Idempotent by construction: every resolution goes through a
/// status-guarded repository unit, so a second sweep finds nothing left to
/// do. Deployments with several instances attach a `SweepLock` so only one
/// runs at a time; running without it is safe, just wasteful.
pub struct ReconciliationSweep {
    registry: Arc<ProviderRegistry>,
    orders: Arc<dyn OrderRepository>,
    lock: Option<Arc<dyn SweepLock>>,
    lock_ttl_seconds: u64,
    holder: String,
}

impl ReconciliationSweep {
    pub fn new(registry: Arc<ProviderRegistry>, orders: Arc<dyn OrderRepository>) -> Self {
        Self {
            registry,
            orders,
            lock: None,
            lock_ttl_seconds: 0,
            holder: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_lock(mut self, lock: Arc<dyn SweepLock>, ttl_seconds: u64) -> Self {
        self.lock = Some(lock);
        self.lock_ttl_seconds = ttl_seconds;
        self
    }

    pub async fn run_once(&self, settings: &PlatformSettings) -> CoreResult<SweepReport> {
        if let Some(lock) = &self.lock {
            if !lock.acquire(&self.holder, self.lock_ttl_seconds).await? {
                info!(holder = %self.holder, "sweep lock held elsewhere, skipping");
                return Ok(SweepReport {
                    skipped: true,
                    ..SweepReport::default()
                });
            }
        }
        let result = self.sweep(settings).await;
        if let Some(lock) = &self.lock {
            if let Err(err) = lock.release(&self.holder).await {
                warn!(holder = %self.holder, error = %err, "sweep lock release failed");
            }
        }
        result
    }

    async fn sweep(&self, settings: &PlatformSettings) -> CoreResult<SweepReport> {
        let unresolved = self.orders.list_unresolved().await?;
        let mut report = SweepReport {
            examined: unresolved.len(),
            ..SweepReport::default()
        };

        for order in unresolved {
            if let Err(err) = self.resolve(&order, settings, &mut report).await {
                warn!(order_id = %order.id, error = %err, "sweep failed to resolve order");
                report.errors += 1;
            }
        }

        info!(
            examined = report.examined,
            completed = report.completed,
            failed = report.failed,
            expired = report.expired,
            timed_out = report.timed_out,
            "reconciliation sweep finished"
        );
        Ok(report)
    }

    async fn resolve(
        &self,
        order: &Order,
        settings: &PlatformSettings,
        report: &mut SweepReport,
    ) -> CoreResult<()> {
        let now = Utc::now();

        let Some(reference) = order.provider_reference.clone() else {
            // Never acknowledged upstream. Inside the grace window the
            // original purchase may still be mid-flight; past it, the
            // outcome is declared unknown-lost and the charge reversed.
            let deadline = order.created_at + Duration::minutes(settings.pending_grace_minutes);
            if now >= deadline {
                self.orders
                    .finalize_failure(
                        order.id,
                        order.transaction_id,
                        NewTransaction::refund(order.amount_charged, "Fulfillment refund"),
                        "fulfillment outcome unknown, timed out",
                    )
                    .await?;
                report.timed_out += 1;
            }
            return Ok(());
        };

        let provider = self.registry.for_order(order)?;
        let outcome = provider.check_status(&reference, order.account_id).await?;
        let mapped = if outcome.success {
            provider.map_status(&outcome.native_status)
        } else {
            order.status
        };

        match mapped {
            OrderStatus::Completed => {
                self.orders
                    .update_progress(order.id, OrderStatus::Completed, outcome.delivered_payload)
                    .await?;
                report.completed += 1;
            }
            OrderStatus::Failed | OrderStatus::Cancelled => {
                // Close under the provider's reported terminal state; both
                // refund in full.
                let reason = if mapped == OrderStatus::Cancelled {
                    "provider reported cancellation"
                } else {
                    "provider reported failure"
                };
                self.orders
                    .close_with_refund(
                        order.id,
                        &[OrderStatus::Pending, OrderStatus::Processing],
                        mapped,
                        NewTransaction::refund(order.amount_charged, "Fulfillment refund"),
                        Some(reason),
                    )
                    .await?;
                report.failed += 1;
            }
            live => {
                // Still in flight upstream; expire it once past its lifetime.
                // Expired orders refund in full, uniformly across kinds.
                if order.expires_at.is_some_and(|expiry| now >= expiry) {
                    self.orders
                        .close_with_refund(
                            order.id,
                            &[OrderStatus::Pending, OrderStatus::Processing],
                            OrderStatus::Expired,
                            NewTransaction::refund(order.amount_charged, "Expiry refund"),
                            Some("order expired"),
                        )
                        .await?;
                    report.expired += 1;
                } else if live != order.status || outcome.delivered_payload.is_some() {
                    match self
                        .orders
                        .update_progress(order.id, live, outcome.delivered_payload)
                        .await
                    {
                        Ok(()) => report.updated += 1,
                        // Lost a race with a concurrent close; that's a resolution.
                        Err(CoreError::InvalidTransition(_)) => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use uuid::Uuid;
    use virtu_catalog::PricingEngine;
    use virtu_core::account::{NewAccount, TransactionStatus};
    use virtu_core::repository::LedgerRepository;
    use virtu_provider::mock::MockProvider;
    use virtu_provider::registry::SelectionStrategy;
    use virtu_shared::{PricingPolicy, ProductKind};
    use virtu_store::memory::MemoryRepository;

    use crate::orchestrator::{FulfillmentOrchestrator, PurchaseRequest};

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
        repo.credit_and_record(
            account.id,
            NewTransaction::refund(Decimal::from(balance), "Seed"),
        )
        .await
        .unwrap();
        account.id
    }

    fn wire(
        repo: Arc<MemoryRepository>,
        provider: Arc<MockProvider>,
    ) -> (FulfillmentOrchestrator, ReconciliationSweep) {
        let registry = Arc::new(ProviderRegistry::new(vec![provider]));
        let orch = FulfillmentOrchestrator::new(
            registry.clone(),
            PricingEngine::default(),
            repo.clone(),
            repo.clone(),
        );
        let sweep = ReconciliationSweep::new(registry, repo);
        (orch, sweep)
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

    fn provider_priced(retail: i64) -> MockProvider {
        let cost = Decimal::from(retail) / Decimal::from(3200);
        MockProvider::new("alpha", ProductKind::TempNumber).with_quote("mtn", cost, 10)
    }

    #[tokio::test]
    async fn test_unacknowledged_order_times_out_to_refund() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_timeout());
        let (orch, sweep) = wire(repo.clone(), provider);

        let mut settings = settings();
        let order = orch.purchase(request(account_id), &settings).await.unwrap();
        assert_eq!(order.status, OrderStatus::Processing);
        assert!(order.provider_reference.is_none());

        // Inside the grace window the sweep leaves it alone.
        let report = sweep.run_once(&settings).await.unwrap();
        assert_eq!(report.timed_out, 0);

        settings.pending_grace_minutes = 0;
        let report = sweep.run_once(&settings).await.unwrap();
        assert_eq!(report.timed_out, 1);

        let order = repo.get(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(1000));
        // The original pending charge was marked failed, not completed.
        let transactions = repo.list_transactions(account_id).await.unwrap();
        assert!(transactions
            .iter()
            .any(|t| t.status == TransactionStatus::Failed && t.amount == Decimal::from(700)));
    }

    #[tokio::test]
    async fn test_sweep_completes_finished_orders() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(None));
        let mock = provider.clone();
        let (orch, sweep) = wire(repo.clone(), provider);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();
        mock.push_status("finished", Some("+23480000"));

        let report = sweep.run_once(&settings()).await.unwrap();
        assert_eq!(report.completed, 1);

        let order = repo.get(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.delivered_payload.as_deref(), Some("+23480000"));
    }

    #[tokio::test]
    async fn test_sweep_refunds_provider_reported_failure() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(None));
        let mock = provider.clone();
        let (orch, sweep) = wire(repo.clone(), provider);

        orch.purchase(request(account_id), &settings()).await.unwrap();
        mock.push_status("banned", None);

        let report = sweep.run_once(&settings()).await.unwrap();
        assert_eq!(report.failed, 1);
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(1000));
    }

    #[tokio::test]
    async fn test_sweep_preserves_provider_reported_cancellation() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(None));
        let mock = provider.clone();
        let (orch, sweep) = wire(repo.clone(), provider);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();
        mock.push_status("cancelled", None);

        sweep.run_once(&settings()).await.unwrap();
        let order = repo.get(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(1000));
    }

    #[tokio::test]
    async fn test_sweep_expires_stale_orders_with_refund() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(None));
        let (orch, sweep) = wire(repo.clone(), provider);

        let mut settings = settings();
        settings
            .order_ttl_minutes
            .insert(ProductKind::TempNumber, 0);

        let order = orch.purchase(request(account_id), &settings).await.unwrap();
        let report = sweep.run_once(&settings).await.unwrap();
        assert_eq!(report.expired, 1);

        let order = repo.get(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Expired);
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(1000));
    }

    #[derive(Default)]
    struct TestLock {
        held: AtomicBool,
        acquires: AtomicUsize,
        releases: AtomicUsize,
    }

    #[async_trait]
    impl SweepLock for TestLock {
        async fn acquire(&self, _holder: &str, _ttl_seconds: u64) -> CoreResult<bool> {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            Ok(!self.held.swap(true, Ordering::SeqCst))
        }

        async fn release(&self, _holder: &str) -> CoreResult<bool> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(self.held.swap(false, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn test_sweep_skips_when_lock_held_elsewhere() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(None));
        let mock = provider.clone();
        let registry = Arc::new(ProviderRegistry::new(vec![provider]));
        let orch = FulfillmentOrchestrator::new(
            registry.clone(),
            PricingEngine::default(),
            repo.clone(),
            repo.clone(),
        );
        let lock = Arc::new(TestLock::default());
        let sweep = ReconciliationSweep::new(registry, repo.clone()).with_lock(lock.clone(), 60);

        let order = orch.purchase(request(account_id), &settings()).await.unwrap();
        mock.push_status("finished", None);

        lock.held.store(true, Ordering::SeqCst);
        let report = sweep.run_once(&settings()).await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.examined, 0);
        // Nothing released, nothing resolved.
        assert_eq!(lock.releases.load(Ordering::SeqCst), 0);
        let order = repo.get(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Processing);
    }

    #[tokio::test]
    async fn test_sweep_acquires_and_releases_lock() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(None));
        let mock = provider.clone();
        let registry = Arc::new(ProviderRegistry::new(vec![provider]));
        let orch = FulfillmentOrchestrator::new(
            registry.clone(),
            PricingEngine::default(),
            repo.clone(),
            repo.clone(),
        );
        let lock = Arc::new(TestLock::default());
        let sweep = ReconciliationSweep::new(registry, repo.clone()).with_lock(lock.clone(), 60);

        orch.purchase(request(account_id), &settings()).await.unwrap();
        mock.push_status("finished", None);

        let report = sweep.run_once(&settings()).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.completed, 1);
        assert_eq!(lock.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
        assert!(!lock.held.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let repo = Arc::new(MemoryRepository::new());
        let account_id = seeded_account(&repo, 1000).await;
        let provider = Arc::new(provider_priced(700).with_fulfill_success(None));
        let mock = provider.clone();
        let (orch, sweep) = wire(repo.clone(), provider);

        orch.purchase(request(account_id), &settings()).await.unwrap();
        mock.push_status("banned", None);

        sweep.run_once(&settings()).await.unwrap();
        // Second pass: nothing unresolved remains, nothing double-refunds.
        let report = sweep.run_once(&settings()).await.unwrap();
        assert_eq!(report.examined, 0);
        let account = repo.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, Decimal::from(1000));
    }
}
