use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use virtu_core::order::OrderStatus;
use virtu_core::provider::{
    CatalogEntry, CatalogFilters, FulfillmentOutcome, FulfillmentRequest, PriceQuote, Provider,
    ProviderBalance, ProviderDescriptor, StatusOutcome,
};
use virtu_core::{CoreError, CoreResult};
use virtu_shared::ProductKind;

/// What the mock does when asked to fulfill.
#[derive(Debug, Clone)]
pub enum FulfillBehavior {
    /// Accepts and returns a provider order id, optionally with a payload.
    Succeed {
        payload: Option<String>,
        native_status: String,
    },
    /// Responds, but declines the request (success = false).
    Decline { message: String },
    /// Transport-level failure before any order could be placed.
    Unreachable { message: String },
    /// No response within the deadline; outcome unknown.
    Timeout,
}

/// Scriptable in-memory provider used by tests and local runs.
pub struct MockProvider {
    descriptor: ProviderDescriptor,
    kind: ProductKind,
    quotes: Mutex<Vec<PriceQuote>>,
    catalog: Mutex<Vec<CatalogEntry>>,
    catalog_error: Mutex<Option<String>>,
    fulfill_behavior: Mutex<FulfillBehavior>,
    scripted_statuses: Mutex<VecDeque<StatusOutcome>>,
    cancel_confirms: AtomicBool,
    pub quote_calls: AtomicUsize,
    pub fulfill_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(identifier: &str, kind: ProductKind) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                identifier: identifier.to_string(),
                display_name: identifier.to_string(),
                cost_currency: "USD".to_string(),
                priority: 100,
            },
            kind,
            quotes: Mutex::new(Vec::new()),
            catalog: Mutex::new(Vec::new()),
            catalog_error: Mutex::new(None),
            fulfill_behavior: Mutex::new(FulfillBehavior::Succeed {
                payload: None,
                native_status: "waiting".to_string(),
            }),
            scripted_statuses: Mutex::new(VecDeque::new()),
            cancel_confirms: AtomicBool::new(true),
            quote_calls: AtomicUsize::new(0),
            fulfill_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.descriptor.priority = priority;
        self
    }

    pub fn with_quote(self, operator: &str, cost: Decimal, available_count: i64) -> Self {
        self.quotes.lock().unwrap().push(PriceQuote {
            operator: operator.to_string(),
            cost,
            currency: self.descriptor.cost_currency.clone(),
            available_count,
        });
        self
    }

    pub fn with_catalog_entry(self, code: &str, cost: Decimal, available: bool) -> Self {
        self.catalog.lock().unwrap().push(CatalogEntry {
            code: code.to_string(),
            display_name: code.to_string(),
            cost,
            cost_currency: self.descriptor.cost_currency.clone(),
            available,
        });
        self
    }

    pub fn with_fulfill_success(self, payload: Option<&str>) -> Self {
        *self.fulfill_behavior.lock().unwrap() = FulfillBehavior::Succeed {
            payload: payload.map(|p| p.to_string()),
            native_status: "waiting".to_string(),
        };
        self
    }

    pub fn with_fulfill_decline(self, message: &str) -> Self {
        *self.fulfill_behavior.lock().unwrap() = FulfillBehavior::Decline {
            message: message.to_string(),
        };
        self
    }

    pub fn with_fulfill_unreachable(self, message: &str) -> Self {
        *self.fulfill_behavior.lock().unwrap() = FulfillBehavior::Unreachable {
            message: message.to_string(),
        };
        self
    }

    pub fn with_fulfill_timeout(self) -> Self {
        *self.fulfill_behavior.lock().unwrap() = FulfillBehavior::Timeout;
        self
    }

    pub fn with_cancel_refused(self) -> Self {
        self.cancel_confirms.store(false, Ordering::SeqCst);
        self
    }

    /// Simulate an upstream that starts answering with zero inventory.
    pub fn clear_quotes(&self) {
        self.quotes.lock().unwrap().clear();
    }

    /// Simulate an upstream that starts answering with an empty catalog.
    pub fn clear_catalog(&self) {
        self.catalog.lock().unwrap().clear();
    }

    /// Make every catalog fetch fail with `ProviderUnavailable`.
    pub fn set_catalog_unreachable(&self, message: &str) {
        *self.catalog_error.lock().unwrap() = Some(message.to_string());
    }

    /// Queue a status response; `check_status` consumes them in order and
    /// falls back to "waiting" when the script runs out.
    pub fn push_status(&self, native_status: &str, delivered_payload: Option<&str>) {
        self.scripted_statuses.lock().unwrap().push_back(StatusOutcome {
            success: true,
            native_status: native_status.to_string(),
            delivered_payload: delivered_payload.map(|p| p.to_string()),
            error_message: None,
        });
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        self.descriptor.clone()
    }

    fn kind(&self) -> ProductKind {
        self.kind
    }

    fn map_status(&self, native_status: &str) -> OrderStatus {
        match native_status {
            "pending" => OrderStatus::Pending,
            "waiting" | "received" => OrderStatus::Processing,
            "finished" | "completed" => OrderStatus::Completed,
            "cancelled" => OrderStatus::Cancelled,
            "banned" | "failed" => OrderStatus::Failed,
            _ => OrderStatus::Processing,
        }
    }

    async fn get_balance(&self) -> CoreResult<ProviderBalance> {
        Ok(ProviderBalance {
            success: true,
            balance: Decimal::from(1000),
            currency: self.descriptor.cost_currency.clone(),
        })
    }

    async fn get_catalog(
        &self,
        _region: &str,
        filters: &CatalogFilters,
    ) -> CoreResult<Vec<CatalogEntry>> {
        if let Some(message) = self.catalog_error.lock().unwrap().clone() {
            return Err(CoreError::ProviderUnavailable(message));
        }
        let catalog = self.catalog.lock().unwrap().clone();
        Ok(match &filters.search {
            Some(needle) => catalog
                .into_iter()
                .filter(|e| e.code.contains(needle.as_str()))
                .collect(),
            None => catalog,
        })
    }

    async fn quote_price(&self, _region: &str, _item_code: &str) -> CoreResult<Vec<PriceQuote>> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.quotes.lock().unwrap().clone())
    }

    async fn fulfill(&self, request: &FulfillmentRequest) -> CoreResult<FulfillmentOutcome> {
        self.fulfill_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.fulfill_behavior.lock().unwrap().clone();
        match behavior {
            FulfillBehavior::Succeed {
                payload,
                native_status,
            } => Ok(FulfillmentOutcome {
                success: true,
                provider_order_id: format!("mock-{}", Uuid::new_v4().simple()),
                delivered_payload: payload,
                native_status,
                error_message: None,
            }),
            FulfillBehavior::Decline { message } => Ok(FulfillmentOutcome {
                success: false,
                provider_order_id: String::new(),
                delivered_payload: None,
                native_status: "failed".to_string(),
                error_message: Some(message),
            }),
            FulfillBehavior::Unreachable { message } => {
                Err(CoreError::ProviderUnavailable(message))
            }
            FulfillBehavior::Timeout => Err(CoreError::ProviderTimeout(format!(
                "no response for order {}",
                request.order_id
            ))),
        }
    }

    async fn check_status(
        &self,
        _provider_order_id: &str,
        _account_id: Uuid,
    ) -> CoreResult<StatusOutcome> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .scripted_statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StatusOutcome {
                success: true,
                native_status: "waiting".to_string(),
                delivered_payload: None,
                error_message: None,
            }))
    }

    async fn cancel(&self, _provider_order_id: &str, _account_id: Uuid) -> CoreResult<bool> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.cancel_confirms.load(Ordering::SeqCst))
    }

    async fn finish(&self, _provider_order_id: &str, _account_id: Uuid) -> CoreResult<bool> {
        Ok(true)
    }

    async fn report_bad(&self, _provider_order_id: &str, _account_id: Uuid) -> CoreResult<bool> {
        Ok(true)
    }
}
