use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use virtu_shared::ProductKind;

use crate::order::OrderStatus;
use crate::CoreResult;

/// Static identity of an external fulfiller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub identifier: String,
    pub display_name: String,
    /// Currency the provider quotes costs in.
    pub cost_currency: String,
    /// Tie-break order for selection; lower wins.
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderBalance {
    pub success: bool,
    pub balance: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogEntry {
    pub code: String,
    pub display_name: String,
    pub cost: Decimal,
    pub cost_currency: String,
    pub available: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CatalogFilters {
    pub operator: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceQuote {
    pub operator: String,
    pub cost: Decimal,
    pub currency: String,
    pub available_count: i64,
}

#[derive(Debug, Clone)]
pub struct FulfillmentRequest {
    pub order_id: Uuid,
    pub account_id: Uuid,
    pub region: String,
    pub operator: String,
    pub item_code: String,
}

#[derive(Debug, Clone)]
pub struct FulfillmentOutcome {
    pub success: bool,
    pub provider_order_id: String,
    pub delivered_payload: Option<String>,
    /// Provider's native status string; translated via `Provider::map_status`.
    pub native_status: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatusOutcome {
    pub success: bool,
    pub native_status: String,
    pub delivered_payload: Option<String>,
    pub error_message: Option<String>,
}

/// Contract every external fulfiller is wrapped in; one implementation per
/// (product kind, upstream vendor). The registry holds these as a closed set
/// resolved at startup.
#[async_trait]
pub trait Provider: Send + Sync {
    fn descriptor(&self) -> ProviderDescriptor;

    fn kind(&self) -> ProductKind;

    /// Translate the provider's native status vocabulary into the order
    /// lifecycle.
    fn map_status(&self, native_status: &str) -> OrderStatus;

    async fn get_balance(&self) -> CoreResult<ProviderBalance>;

    async fn get_catalog(
        &self,
        region: &str,
        filters: &CatalogFilters,
    ) -> CoreResult<Vec<CatalogEntry>>;

    async fn quote_price(&self, region: &str, item_code: &str) -> CoreResult<Vec<PriceQuote>>;

    async fn fulfill(&self, request: &FulfillmentRequest) -> CoreResult<FulfillmentOutcome>;

    async fn check_status(
        &self,
        provider_order_id: &str,
        account_id: Uuid,
    ) -> CoreResult<StatusOutcome>;

    /// Ask the vendor to cancel; `false` means the vendor refused.
    async fn cancel(&self, provider_order_id: &str, account_id: Uuid) -> CoreResult<bool>;

    /// Confirm the deliverable was received.
    async fn finish(&self, provider_order_id: &str, account_id: Uuid) -> CoreResult<bool>;

    /// Flag the deliverable as bad/disputed.
    async fn report_bad(&self, provider_order_id: &str, account_id: Uuid) -> CoreResult<bool>;
}
