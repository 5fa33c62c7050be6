use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::kind::ProductKind;

/// The markup policy applied at charge time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PricingPolicy {
    /// Markup applied to the converted cost, in percent (200 = 2x).
    pub markup_percentage: Decimal,

    /// Floor for the final retail price, in local currency.
    pub min_price: Decimal,

    /// Flat fee added on top of the marked-up cost.
    pub platform_fee: Decimal,

    /// Upstream cost currency -> local currency rate, injected, never discovered.
    pub exchange_rate: Decimal,
}

impl PricingPolicy {
    /// Hard-coded policy used when the configured one is unusable.
    pub fn fallback() -> Self {
        Self {
            markup_percentage: Decimal::from(200),
            min_price: Decimal::from(500),
            platform_fee: Decimal::ZERO,
            exchange_rate: Decimal::from(1600),
        }
    }
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self::fallback()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionSettings {
    /// Fraction of the purchase amount credited to the referrer (0.10 = 10%).
    pub rate: Decimal,

    /// Number of purchases per referred account that earn commission.
    pub max_purchases: i64,
}

impl Default for CommissionSettings {
    fn default() -> Self {
        Self {
            rate: Decimal::new(10, 2),
            max_purchases: 3,
        }
    }
}

/// Versioned snapshot of the hot-reloadable platform configuration.
///
/// A snapshot is taken once per operation and passed down explicitly; callers
/// never read a mutable global mid-flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSettings {
    /// Monotonic version, bumped on every refresh.
    pub version: u64,

    pub pricing: PricingPolicy,

    /// Per-provider enable flags; absent means enabled.
    #[serde(default)]
    pub provider_enabled: HashMap<String, bool>,

    /// Per-kind minimum purchase amount in local currency.
    #[serde(default)]
    pub min_purchase: HashMap<ProductKind, Decimal>,

    /// Maximum simultaneously open (non-terminal) orders per account.
    pub max_open_orders: i64,

    pub commission: CommissionSettings,

    /// Deadline for a single provider fulfill call.
    pub fulfillment_timeout_secs: u64,

    /// Per-kind order lifetime, minutes; the sweep expires orders past it.
    #[serde(default)]
    pub order_ttl_minutes: HashMap<ProductKind, i64>,

    /// How long an order may sit reserved with no provider reference before
    /// the sweep times it out to a refund.
    pub pending_grace_minutes: i64,
}

impl PlatformSettings {
    pub fn is_provider_enabled(&self, identifier: &str) -> bool {
        self.provider_enabled.get(identifier).copied().unwrap_or(true)
    }

    pub fn min_purchase_for(&self, kind: ProductKind) -> Decimal {
        self.min_purchase.get(&kind).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn order_ttl_for(&self, kind: ProductKind) -> i64 {
        self.order_ttl_minutes.get(&kind).copied().unwrap_or(20)
    }
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            version: 0,
            pricing: PricingPolicy::default(),
            provider_enabled: HashMap::new(),
            min_purchase: HashMap::new(),
            max_open_orders: 10,
            commission: CommissionSettings::default(),
            fulfillment_timeout_secs: 30,
            order_ttl_minutes: HashMap::new(),
            pending_grace_minutes: 15,
        }
    }
}
