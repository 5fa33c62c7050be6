use rust_decimal::Decimal;
use virtu_shared::{money, PricingPolicy};

/// Pure cost -> retail price function.
///
/// `max(round_2(cost * exchange_rate * markup/100 + platform_fee), min_price)`.
/// Deterministic, so a historical price is re-derivable from the policy
/// snapshot stored with the order.
pub fn retail_price(cost: Decimal, policy: &PricingPolicy) -> Decimal {
    let converted = cost * policy.exchange_rate * policy.markup_percentage / Decimal::from(100);
    let price = money::round(converted + policy.platform_fee);
    price.max(policy.min_price)
}

/// Markup engine applied at charge time.
pub struct PricingEngine {
    /// Used when the injected policy is unusable; a broken exchange rate
    /// must never produce a zero price.
    fallback: PricingPolicy,
}

impl PricingEngine {
    pub fn new(fallback: PricingPolicy) -> Self {
        Self { fallback }
    }

    /// Price an upstream cost under the given policy snapshot, failing closed
    /// to the fallback policy when the exchange rate is missing or zero.
    pub fn quote(&self, cost: Decimal, policy: &PricingPolicy) -> Decimal {
        if policy.exchange_rate <= Decimal::ZERO {
            tracing::warn!(
                exchange_rate = %policy.exchange_rate,
                "unusable exchange rate in pricing policy, using fallback"
            );
            return retail_price(cost, &self.fallback);
        }
        retail_price(cost, policy)
    }
}

impl Default for PricingEngine {
    fn default() -> Self {
        Self::new(PricingPolicy::fallback())
    }
}
