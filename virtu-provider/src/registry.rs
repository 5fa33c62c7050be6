use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::warn;

use virtu_catalog::{PricingEngine, ResponseCache};
use virtu_core::order::Order;
use virtu_core::provider::{PriceQuote, Provider};
use virtu_core::{CoreError, CoreResult};
use virtu_shared::{PlatformSettings, ProductKind};

/// How a purchase chooses among interchangeable providers.
#[derive(Debug, Clone)]
pub enum SelectionStrategy {
    /// Quote every enabled provider, price each through the engine, take the
    /// minimum; ties broken by configured priority.
    Cheapest,
    /// Take the highest-priority enabled provider that has stock.
    Fastest,
    /// Route to this provider or fail.
    Explicit(String),
}

/// The winning provider plus the quote the charge will be based on.
pub struct SelectedQuote {
    pub provider: Arc<dyn Provider>,
    pub operator: String,
    pub cost: Decimal,
    pub retail_price: Decimal,
}

impl std::fmt::Debug for SelectedQuote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedQuote")
            .field("operator", &self.operator)
            .field("cost", &self.cost)
            .field("retail_price", &self.retail_price)
            .finish_non_exhaustive()
    }
}

/// Default freshness window for cached price quotes.
const QUOTE_TTL_SECS: i64 = 60;

/// Closed set of provider instances, resolved once at startup. Selection is
/// exhaustive over the set; there is no string dispatch past this point.
///
/// Price quotes are cached per provider/region/item with a short TTL so a
/// burst of purchases does not hammer every vendor's quote endpoint.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
    quotes: ResponseCache<PriceQuote>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            providers,
            quotes: ResponseCache::new(QUOTE_TTL_SECS),
        }
    }

    pub fn with_quote_ttl(mut self, ttl_secs: i64) -> Self {
        self.quotes = ResponseCache::new(ttl_secs);
        self
    }

    /// Quote an item through the cache. Stale or guarded entries still serve
    /// when the upstream errors out or answers empty.
    async fn quotes_for(
        &self,
        provider: &Arc<dyn Provider>,
        region: &str,
        item_code: &str,
    ) -> CoreResult<Vec<PriceQuote>> {
        let key = format!(
            "{}:{}:{}",
            provider.descriptor().identifier,
            region,
            item_code
        );

        if let Some(hit) = self.quotes.get(&key) {
            if hit.fresh {
                return Ok(hit.entries);
            }
        }

        match provider.quote_price(region, item_code).await {
            Ok(quotes) => {
                if self.quotes.put(&key, quotes.clone()) {
                    Ok(quotes)
                } else {
                    // Empty refresh refused; keep quoting from the cached set.
                    let hit = self.quotes.get(&key).ok_or_else(|| {
                        CoreError::Internal("quote cache dropped a guarded entry".to_string())
                    })?;
                    warn!(
                        provider = %provider.descriptor().identifier,
                        item_code, "empty quote refresh, serving cached quotes"
                    );
                    Ok(hit.entries)
                }
            }
            Err(err) => match self.quotes.get(&key) {
                Some(hit) if !hit.entries.is_empty() => {
                    warn!(
                        provider = %provider.descriptor().identifier,
                        item_code,
                        error = %err,
                        "quote fetch failed, serving cached quotes"
                    );
                    Ok(hit.entries)
                }
                _ => Err(err),
            },
        }
    }

    pub fn by_identifier(&self, identifier: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|p| p.descriptor().identifier == identifier)
            .cloned()
    }

    /// Resolve the exact provider instance that served an order, so later
    /// lifecycle calls route to the vendor that holds it.
    pub fn for_order(&self, order: &Order) -> CoreResult<Arc<dyn Provider>> {
        self.by_identifier(&order.provider_identifier).ok_or_else(|| {
            CoreError::NotFound(format!(
                "provider {} for order {}",
                order.provider_identifier, order.id
            ))
        })
    }

    fn enabled_for(
        &self,
        kind: ProductKind,
        settings: &PlatformSettings,
    ) -> Vec<Arc<dyn Provider>> {
        let mut candidates: Vec<Arc<dyn Provider>> = self
            .providers
            .iter()
            .filter(|p| p.kind() == kind)
            .filter(|p| settings.is_provider_enabled(&p.descriptor().identifier))
            .cloned()
            .collect();
        candidates.sort_by_key(|p| p.descriptor().priority);
        candidates
    }

    pub async fn select_best(
        &self,
        kind: ProductKind,
        region: &str,
        item_code: &str,
        strategy: &SelectionStrategy,
        engine: &PricingEngine,
        settings: &PlatformSettings,
    ) -> CoreResult<SelectedQuote> {
        match strategy {
            SelectionStrategy::Explicit(identifier) => {
                let provider = self
                    .by_identifier(identifier)
                    .filter(|p| p.kind() == kind)
                    .ok_or_else(|| CoreError::NotFound(format!("provider {}", identifier)))?;
                if !settings.is_provider_enabled(identifier) {
                    return Err(CoreError::ProviderUnavailable(format!(
                        "provider {} is disabled",
                        identifier
                    )));
                }
                let quotes = self.quotes_for(&provider, region, item_code).await?;
                let quote = in_stock_minimum(quotes).ok_or_else(|| {
                    CoreError::InventoryExhausted(format!("{} at {}", item_code, identifier))
                })?;
                Ok(self.to_selected(provider, quote, engine, settings))
            }
            SelectionStrategy::Fastest => {
                let candidates = self.enabled_for(kind, settings);
                if candidates.is_empty() {
                    return Err(CoreError::ProviderUnavailable(format!(
                        "no enabled providers for {}",
                        kind
                    )));
                }
                let mut any_responded = false;
                for provider in candidates {
                    match self.quotes_for(&provider, region, item_code).await {
                        Ok(quotes) => {
                            any_responded = true;
                            if let Some(quote) = in_stock_minimum(quotes) {
                                return Ok(self.to_selected(provider, quote, engine, settings));
                            }
                        }
                        Err(err) => {
                            warn!(
                                provider = %provider.descriptor().identifier,
                                error = %err,
                                "quote failed, skipping provider"
                            );
                        }
                    }
                }
                Err(exhausted_or_unavailable(any_responded, kind, item_code))
            }
            SelectionStrategy::Cheapest => {
                let candidates = self.enabled_for(kind, settings);
                if candidates.is_empty() {
                    return Err(CoreError::ProviderUnavailable(format!(
                        "no enabled providers for {}",
                        kind
                    )));
                }
                let mut any_responded = false;
                let mut best: Option<(SelectedQuote, i32)> = None;
                for provider in candidates {
                    let priority = provider.descriptor().priority;
                    match self.quotes_for(&provider, region, item_code).await {
                        Ok(quotes) => {
                            any_responded = true;
                            if let Some(quote) = in_stock_minimum(quotes) {
                                let selected =
                                    self.to_selected(provider, quote, engine, settings);
                                let better = match &best {
                                    None => true,
                                    Some((current, current_priority)) => {
                                        selected.retail_price < current.retail_price
                                            || (selected.retail_price == current.retail_price
                                                && priority < *current_priority)
                                    }
                                };
                                if better {
                                    best = Some((selected, priority));
                                }
                            }
                        }
                        Err(err) => {
                            warn!(
                                provider = %provider.descriptor().identifier,
                                error = %err,
                                "quote failed, skipping provider"
                            );
                        }
                    }
                }
                match best {
                    Some((selected, _)) => Ok(selected),
                    None => Err(exhausted_or_unavailable(any_responded, kind, item_code)),
                }
            }
        }
    }

    fn to_selected(
        &self,
        provider: Arc<dyn Provider>,
        quote: PriceQuote,
        engine: &PricingEngine,
        settings: &PlatformSettings,
    ) -> SelectedQuote {
        let retail_price = engine.quote(quote.cost, &settings.pricing);
        SelectedQuote {
            provider,
            operator: quote.operator,
            cost: quote.cost,
            retail_price,
        }
    }
}

/// Cheapest quote that actually has stock.
fn in_stock_minimum(quotes: Vec<PriceQuote>) -> Option<PriceQuote> {
    quotes
        .into_iter()
        .filter(|q| q.available_count > 0)
        .min_by(|a, b| a.cost.cmp(&b.cost))
}

fn exhausted_or_unavailable(any_responded: bool, kind: ProductKind, item_code: &str) -> CoreError {
    if any_responded {
        // Vendors answered but nobody has stock; callers can offer alternatives.
        CoreError::InventoryExhausted(format!("{} ({})", item_code, kind))
    } else {
        CoreError::ProviderUnavailable(format!("all providers for {} failed to quote", kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use virtu_shared::PricingPolicy;

    fn settings() -> PlatformSettings {
        PlatformSettings {
            pricing: PricingPolicy {
                markup_percentage: Decimal::from(200),
                min_price: Decimal::from(500),
                platform_fee: Decimal::ZERO,
                exchange_rate: Decimal::from(1600),
            },
            ..PlatformSettings::default()
        }
    }

    fn engine() -> PricingEngine {
        PricingEngine::default()
    }

    #[tokio::test]
    async fn test_cheapest_picks_minimum_retail_price() {
        let registry = ProviderRegistry::new(vec![
            Arc::new(
                MockProvider::new("alpha", ProductKind::TempNumber)
                    .with_quote("mtn", Decimal::new(5, 1), 10),
            ),
            Arc::new(
                MockProvider::new("beta", ProductKind::TempNumber)
                    .with_quote("mtn", Decimal::new(4, 1), 10),
            ),
        ]);

        let selected = registry
            .select_best(
                ProductKind::TempNumber,
                "ng",
                "whatsapp",
                &SelectionStrategy::Cheapest,
                &engine(),
                &settings(),
            )
            .await
            .unwrap();

        assert_eq!(selected.provider.descriptor().identifier, "beta");
        // 0.4 * 1600 * 200% = 1280
        assert_eq!(selected.retail_price, Decimal::from(1280));
    }

    #[tokio::test]
    async fn test_cheapest_ties_break_by_priority() {
        let registry = ProviderRegistry::new(vec![
            Arc::new(
                MockProvider::new("alpha", ProductKind::TempNumber)
                    .with_priority(20)
                    .with_quote("mtn", Decimal::new(5, 1), 10),
            ),
            Arc::new(
                MockProvider::new("beta", ProductKind::TempNumber)
                    .with_priority(10)
                    .with_quote("mtn", Decimal::new(5, 1), 10),
            ),
        ]);

        let selected = registry
            .select_best(
                ProductKind::TempNumber,
                "ng",
                "whatsapp",
                &SelectionStrategy::Cheapest,
                &engine(),
                &settings(),
            )
            .await
            .unwrap();

        assert_eq!(selected.provider.descriptor().identifier, "beta");
    }

    #[tokio::test]
    async fn test_disabled_providers_are_skipped() {
        let registry = ProviderRegistry::new(vec![
            Arc::new(
                MockProvider::new("alpha", ProductKind::TempNumber)
                    .with_quote("mtn", Decimal::new(1, 1), 10),
            ),
            Arc::new(
                MockProvider::new("beta", ProductKind::TempNumber)
                    .with_quote("mtn", Decimal::new(9, 1), 10),
            ),
        ]);

        let mut settings = settings();
        settings.provider_enabled.insert("alpha".to_string(), false);

        let selected = registry
            .select_best(
                ProductKind::TempNumber,
                "ng",
                "whatsapp",
                &SelectionStrategy::Cheapest,
                &engine(),
                &settings,
            )
            .await
            .unwrap();

        assert_eq!(selected.provider.descriptor().identifier, "beta");
    }

    #[tokio::test]
    async fn test_no_stock_is_inventory_exhausted() {
        let registry = ProviderRegistry::new(vec![Arc::new(
            MockProvider::new("alpha", ProductKind::TempNumber)
                .with_quote("mtn", Decimal::new(5, 1), 0),
        )]);

        let err = registry
            .select_best(
                ProductKind::TempNumber,
                "ng",
                "whatsapp",
                &SelectionStrategy::Cheapest,
                &engine(),
                &settings(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::InventoryExhausted(_)));
    }

    #[tokio::test]
    async fn test_no_providers_is_unavailable() {
        let registry = ProviderRegistry::new(vec![]);

        let err = registry
            .select_best(
                ProductKind::Esim,
                "ng",
                "global-5gb",
                &SelectionStrategy::Cheapest,
                &engine(),
                &settings(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn test_explicit_strategy_requires_matching_provider() {
        let registry = ProviderRegistry::new(vec![Arc::new(
            MockProvider::new("alpha", ProductKind::TempNumber)
                .with_quote("mtn", Decimal::new(5, 1), 3),
        )]);

        let selected = registry
            .select_best(
                ProductKind::TempNumber,
                "ng",
                "whatsapp",
                &SelectionStrategy::Explicit("alpha".to_string()),
                &engine(),
                &settings(),
            )
            .await
            .unwrap();
        assert_eq!(selected.provider.descriptor().identifier, "alpha");

        let err = registry
            .select_best(
                ProductKind::TempNumber,
                "ng",
                "whatsapp",
                &SelectionStrategy::Explicit("missing".to_string()),
                &engine(),
                &settings(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_quotes_are_cached_between_selections() {
        let provider = Arc::new(
            MockProvider::new("alpha", ProductKind::TempNumber)
                .with_quote("mtn", Decimal::new(5, 1), 10),
        );
        let registry = ProviderRegistry::new(vec![provider.clone()]);

        for _ in 0..3 {
            registry
                .select_best(
                    ProductKind::TempNumber,
                    "ng",
                    "whatsapp",
                    &SelectionStrategy::Cheapest,
                    &engine(),
                    &settings(),
                )
                .await
                .unwrap();
        }

        // One upstream hit; the rest served from the quote cache.
        assert_eq!(
            provider.quote_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_empty_quote_refresh_serves_cached_quotes() {
        let provider = Arc::new(
            MockProvider::new("alpha", ProductKind::TempNumber)
                .with_quote("mtn", Decimal::new(5, 1), 10),
        );
        // Zero TTL so the second selection refreshes upstream.
        let registry = ProviderRegistry::new(vec![provider.clone()]).with_quote_ttl(0);

        let first = registry
            .select_best(
                ProductKind::TempNumber,
                "ng",
                "whatsapp",
                &SelectionStrategy::Cheapest,
                &engine(),
                &settings(),
            )
            .await
            .unwrap();

        provider.clear_quotes();

        let second = registry
            .select_best(
                ProductKind::TempNumber,
                "ng",
                "whatsapp",
                &SelectionStrategy::Cheapest,
                &engine(),
                &settings(),
            )
            .await
            .unwrap();

        assert_eq!(second.retail_price, first.retail_price);
        assert_eq!(second.cost, first.cost);
    }

    #[tokio::test]
    async fn test_fastest_takes_priority_order() {
        let registry = ProviderRegistry::new(vec![
            Arc::new(
                MockProvider::new("cheap-but-slow", ProductKind::SocialBoost)
                    .with_priority(50)
                    .with_quote("likes", Decimal::new(1, 1), 100),
            ),
            Arc::new(
                MockProvider::new("fast", ProductKind::SocialBoost)
                    .with_priority(1)
                    .with_quote("likes", Decimal::new(9, 1), 100),
            ),
        ]);

        let selected = registry
            .select_best(
                ProductKind::SocialBoost,
                "global",
                "ig-likes",
                &SelectionStrategy::Fastest,
                &engine(),
                &settings(),
            )
            .await
            .unwrap();

        assert_eq!(selected.provider.descriptor().identifier, "fast");
    }
}
