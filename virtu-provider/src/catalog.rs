use std::sync::Arc;
use tracing::warn;

use crate::registry::ProviderRegistry;
use virtu_catalog::ResponseCache;
use virtu_core::provider::{CatalogEntry, CatalogFilters};
use virtu_core::{CoreError, CoreResult};

/// Catalog read; `warning` marks results served from cache because the
/// upstream fetch failed or came back empty.
#[derive(Debug, Clone)]
pub struct CatalogResponse {
    pub entries: Vec<CatalogEntry>,
    pub warning: bool,
}

/// Cached view over provider catalogs.
pub struct CatalogService {
    registry: Arc<ProviderRegistry>,
    cache: ResponseCache<CatalogEntry>,
}

impl CatalogService {
    pub fn new(registry: Arc<ProviderRegistry>, ttl_secs: i64) -> Self {
        Self {
            registry,
            cache: ResponseCache::new(ttl_secs),
        }
    }

    pub async fn catalog(
        &self,
        provider_identifier: &str,
        region: &str,
        filters: &CatalogFilters,
    ) -> CoreResult<CatalogResponse> {
        let key = format!("{}:{}", provider_identifier, region);

        if let Some(hit) = self.cache.get(&key) {
            if hit.fresh {
                return Ok(CatalogResponse {
                    entries: hit.entries,
                    warning: false,
                });
            }
        }

        let provider = self
            .registry
            .by_identifier(provider_identifier)
            .ok_or_else(|| CoreError::NotFound(format!("provider {}", provider_identifier)))?;

        match provider.get_catalog(region, filters).await {
            Ok(entries) => {
                if self.cache.put(&key, entries.clone()) {
                    Ok(CatalogResponse {
                        entries,
                        warning: false,
                    })
                } else {
                    // Empty refresh refused; keep serving the cached catalog.
                    let hit = self.cache.get(&key).ok_or_else(|| {
                        CoreError::Internal("catalog cache dropped a guarded entry".to_string())
                    })?;
                    warn!(
                        provider = provider_identifier,
                        region, "empty catalog fetch, serving cached entries"
                    );
                    Ok(CatalogResponse {
                        entries: hit.entries,
                        warning: true,
                    })
                }
            }
            Err(err) => match self.cache.get(&key) {
                Some(hit) if !hit.entries.is_empty() => {
                    warn!(
                        provider = provider_identifier,
                        region,
                        error = %err,
                        "catalog fetch failed, serving cached entries"
                    );
                    Ok(CatalogResponse {
                        entries: hit.entries,
                        warning: true,
                    })
                }
                _ => Err(err),
            },
        }
    }
}
