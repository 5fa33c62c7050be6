use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// A cache read; `fresh` is false when the entry outlived its TTL and is
/// being served as an outage fallback.
#[derive(Debug, Clone)]
pub struct CacheHit<T> {
    pub entries: Vec<T>,
    pub fresh: bool,
}

struct CachedResponse<T> {
    entries: Vec<T>,
    fetched_at: DateTime<Utc>,
}

/// Short-TTL cache for provider catalog/price responses.
///
/// Read-mostly, last-writer-wins on refresh. An empty upstream response never
/// overwrites a cached non-empty one, so a vendor outage does not read as
/// zero inventory.
pub struct ResponseCache<T> {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedResponse<T>>>,
}

impl<T: Clone> ResponseCache<T> {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_secs),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<CacheHit<T>> {
        let guard = self.entries.read().unwrap_or_else(|e| e.into_inner());
        guard.get(key).map(|cached| CacheHit {
            entries: cached.entries.clone(),
            fresh: Utc::now() - cached.fetched_at < self.ttl,
        })
    }

    /// Store a response. Returns false when the write was refused because an
    /// empty result would have replaced a non-empty one.
    pub fn put(&self, key: &str, entries: Vec<T>) -> bool {
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.is_empty() {
            if let Some(existing) = guard.get(key) {
                if !existing.entries.is_empty() {
                    return false;
                }
            }
        }
        guard.insert(
            key.to_string(),
            CachedResponse {
                entries,
                fetched_at: Utc::now(),
            },
        );
        true
    }

    pub fn invalidate(&self, key: &str) {
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        guard.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_never_overwrites_non_empty() {
        let cache = ResponseCache::new(60);
        assert!(cache.put("ng:esim", vec!["plan-a", "plan-b"]));

        // Upstream outage produces an empty response.
        assert!(!cache.put("ng:esim", Vec::new()));

        let hit = cache.get("ng:esim").unwrap();
        assert_eq!(hit.entries, vec!["plan-a", "plan-b"]);
    }

    #[test]
    fn test_empty_stores_when_nothing_cached() {
        let cache: ResponseCache<&str> = ResponseCache::new(60);
        assert!(cache.put("ng:esim", Vec::new()));
        assert!(cache.get("ng:esim").unwrap().entries.is_empty());
    }

    #[test]
    fn test_stale_entries_still_served() {
        let cache = ResponseCache::new(0);
        cache.put("ng:esim", vec!["plan-a"]);

        let hit = cache.get("ng:esim").unwrap();
        assert!(!hit.fresh);
        assert_eq!(hit.entries, vec!["plan-a"]);
    }

    #[test]
    fn test_refresh_overwrites() {
        let cache = ResponseCache::new(60);
        cache.put("ng:esim", vec!["plan-a"]);
        cache.put("ng:esim", vec!["plan-b"]);
        assert_eq!(cache.get("ng:esim").unwrap().entries, vec!["plan-b"]);
    }

    #[test]
    fn test_invalidate() {
        let cache = ResponseCache::new(60);
        cache.put("ng:esim", vec!["plan-a"]);
        cache.invalidate("ng:esim");
        assert!(cache.get("ng:esim").is_none());
    }
}
