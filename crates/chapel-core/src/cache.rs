//! Persistent cache store.
//!
//! A best-effort layer over the `cache_entries` collection. Writes never
//! fail the caller and read failures degrade to a miss, so a broken
//! database can never take down the interceptor chain.

use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use chapel_types::{CacheEntry, CacheStats};

use crate::SharedStore;
use crate::error::Result;

/// Metadata key prefix for per-collection last successful fetch times.
pub const LAST_SYNC_PREFIX: &str = "last_sync:";

/// Normalize an endpoint into a cache key.
///
/// The origin is dropped and query parameters are sorted, so
/// `https://host/api/tasks?b=2&a=1` and `/api/tasks?a=1&b=2` share an entry.
pub fn cache_key(endpoint: &str) -> String {
    let path = strip_origin(endpoint);
    let (path, query) = match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    };
    let path = path.split('#').next().unwrap_or(path);

    match query {
        Some(q) => {
            let q = q.split('#').next().unwrap_or(q);
            let mut params: Vec<&str> = q.split('&').filter(|p| !p.is_empty()).collect();
            if params.is_empty() {
                return path.to_string();
            }
            params.sort_unstable();
            format!("{}?{}", path, params.join("&"))
        }
        None => path.to_string(),
    }
}

/// The path portion of an absolute URL, or the input itself when relative.
pub(crate) fn strip_origin(endpoint: &str) -> &str {
    let rest = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"));
    match rest {
        Some(rest) => match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "/",
        },
        None => endpoint,
    }
}

/// Local durable key to payload map used for offline reads.
#[derive(Clone)]
pub struct CacheStore {
    store: SharedStore,
}

impl CacheStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Upsert a payload. Storage failures are logged and swallowed.
    pub async fn put(&self, key: &str, payload: Value, etag: Option<String>) {
        let entry = CacheEntry::new(key, payload).with_etag(etag);
        let store = self.store.lock().await;
        match store.put_cache_entry(&entry) {
            Ok(()) => debug!("Cached {}", key),
            Err(e) => warn!("Failed to cache {}: {}", key, e),
        }
    }

    /// Read a payload, treating entries older than `max_age` as missing.
    pub async fn get(&self, key: &str, max_age: Option<Duration>) -> Option<Value> {
        let entry = self.get_entry(key).await?;
        if let Some(max_age) = max_age {
            let max_age = time::Duration::try_from(max_age).unwrap_or(time::Duration::MAX);
            if entry.is_expired(max_age, OffsetDateTime::now_utc()) {
                debug!("Cache entry {} expired", key);
                return None;
            }
        }
        Some(entry.payload)
    }

    /// Full entry including timestamps, or `None` on miss or storage failure.
    pub async fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let store = self.store.lock().await;
        match store.get_cache_entry(key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cache read for {} failed, treating as miss: {}", key, e);
                None
            }
        }
    }

    pub async fn delete(&self, key: &str) {
        let store = self.store.lock().await;
        if let Err(e) = store.delete_cache_entry(key) {
            warn!("Failed to delete cache entry {}: {}", key, e);
        }
    }

    /// Wipe every entry. Unlike the other writes this reports failure, since
    /// it is an explicit user action.
    pub async fn clear(&self) -> Result<usize> {
        let n = self.store.lock().await.clear_cache()?;
        info!("Cleared {} cache entries", n);
        Ok(n)
    }

    /// Cache statistics. Empty stats on storage failure.
    pub async fn stats(&self) -> CacheStats {
        let store = self.store.lock().await;
        store.cache_stats().unwrap_or_else(|e| {
            warn!("Failed to read cache stats: {}", e);
            CacheStats::default()
        })
    }

    pub async fn keys(&self) -> Vec<String> {
        let store = self.store.lock().await;
        store.list_cache_keys().unwrap_or_else(|e| {
            warn!("Failed to list cache keys: {}", e);
            Vec::new()
        })
    }

    /// Remove entries older than `max_age`. An age reaching past the
    /// representable calendar evicts nothing.
    pub async fn evict_older_than(&self, max_age: Duration) -> usize {
        let Some(cutoff) = time::Duration::try_from(max_age)
            .ok()
            .and_then(|age| OffsetDateTime::now_utc().checked_sub(age))
        else {
            debug!("Cache max age {:?} predates any entry, nothing to evict", max_age);
            return 0;
        };
        let store = self.store.lock().await;
        store.evict_cache_older_than(cutoff).unwrap_or_else(|e| {
            warn!("Cache eviction failed: {}", e);
            0
        })
    }

    /// Evict stale entries once the cache has outgrown `max_size_bytes`.
    pub async fn maintain(&self, max_size_bytes: u64, max_age: Duration) -> usize {
        let stats = self.stats().await;
        if stats.total_size <= max_size_bytes {
            return 0;
        }
        let evicted = self.evict_older_than(max_age).await;
        info!(
            "Cache at {} bytes exceeds {} bytes, evicted {} stale entries",
            stats.total_size, max_size_bytes, evicted
        );
        evicted
    }

    /// Record a successful fetch for a collection.
    pub async fn record_sync_time(&self, collection: &str) {
        let key = format!("{}{}", LAST_SYNC_PREFIX, collection);
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let store = self.store.lock().await;
        if let Err(e) = store.set_metadata(&key, &now) {
            warn!("Failed to record sync time for {}: {}", collection, e);
        }
    }

    /// Unix time of the last successful fetch for a collection.
    pub async fn last_sync_time(&self, collection: &str) -> Option<OffsetDateTime> {
        let key = format!("{}{}", LAST_SYNC_PREFIX, collection);
        let store = self.store.lock().await;
        let secs: i64 = store.get_metadata(&key).ok().flatten()?;
        OffsetDateTime::from_unix_timestamp(secs).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chapel_store::Store;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn cache() -> CacheStore {
        CacheStore::new(Arc::new(Mutex::new(Store::open_in_memory().unwrap())))
    }

    #[test]
    fn test_cache_key_normalization() {
        assert_eq!(cache_key("/api/users"), "/api/users");
        assert_eq!(cache_key("https://app.example.org/api/users"), "/api/users");
        assert_eq!(cache_key("/api/tasks?b=2&a=1"), "/api/tasks?a=1&b=2");
        assert_eq!(cache_key("/api/tasks?"), "/api/tasks");
        assert_eq!(cache_key("http://host"), "/");
        assert_eq!(cache_key("/api/tasks#top"), "/api/tasks");
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = cache();
        cache.put("/api/users", json!([{"id": 1}]), None).await;
        assert_eq!(cache.get("/api/users", None).await, Some(json!([{"id": 1}])));

        cache.put("/api/users", json!([]), Some("\"v2\"".into())).await;
        let entry = cache.get_entry("/api/users").await.unwrap();
        assert_eq!(entry.payload, json!([]));
        assert_eq!(entry.etag.as_deref(), Some("\"v2\""));
    }

    #[tokio::test]
    async fn test_get_respects_max_age() {
        let cache = cache();
        cache.put("/api/events", json!([1]), None).await;
        assert!(cache.get("/api/events", Some(Duration::from_secs(60))).await.is_some());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get("/api/events", Some(Duration::from_millis(1))).await.is_none());
        assert!(cache.get("/api/events", None).await.is_some());
    }

    #[tokio::test]
    async fn test_delete_clear_and_stats() {
        let cache = cache();
        cache.put("/a", json!(1), None).await;
        cache.put("/b", json!(2), None).await;
        assert_eq!(cache.stats().await.total_items, 2);

        cache.delete("/a").await;
        assert!(cache.get("/a", None).await.is_none());
        assert_eq!(cache.clear().await.unwrap(), 1);
        assert_eq!(cache.stats().await.total_items, 0);
    }

    #[tokio::test]
    async fn test_maintain_only_when_oversized() {
        let cache = cache();
        cache.put("/a", json!("x".repeat(100)), None).await;

        assert_eq!(cache.maintain(1024 * 1024, Duration::ZERO).await, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.maintain(10, Duration::ZERO).await, 1);
    }

    #[tokio::test]
    async fn test_unbounded_max_age_evicts_nothing() {
        let cache = cache();
        cache.put("/a", json!("x".repeat(100)), None).await;

        assert_eq!(cache.evict_older_than(Duration::MAX).await, 0);
        assert_eq!(cache.maintain(1, Duration::from_secs(u64::MAX)).await, 0);
        assert!(cache.get("/a", None).await.is_some());
    }

    #[tokio::test]
    async fn test_record_sync_time() {
        let cache = cache();
        assert!(cache.last_sync_time("users").await.is_none());
        cache.record_sync_time("users").await;
        assert!(cache.last_sync_time("users").await.is_some());
    }
}
