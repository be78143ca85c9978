//! Load result caching

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;

use crate::api::LoadResult;

/// Store of load results keyed by source location
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Fresh result for `key`, if any
    async fn get(&self, key: &str) -> Option<LoadResult>;

    async fn set(&self, key: &str, result: LoadResult, ttl: Duration);

    async fn invalidate(&self, key: &str);

    async fn clear(&self);
}

/// Stand-in expiry for TTLs too large to represent
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Clone)]
struct CachedEntry {
    result: LoadResult,
    expires_at: Instant,
}

/// In-memory [`ResultCache`] with a per-entry time to live
pub struct MemoryResultCache {
    cache: Cache<String, CachedEntry>,
}

impl MemoryResultCache {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder().max_capacity(max_entries).build();
        Self { cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for MemoryResultCache {
    fn default() -> Self {
        Self::new(1_024)
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn get(&self, key: &str) -> Option<LoadResult> {
        let entry = self.cache.get(key).await?;
        if entry.expires_at <= Instant::now() {
            self.cache.invalidate(key).await;
            return None;
        }
        Some(entry.result)
    }

    async fn set(&self, key: &str, result: LoadResult, ttl: Duration) {
        let now = Instant::now();
        let entry = CachedEntry {
            result,
            expires_at: now.checked_add(ttl).unwrap_or(now + FAR_FUTURE),
        };
        self.cache.insert(key.to_string(), entry).await;
    }

    async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    async fn clear(&self) {
        self.cache.invalidate_all();
    }
}
