// Copyright (C) 2025 Fetchgate Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Memory Cache — L1 (C4): bounded LRU of CacheKey -> CachedValue, capacity
// from config, eviction by capacity alone (§4.4). No TTL.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::RwLock;
use tracing::debug;

use crate::cache_value::{CacheKey, CachedValue};

/// Thread-safe bounded LRU. Readers and writers both take the write lock
/// because `LruCache::get` mutates recency; this mirrors the teacher's
/// `RwLock<LruCache<..>>` shape, just without its memory-pressure eviction.
pub struct MemoryCache {
    inner: RwLock<LruCache<CacheKey, CachedValue>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            inner: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub async fn get(&self, key: &str) -> Option<CachedValue> {
        let mut cache = self.inner.write().await;
        cache.get(key).cloned()
    }

    pub async fn put(&self, key: CacheKey, value: CachedValue) {
        let mut cache = self.inner.write().await;
        cache.put(key.clone(), value);
        debug!(cache.key = %key, "inserted into L1 memory cache");
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        let mut cache = self.inner.write().await;
        cache.pop(key).is_some()
    }

    pub async fn clear(&self) {
        let mut cache = self.inner.write().await;
        cache.clear();
    }

    /// Live resize of the capacity ceiling (used when config is reloaded
    /// from feature flags). Over-capacity entries are evicted LRU-first.
    pub async fn resize(&self, capacity: usize) {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        let mut cache = self.inner.write().await;
        cache.resize(capacity);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn value(body: &'static str) -> CachedValue {
        CachedValue::new(Bytes::from_static(body.as_bytes()), vec![], 200)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let cache = MemoryCache::new(2);
        cache.put("GET:http://x".into(), value("a")).await;
        let got = cache.get("GET:http://x").await.unwrap();
        assert_eq!(got.body, Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn capacity_eviction_drops_least_recently_used() {
        let cache = MemoryCache::new(2);
        cache.put("k1".into(), value("1")).await;
        cache.put("k2".into(), value("2")).await;
        cache.get("k1").await; // k1 now most recent
        cache.put("k3".into(), value("3")).await; // evicts k2
        assert!(cache.get("k2").await.is_none());
        assert!(cache.get("k1").await.is_some());
        assert!(cache.get("k3").await.is_some());
    }

    #[tokio::test]
    async fn invalidate_removes_single_key() {
        let cache = MemoryCache::new(4);
        cache.put("k1".into(), value("1")).await;
        assert!(cache.invalidate("k1").await);
        assert!(cache.get("k1").await.is_none());
        assert!(!cache.invalidate("k1").await);
    }

    #[tokio::test]
    async fn resize_down_evicts_to_fit() {
        let cache = MemoryCache::new(4);
        cache.put("k1".into(), value("1")).await;
        cache.put("k2".into(), value("2")).await;
        cache.put("k3".into(), value("3")).await;
        cache.resize(1).await;
        assert_eq!(cache.len().await, 1);
        assert!(cache.get("k3").await.is_some());
    }
}
