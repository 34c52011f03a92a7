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

// Distributed Cache — L2 (C5): buffered and stream-replay encodings over a
// pluggable object store (§4.5). The object store itself is the external
// collaborator the design calls out as a non-goal ("a key-value store with
// list and expiry semantics"); `ObjectStore` is the seam, and the concrete
// backends here (local disk, S3, GCS, Azure Blob, in-memory) are the
// teacher's own storage backends generalized to sit behind it.

pub mod azure;
pub mod envelope;
pub mod gcs;
pub mod local;
pub mod memory;
pub mod s3;

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::cache_value::CachedValue;
use crate::config::Config;

pub use azure::AzureObjectStore;
pub use gcs::GcsObjectStore;
pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// Raw byte storage the way the teacher's individual `storage/*.rs` modules
/// each implemented against their own backend: `put`/`get`/`delete_prefix`
/// against opaque paths. Dyn-safe via `BoxFuture`, matching the
/// `Transport`/`FlagStore` seams.
pub trait ObjectStore: Send + Sync {
    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Option<Vec<u8>>>;
    fn put<'a>(&'a self, path: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, ()>;
    /// Deletes every object under `prefix`, returning the count removed.
    fn delete_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, usize>;
}

/// A response body replayed from the stream encoding: ordered chunks plus
/// the headers/status captured alongside them at write time.
pub struct StreamEntry {
    pub chunks: Vec<Bytes>,
    pub headers: Vec<(String, String)>,
    pub status_code: u16,
}

/// The buffered-or-stream L2 cache (§4.5), layered over any [`ObjectStore`].
/// `namespace` partitions keys the way the teacher partitions by `app_id`.
pub struct DistributedCache {
    store: Arc<dyn ObjectStore>,
    namespace: String,
}

fn buffered_path(namespace: &str, key: &str) -> String {
    format!("cache/{namespace}/{}.gz", envelope::hash_key(key))
}

fn stream_path(namespace: &str, key: &str) -> String {
    format!("cache/{namespace}/{}.stream.gz", envelope::hash_key(key))
}

impl DistributedCache {
    pub fn new(store: Arc<dyn ObjectStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// Reads the buffered encoding, decoding and checking TTL. A corrupt or
    /// expired entry is treated as a miss, never an error (§4.5: swallow and
    /// log).
    pub async fn get_buffered(&self, key: &str) -> Option<CachedValue> {
        let bytes = self.store.get(&buffered_path(&self.namespace, key)).await?;
        match envelope::decode_buffered(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(cache.key = %key, error = %e, "discarding unreadable L2 buffered entry");
                None
            }
        }
    }

    pub async fn put_buffered(&self, key: &str, value: &CachedValue, ttl_seconds: u64) {
        match envelope::encode_buffered(value, ttl_seconds) {
            Ok(bytes) => self.store.put(&buffered_path(&self.namespace, key), bytes).await,
            Err(e) => tracing::warn!(cache.key = %key, error = %e, "failed to encode L2 buffered entry"),
        }
    }

    /// Lookup order on a buffered miss (§4.5): check the stream-replay
    /// encoding; any parse failure is a miss, never surfaced as an error.
    pub async fn get_stream(&self, key: &str) -> Option<StreamEntry> {
        let bytes = self.store.get(&stream_path(&self.namespace, key)).await?;
        match envelope::decode_stream(&bytes) {
            Ok(decoded) if !decoded.chunks.is_empty() => Some(StreamEntry {
                chunks: decoded.chunks,
                headers: decoded.headers,
                status_code: decoded.status_code,
            }),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(cache.key = %key, error = %e, "discarding unreadable L2 stream entry");
                None
            }
        }
    }

    /// Writes the stream-replay encoding, enforcing the write caps of §4.5:
    /// stop accepting chunks once `max_stream_chunks` or
    /// `max_stream_total_bytes` is exceeded. I/O failures are logged, never
    /// propagated — teeing must never block the caller's own consumption.
    pub async fn put_stream(
        &self,
        key: &str,
        chunks: &[Bytes],
        headers: &[(String, String)],
        status_code: u16,
        config: &Config,
    ) {
        let mut total_bytes = 0usize;
        let mut capped = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if capped.len() >= config.max_stream_chunks || total_bytes > config.max_stream_total_bytes {
                break;
            }
            total_bytes += chunk.len();
            capped.push(chunk.clone());
        }
        match envelope::encode_stream(&capped, headers, status_code, config.cache_ttl_seconds) {
            Ok(bytes) => self.store.put(&stream_path(&self.namespace, key), bytes).await,
            Err(e) => tracing::warn!(cache.key = %key, error = %e, "failed to encode L2 stream entry"),
        }
    }

    pub async fn invalidate(&self, key: &str) {
        let buffered = buffered_path(&self.namespace, key);
        let stream = stream_path(&self.namespace, key);
        self.store.delete_prefix(&buffered).await;
        self.store.delete_prefix(&stream).await;
    }

    pub async fn clear(&self) -> usize {
        self.store
            .delete_prefix(&format!("cache/{}/", self.namespace))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_value::CachedValue;

    fn cache() -> DistributedCache {
        DistributedCache::new(Arc::new(MemoryObjectStore::new()), "test-app")
    }

    #[tokio::test]
    async fn buffered_round_trips_through_the_cache() {
        let cache = cache();
        let value = CachedValue::new(Bytes::from_static(b"hi"), vec![], 200);
        cache.put_buffered("GET:http://x", &value, 300).await;
        assert_eq!(cache.get_buffered("GET:http://x").await, Some(value));
    }

    #[tokio::test]
    async fn stream_falls_back_to_none_on_true_miss() {
        let cache = cache();
        assert!(cache.get_stream("GET:http://missing").await.is_none());
    }

    #[tokio::test]
    async fn stream_write_caps_chunk_count() {
        let cache = cache();
        let mut config = Config::defaults();
        config.max_stream_chunks = 2;
        let chunks = vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ];
        cache.put_stream("GET:http://y", &chunks, &[], 200, &config).await;
        let entry = cache.get_stream("GET:http://y").await.unwrap();
        assert_eq!(entry.chunks.len(), 2);
    }

    #[tokio::test]
    async fn invalidate_removes_both_encodings() {
        let cache = cache();
        let value = CachedValue::new(Bytes::from_static(b"hi"), vec![], 200);
        cache.put_buffered("GET:http://z", &value, 300).await;
        cache.invalidate("GET:http://z").await;
        assert!(cache.get_buffered("GET:http://z").await.is_none());
    }
}
