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

// In-process object store, useful as the crate's zero-config default and in
// tests that exercise `DistributedCache` without a real backend.

use dashmap::DashMap;
use futures::future::BoxFuture;

use super::ObjectStore;

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move { self.objects.get(path).map(|v| v.clone()) })
    }

    fn put<'a>(&'a self, path: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.objects.insert(path.to_string(), bytes);
        })
    }

    fn delete_prefix<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let matching: Vec<String> = self
                .objects
                .iter()
                .map(|entry| entry.key().clone())
                .filter(|k| k.starts_with(prefix))
                .collect();
            for key in &matching {
                self.objects.remove(key);
            }
            matching.len()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = MemoryObjectStore::new();
        store.put("a/b.gz", vec![1, 2, 3]).await;
        assert_eq!(store.get("a/b.gz").await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let store = MemoryObjectStore::new();
        assert_eq!(store.get("nope").await, None);
    }

    #[tokio::test]
    async fn delete_prefix_removes_only_matching_keys() {
        let store = MemoryObjectStore::new();
        store.put("cache/app/a.gz", vec![1]).await;
        store.put("cache/app/b.gz", vec![2]).await;
        store.put("cache/other/c.gz", vec![3]).await;
        let removed = store.delete_prefix("cache/app/").await;
        assert_eq!(removed, 2);
        assert!(store.get("cache/other/c.gz").await.is_some());
    }
}
