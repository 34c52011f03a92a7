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

// Admin Introspection (A6): the teacher exposes cache status and
// invalidation as HTTP routes (`admin/status_memory.rs`, `admin/clean.rs`);
// this crate has no inbound server, so the same operations are plain async
// methods on `FetchManager` instead.

use crate::cache_value::CacheKey;
use crate::manager::FetchManager;

/// Snapshot of L1, L2, and gate occupancy at the moment of the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminStatus {
    pub l1_entries: usize,
    pub inflight_requests: usize,
    pub permits_available: usize,
    pub permits_total: usize,
    pub distributed_configured: bool,
}

/// What [`FetchManager::admin_invalidate`] clears.
pub enum InvalidateScope {
    /// A single key, evicted from L1 and, if configured, L2.
    Key(CacheKey),
    /// Every L1 entry. L2 is untouched — there is no namespace-wide L2
    /// clear exposed here, matching the teacher's memory-only `/admin/api/cache`.
    AllMemory,
}

impl FetchManager {
    pub async fn admin_status(&self) -> AdminStatus {
        AdminStatus {
            l1_entries: self.memory.len().await,
            inflight_requests: self.inflight.len(),
            permits_available: self.gate.available_permits(),
            permits_total: self.gate.total_permits(),
            distributed_configured: self.distributed.is_some(),
        }
    }

    pub async fn admin_invalidate(&self, scope: InvalidateScope) {
        match scope {
            InvalidateScope::Key(key) => {
                self.memory.invalidate(&key).await;
                if let Some(distributed) = &self.distributed {
                    distributed.invalidate(&key).await;
                }
            }
            InvalidateScope::AllMemory => {
                self.memory.clear().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::{ConfigOverrides, StaticFlagStore};
    use crate::manager::{configure, ManagerOptions};

    use super::*;

    #[tokio::test]
    async fn status_reflects_l1_and_gate_occupancy() {
        let store: Arc<dyn crate::config::FlagStore> = Arc::new(StaticFlagStore::default());
        let mut options = ManagerOptions::new(store);
        options.overrides = ConfigOverrides {
            concurrency: Some(4),
            ..Default::default()
        };
        let manager = configure(options).await;

        let status = manager.admin_status().await;
        assert_eq!(status.l1_entries, 0);
        assert_eq!(status.permits_available, 4);
        assert_eq!(status.permits_total, 4);
        assert!(!status.distributed_configured);
    }

    #[tokio::test]
    async fn invalidate_key_removes_only_that_entry() {
        let store: Arc<dyn crate::config::FlagStore> = Arc::new(StaticFlagStore::default());
        let manager = configure(ManagerOptions::new(store)).await;

        manager
            .memory
            .put(
                "GET:http://x/a".into(),
                crate::cache_value::CachedValue::new(bytes::Bytes::from_static(b"a"), vec![], 200),
            )
            .await;
        manager
            .memory
            .put(
                "GET:http://x/b".into(),
                crate::cache_value::CachedValue::new(bytes::Bytes::from_static(b"b"), vec![], 200),
            )
            .await;

        manager
            .admin_invalidate(InvalidateScope::Key("GET:http://x/a".into()))
            .await;

        assert!(manager.memory.get("GET:http://x/a").await.is_none());
        assert!(manager.memory.get("GET:http://x/b").await.is_some());
    }

    #[tokio::test]
    async fn invalidate_all_memory_clears_l1() {
        let store: Arc<dyn crate::config::FlagStore> = Arc::new(StaticFlagStore::default());
        let manager = configure(ManagerOptions::new(store)).await;
        manager
            .memory
            .put(
                "GET:http://x/a".into(),
                crate::cache_value::CachedValue::new(bytes::Bytes::from_static(b"a"), vec![], 200),
            )
            .await;

        manager.admin_invalidate(InvalidateScope::AllMemory).await;

        assert_eq!(manager.admin_status().await.l1_entries, 0);
    }
}
