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

// Inflight Coalescer (C6): maps a CacheKey to a pending result so
// concurrent callers for the same key share one upstream call (§4.6).
//
// The orchestrator inserts the entry before opening the upstream call and
// removes it on completion or failure — at most one of {L1 pending future,
// inflight entry, upstream stream} is ever active for a given key (§4.9
// cross-request coalescing invariant).

use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::error::FetchError;

struct Slot<T> {
    notify: Notify,
    result: Mutex<Option<Result<T, FetchError>>>,
}

/// Single-flight map keyed by the logical `"<METHOD>:<URL>"` cache key.
/// Generic over `T` so the orchestrator can coalesce on whatever shareable
/// value it eventually adapts into per-caller `Response`s.
pub struct InflightCoalescer<T: Clone + Send + Sync + 'static> {
    entries: Arc<DashMap<String, Arc<Slot<T>>>>,
}

/// What [`InflightCoalescer::enter`] hands back: either the caller becomes
/// the leader (responsible for doing the upstream work and resolving the
/// slot) or a follower waiting on the leader's result.
pub enum Lookup<T: Clone + Send + Sync + 'static> {
    Leader(InflightLeader<T>),
    Follower(Follower<T>),
}

/// Holds the obligation to resolve the shared slot. Dropping a `Leader`
/// without calling [`InflightLeader::resolve`] resolves it with
/// `FetchError::Aborted` so followers never hang (§4.6: "removed on
/// resolution or rejection").
pub struct InflightLeader<T: Clone + Send + Sync + 'static> {
    key: String,
    slot: Arc<Slot<T>>,
    entries: Arc<DashMap<String, Arc<Slot<T>>>>,
    settled: bool,
}

pub struct Follower<T: Clone + Send + Sync + 'static> {
    slot: Arc<Slot<T>>,
}

impl<T: Clone + Send + Sync + 'static> InflightCoalescer<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Looks up `key`. An existing entry yields a [`Follower`]; a missing
    /// one is inserted and yields the [`Leader`] (§4.6).
    ///
    /// Non-GET methods should not call this unless `dedupWrites` is set
    /// (§6) — that gating is the orchestrator's responsibility, not this
    /// map's.
    pub fn enter(&self, key: &str) -> Lookup<T> {
        match self.entries.entry(key.to_string()) {
            DashEntry::Occupied(occ) => Lookup::Follower(Follower {
                slot: Arc::clone(occ.get()),
            }),
            DashEntry::Vacant(vac) => {
                let slot = Arc::new(Slot {
                    notify: Notify::new(),
                    result: Mutex::new(None),
                });
                vac.insert(Arc::clone(&slot));
                Lookup::Leader(InflightLeader {
                    key: key.to_string(),
                    slot,
                    entries: Arc::clone(&self.entries),
                    settled: false,
                })
            }
        }
    }

    /// Number of requests currently in flight (for admin introspection, A6).
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for InflightCoalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Follower<T> {
    /// Waits for the leader to resolve the shared slot. Uses
    /// [`tokio::sync::Notify`]'s `enable()` registration so a resolution
    /// that races the follower's check is never missed.
    pub async fn join(self) -> Result<T, FetchError> {
        loop {
            let notified = self.slot.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.slot.result.lock().unwrap().clone() {
                return result;
            }
            notified.await;
        }
    }
}

impl<T: Clone + Send + Sync + 'static> InflightLeader<T> {
    /// Resolves the slot, wakes all followers, and removes the entry from
    /// the map so the next caller for this key starts fresh.
    pub fn resolve(mut self, result: Result<T, FetchError>) {
        self.settle(result);
    }

    fn settle(&mut self, result: Result<T, FetchError>) {
        if self.settled {
            return;
        }
        self.settled = true;
        *self.slot.result.lock().unwrap() = Some(result);
        self.entries.remove(&self.key);
        self.slot.notify.notify_waiters();
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for InflightLeader<T> {
    fn drop(&mut self) {
        if !self.settled {
            self.settle(Err(FetchError::Aborted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fresh() -> Arc<InflightCoalescer<&'static str>> {
        Arc::new(InflightCoalescer::new())
    }

    #[tokio::test]
    async fn first_caller_becomes_leader_second_becomes_follower() {
        let table = fresh();
        match table.enter("GET:http://x") {
            Lookup::Leader(_) => {}
            Lookup::Follower(_) => panic!("expected leader"),
        }
        match table.enter("GET:http://x") {
            Lookup::Follower(_) => {}
            Lookup::Leader(_) => panic!("expected follower"),
        }
    }

    #[tokio::test]
    async fn follower_receives_leader_result() {
        let table = fresh();
        let leader = match table.enter("GET:http://x") {
            Lookup::Leader(l) => l,
            _ => unreachable!(),
        };
        let follower = match table.enter("GET:http://x") {
            Lookup::Follower(f) => f,
            _ => unreachable!(),
        };
        let join_handle = tokio::spawn(async move { follower.join().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.resolve(Ok("payload"));
        let result = join_handle.await.unwrap().unwrap();
        assert_eq!(result, "payload");
    }

    #[tokio::test]
    async fn entry_is_removed_after_resolution() {
        let table = fresh();
        let leader = match table.enter("GET:http://x") {
            Lookup::Leader(l) => l,
            _ => unreachable!(),
        };
        assert_eq!(table.len(), 1);
        leader.resolve(Ok("payload"));
        assert_eq!(table.len(), 0);
        match table.enter("GET:http://x") {
            Lookup::Leader(_) => {}
            Lookup::Follower(_) => panic!("expected a fresh leader after resolution"),
        }
    }

    #[tokio::test]
    async fn dropped_leader_resolves_followers_with_aborted() {
        let table = fresh();
        let leader = match table.enter("GET:http://x") {
            Lookup::Leader(l) => l,
            _ => unreachable!(),
        };
        let follower = match table.enter("GET:http://x") {
            Lookup::Follower(f) => f,
            _ => unreachable!(),
        };
        let join_handle = tokio::spawn(async move { follower.join().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(leader);
        let result = join_handle.await.unwrap();
        assert!(matches!(result, Err(FetchError::Aborted)));
    }

    #[tokio::test]
    async fn three_followers_share_one_result() {
        let table = fresh();
        let leader = match table.enter("GET:http://x") {
            Lookup::Leader(l) => l,
            _ => unreachable!(),
        };
        let mut handles = Vec::new();
        for _ in 0..3 {
            let follower = match table.enter("GET:http://x") {
                Lookup::Follower(f) => f,
                _ => unreachable!(),
            };
            handles.push(tokio::spawn(async move { follower.join().await }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.resolve(Ok("shared"));
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "shared");
        }
    }
}
