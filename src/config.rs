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

// Config Snapshot (C1): current tunables derived from a polled feature-flag
// source, with stale-while-revalidate access (§4.1, §9).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Deserialize;

use crate::error::FetchError;

/// Per-stage timeout record (§3). Any field may be absent, meaning "do not
/// enforce at that stage".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Option<u64>,
    pub socket: Option<u64>,
    pub request: Option<u64>,
}

/// Fully-materialized, immutable tunable set (§3, §6). Replaced atomically on
/// refresh; never partially updated.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub concurrency: usize,
    pub cache_ttl_seconds: u64,
    pub enhanced_enabled: bool,
    pub stream_enabled: bool,
    pub stream_detect_buffer: usize,
    pub stream_buffer_max: usize,
    pub max_response_bytes: usize,
    pub max_stream_chunks: usize,
    pub max_stream_total_bytes: usize,
    pub timeouts: Timeouts,
    pub dedup_writes: bool,
}

impl Config {
    /// Built-in defaults (§6 feature-flag table), used whenever a flag is
    /// missing and before any load has succeeded.
    pub fn defaults() -> Self {
        Config {
            concurrency: 8,
            cache_ttl_seconds: 300,
            enhanced_enabled: false,
            stream_enabled: true,
            stream_detect_buffer: 4096,
            stream_buffer_max: 65536,
            max_response_bytes: 10 * 1024 * 1024,
            max_stream_chunks: 100,
            max_stream_total_bytes: 10 * 1024 * 1024,
            timeouts: Timeouts::default(),
            dedup_writes: true,
        }
    }

    fn merged_with_flags(mut self, flags: &FlagSnapshot) -> Self {
        if let Some(v) = flags.concurrency {
            self.concurrency = v;
        }
        if let Some(v) = flags.cache_ttl_seconds {
            self.cache_ttl_seconds = v;
        }
        if let Some(v) = flags.enhanced_enabled {
            self.enhanced_enabled = v;
        }
        if let Some(v) = flags.stream_enabled {
            self.stream_enabled = v;
        }
        if let Some(v) = flags.stream_detect_buffer {
            self.stream_detect_buffer = v;
        }
        if let Some(v) = flags.stream_buffer_max {
            self.stream_buffer_max = v;
        }
        if let Some(v) = flags.max_response_bytes {
            self.max_response_bytes = v;
        }
        if let Some(v) = flags.max_stream_chunks {
            self.max_stream_chunks = v;
        }
        if let Some(v) = flags.max_stream_total_bytes {
            self.max_stream_total_bytes = v;
        }
        if let Some(t) = &flags.timeouts {
            if let Some(v) = t.connect {
                self.timeouts.connect = Some(v);
            }
            if let Some(v) = t.socket {
                self.timeouts.socket = Some(v);
            }
            if let Some(v) = t.request {
                self.timeouts.request = Some(v);
            }
        }
        if let Some(v) = flags.dedup_writes {
            self.dedup_writes = v;
        }
        self
    }

    fn merged_with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(v) = overrides.concurrency {
            self.concurrency = v;
        }
        if let Some(v) = overrides.cache_ttl_seconds {
            self.cache_ttl_seconds = v;
        }
        if let Some(v) = overrides.enhanced_enabled {
            self.enhanced_enabled = v;
        }
        if let Some(v) = overrides.stream_enabled {
            self.stream_enabled = v;
        }
        if let Some(v) = overrides.stream_detect_buffer {
            self.stream_detect_buffer = v;
        }
        if let Some(v) = overrides.stream_buffer_max {
            self.stream_buffer_max = v;
        }
        if let Some(v) = overrides.max_response_bytes {
            self.max_response_bytes = v;
        }
        if let Some(v) = overrides.max_stream_chunks {
            self.max_stream_chunks = v;
        }
        if let Some(v) = overrides.max_stream_total_bytes {
            self.max_stream_total_bytes = v;
        }
        if let Some(v) = overrides.dedup_writes {
            self.dedup_writes = v;
        }
        self
    }
}

/// Raw shape of whatever the flag store returns, mirroring the feature-flag
/// table of §6 field-for-field. Every field is optional: a missing flag
/// falls back to [`Config::defaults`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FlagSnapshot {
    pub concurrency: Option<usize>,
    pub cache_ttl_seconds: Option<u64>,
    pub enhanced_enabled: Option<bool>,
    pub stream_enabled: Option<bool>,
    pub stream_detect_buffer: Option<usize>,
    pub stream_buffer_max: Option<usize>,
    pub max_response_bytes: Option<usize>,
    pub max_stream_chunks: Option<usize>,
    pub max_stream_total_bytes: Option<usize>,
    pub timeouts: Option<TimeoutsFlag>,
    pub dedup_writes: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutsFlag {
    pub connect: Option<u64>,
    pub socket: Option<u64>,
    pub request: Option<u64>,
}

/// Caller-supplied overrides passed to [`crate::configure`], applied on top
/// of whatever the flag store produces. Reserved for tests and embedders
/// that want to pin a tunable regardless of what the flag source says.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub concurrency: Option<usize>,
    pub cache_ttl_seconds: Option<u64>,
    pub enhanced_enabled: Option<bool>,
    pub stream_enabled: Option<bool>,
    pub stream_detect_buffer: Option<usize>,
    pub stream_buffer_max: Option<usize>,
    pub max_response_bytes: Option<usize>,
    pub max_stream_chunks: Option<usize>,
    pub max_stream_total_bytes: Option<usize>,
    pub dedup_writes: Option<bool>,
}

/// The feature-flag source collaborator (non-goal: "a key-value
/// configuration service polled lazily" — only the polling contract is
/// modeled here, not a real KV transport).
pub trait FlagStore: Send + Sync {
    fn get_all(&self) -> BoxFuture<'_, Result<FlagSnapshot, FetchError>>;
}

/// Reads a YAML file on every poll, in the teacher's `serde_yaml` idiom.
/// Used by the CLI demo binary; re-reading the file on each refresh is what
/// lets an operator edit the file and see it take effect without a restart.
pub struct YamlFileFlagStore {
    path: std::path::PathBuf,
}

impl YamlFileFlagStore {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FlagStore for YamlFileFlagStore {
    fn get_all(&self) -> BoxFuture<'_, Result<FlagSnapshot, FetchError>> {
        Box::pin(async move {
            let contents = tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|e| FetchError::Config(format!("reading {:?}: {e}", self.path)))?;
            serde_yaml::from_str(&contents)
                .map_err(|e| FetchError::Config(format!("parsing {:?}: {e}", self.path)))
        })
    }
}

/// An in-memory flag source settable by tests via [`StaticFlagStore::set`].
#[derive(Clone, Default)]
pub struct StaticFlagStore {
    snapshot: Arc<RwLock<FlagSnapshot>>,
}

impl StaticFlagStore {
    pub fn new(snapshot: FlagSnapshot) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub fn set(&self, snapshot: FlagSnapshot) {
        *self.snapshot.write().unwrap() = snapshot;
    }
}

impl FlagStore for StaticFlagStore {
    fn get_all(&self) -> BoxFuture<'_, Result<FlagSnapshot, FetchError>> {
        let snapshot = self.snapshot.read().unwrap().clone();
        Box::pin(async move { Ok(snapshot) })
    }
}

/// How long a loaded snapshot is trusted before [`ConfigCell::current`]'s
/// staleness check schedules a background refresh.
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// C1: stale-while-revalidate holder for the current [`Config`].
///
/// Split per the design notes into a synchronous snapshot read
/// ([`ConfigCell::current`]) and an at-most-one-in-flight refresh future —
/// readers never block on network/disk I/O.
pub struct ConfigCell {
    store: Arc<dyn FlagStore>,
    overrides: ConfigOverrides,
    snapshot: RwLock<Arc<Config>>,
    last_refresh: Mutex<Option<Instant>>,
    attempted: AtomicBool,
    stale_after: Duration,
    refreshing: Arc<tokio::sync::Mutex<()>>,
}

impl ConfigCell {
    pub fn new(store: Arc<dyn FlagStore>, overrides: ConfigOverrides) -> Arc<Self> {
        Arc::new(Self {
            store,
            overrides,
            snapshot: RwLock::new(Arc::new(Config::defaults())),
            last_refresh: Mutex::new(None),
            attempted: AtomicBool::new(false),
            stale_after: DEFAULT_STALE_AFTER,
            refreshing: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Non-blocking: the last-known snapshot, or built-in defaults if
    /// nothing has ever loaded.
    pub fn current(&self) -> Arc<Config> {
        self.snapshot.read().unwrap().clone()
    }

    fn is_stale(&self) -> bool {
        match *self.last_refresh.lock().unwrap() {
            None => true,
            Some(t) => t.elapsed() >= self.stale_after,
        }
    }

    /// `current()`, plus scheduling an idempotent background refresh if the
    /// snapshot is stale.
    pub fn current_with_refresh(self: &Arc<Self>) -> Arc<Config> {
        if self.is_stale() {
            self.spawn_background_refresh();
        }
        self.current()
    }

    fn spawn_background_refresh(self: &Arc<Self>) {
        let Ok(guard) = Arc::clone(&self.refreshing).try_lock_owned() else {
            return; // a refresh is already in flight
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = this.do_refresh().await {
                tracing::warn!("background config refresh failed, keeping prior snapshot: {e}");
            }
        });
    }

    /// Blocks on first call until a refresh completes; afterward behaves
    /// like [`Self::current_with_refresh`].
    pub async fn ensure_loaded(self: &Arc<Self>) -> Arc<Config> {
        if !self.attempted.load(Ordering::Acquire) {
            let _guard = self.refreshing.lock().await;
            if !self.attempted.load(Ordering::Acquire) {
                if let Err(e) = self.do_refresh().await {
                    tracing::warn!("initial config load failed, using defaults: {e}");
                }
                self.attempted.store(true, Ordering::Release);
            }
        }
        self.current_with_refresh()
    }

    /// Synchronously reloads all flags; concurrent callers collapse onto the
    /// same in-flight reload.
    pub async fn force_refresh(self: &Arc<Self>) -> Arc<Config> {
        let _guard = self.refreshing.lock().await;
        if let Err(e) = self.do_refresh().await {
            tracing::warn!("forced config refresh failed, keeping prior snapshot: {e}");
        }
        self.attempted.store(true, Ordering::Release);
        self.current()
    }

    async fn do_refresh(&self) -> Result<(), FetchError> {
        let flags = self.store.get_all().await?;
        let merged = Config::defaults()
            .merged_with_flags(&flags)
            .merged_with_overrides(&self.overrides);
        *self.snapshot.write().unwrap() = Arc::new(merged);
        *self.last_refresh.lock().unwrap() = Some(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_used_before_any_load() {
        let store: Arc<dyn FlagStore> = Arc::new(StaticFlagStore::default());
        let cell = ConfigCell::new(store, ConfigOverrides::default());
        assert_eq!(cell.current().concurrency, 8);
    }

    #[tokio::test]
    async fn ensure_loaded_applies_flags() {
        let flags = FlagSnapshot {
            concurrency: Some(42),
            ..Default::default()
        };
        let store: Arc<dyn FlagStore> = Arc::new(StaticFlagStore::new(flags));
        let cell = ConfigCell::new(store, ConfigOverrides::default());
        let cfg = cell.ensure_loaded().await;
        assert_eq!(cfg.concurrency, 42);
        assert_eq!(cfg.cache_ttl_seconds, 300, "unset flags keep defaults");
    }

    #[tokio::test]
    async fn overrides_win_over_flags() {
        let flags = FlagSnapshot {
            concurrency: Some(42),
            ..Default::default()
        };
        let store: Arc<dyn FlagStore> = Arc::new(StaticFlagStore::new(flags));
        let overrides = ConfigOverrides {
            concurrency: Some(7),
            ..Default::default()
        };
        let cell = ConfigCell::new(store, overrides);
        let cfg = cell.ensure_loaded().await;
        assert_eq!(cfg.concurrency, 7);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_prior_snapshot() {
        struct FailingStore;
        impl FlagStore for FailingStore {
            fn get_all(&self) -> BoxFuture<'_, Result<FlagSnapshot, FetchError>> {
                Box::pin(async { Err(FetchError::Config("boom".into())) })
            }
        }
        let cell = ConfigCell::new(Arc::new(FailingStore), ConfigOverrides::default());
        let cfg = cell.ensure_loaded().await;
        assert_eq!(cfg.concurrency, 8, "falls back to defaults, not an error");
    }

    #[tokio::test]
    async fn force_refresh_dedupes_concurrent_callers() {
        let store: Arc<dyn FlagStore> = Arc::new(StaticFlagStore::default());
        let cell = ConfigCell::new(store, ConfigOverrides::default());
        let (a, b) = tokio::join!(cell.force_refresh(), cell.force_refresh());
        assert_eq!(a.concurrency, b.concurrency);
    }
}
