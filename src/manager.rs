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

// Manager Lifecycle (A5): bundles C1/C3/C4/C5/C6 plus the Transport and
// Telemetry collaborators behind a process-wide handle, replacing the
// teacher's module-level globals with an explicit `configure`/`get_manager`
// pair that tests can `reset()` between cases.

use std::sync::{Arc, OnceLock};

use tokio::sync::Mutex as AsyncMutex;

use crate::config::{ConfigCell, ConfigOverrides, FlagStore};
use crate::memory::MemoryCache;
use crate::orchestrator::SharedOutcome;
use crate::semaphore::ConcurrencyGate;
use crate::storage::DistributedCache;
use crate::telemetry::{Telemetry, TracingTelemetry};
use crate::transport::{HyperTransport, Transport};
use crate::inflight::InflightCoalescer;

/// Everything the orchestrator needs for one call, owned for the lifetime
/// of the process (or until [`reset`]). Distinct from `Config`: this struct
/// holds the long-lived collaborators, `Config` is the short-lived
/// snapshot `ConfigCell` hands back on each call.
pub struct FetchManager {
    pub config: Arc<ConfigCell>,
    pub gate: Arc<ConcurrencyGate>,
    pub memory: Arc<MemoryCache>,
    pub distributed: Option<Arc<DistributedCache>>,
    pub inflight: Arc<InflightCoalescer<SharedOutcome>>,
    pub transport: Arc<dyn Transport>,
    pub telemetry: Arc<dyn Telemetry>,
    pub default_headers: Vec<(String, String)>,
}

/// Builder inputs for [`configure`]. Only `flag_store` is required; every
/// other field falls back to the teacher's defaults (`HyperTransport`,
/// `TracingTelemetry`, no L2).
pub struct ManagerOptions {
    pub flag_store: Arc<dyn FlagStore>,
    pub overrides: ConfigOverrides,
    pub distributed: Option<Arc<DistributedCache>>,
    pub transport: Option<Arc<dyn Transport>>,
    pub telemetry: Option<Arc<dyn Telemetry>>,
    pub default_headers: Vec<(String, String)>,
    /// Initial L1 capacity, used before the first config load resolves a
    /// `concurrency`-scaled value. The memory cache is resized again once
    /// `ensure_loaded` returns.
    pub memory_capacity: usize,
}

impl ManagerOptions {
    pub fn new(flag_store: Arc<dyn FlagStore>) -> Self {
        Self {
            flag_store,
            overrides: ConfigOverrides::default(),
            distributed: None,
            transport: None,
            telemetry: None,
            default_headers: Vec::new(),
            memory_capacity: 1024,
        }
    }
}

static MANAGER: OnceLock<AsyncMutex<Option<Arc<FetchManager>>>> = OnceLock::new();

fn slot() -> &'static AsyncMutex<Option<Arc<FetchManager>>> {
    MANAGER.get_or_init(|| AsyncMutex::new(None))
}

/// Builds a [`FetchManager`], loads its first config snapshot, and installs
/// it as the process-wide instance. Replaces whatever was previously
/// configured — existing `Arc<FetchManager>` handles already handed out
/// keep working against the old collaborators until dropped.
pub async fn configure(options: ManagerOptions) -> Arc<FetchManager> {
    let config = ConfigCell::new(options.flag_store, options.overrides);
    let loaded = config.ensure_loaded().await;

    let manager = Arc::new(FetchManager {
        gate: Arc::new(ConcurrencyGate::new(loaded.concurrency)),
        memory: Arc::new(MemoryCache::new(options.memory_capacity)),
        distributed: options.distributed,
        inflight: Arc::new(InflightCoalescer::new()),
        transport: options.transport.unwrap_or_else(|| Arc::new(HyperTransport::new())),
        telemetry: options.telemetry.unwrap_or_else(|| Arc::new(TracingTelemetry)),
        default_headers: options.default_headers,
        config,
    });

    *slot().lock().await = Some(Arc::clone(&manager));
    manager
}

/// The current manager, lazily configuring one from static defaults on
/// first use if `configure` was never called explicitly. Holding the slot
/// lock across the lazy-init `await` serializes concurrent first calls
/// onto a single build instead of racing two managers into existence.
pub async fn get_manager() -> Arc<FetchManager> {
    let mut guard = slot().lock().await;
    if let Some(manager) = guard.clone() {
        return manager;
    }
    let options = ManagerOptions::new(Arc::new(crate::config::StaticFlagStore::default()));
    let config = ConfigCell::new(options.flag_store, options.overrides);
    let loaded = config.ensure_loaded().await;
    let manager = Arc::new(FetchManager {
        gate: Arc::new(ConcurrencyGate::new(loaded.concurrency)),
        memory: Arc::new(MemoryCache::new(options.memory_capacity)),
        distributed: options.distributed,
        inflight: Arc::new(InflightCoalescer::new()),
        transport: options.transport.unwrap_or_else(|| Arc::new(HyperTransport::new())),
        telemetry: options.telemetry.unwrap_or_else(|| Arc::new(TracingTelemetry)),
        default_headers: options.default_headers,
        config,
    });
    *guard = Some(Arc::clone(&manager));
    manager
}

/// Tears down the process-wide manager so the next [`get_manager`] call
/// rebuilds one from scratch. Reserved for tests; an embedder normally
/// configures once at startup.
pub async fn reset() {
    *slot().lock().await = None;
}
