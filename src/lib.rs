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

//! An outbound HTTP client façade: concurrency-gated, two-tier-cached,
//! single-flighted, and streaming-aware. `fetch`/`fetch_stream` are the
//! entry points; everything else is a collaborator reachable from
//! `FetchManager` for embedders that want more control than the
//! process-wide singleton gives them.

mod admin;
mod cache_value;
mod config;
mod error;
mod inflight;
mod manager;
mod memory;
mod normalize;
mod orchestrator;
mod response;
mod semaphore;
mod storage;
mod strategy;
mod tee;
mod telemetry;
mod transport;

pub use admin::{AdminStatus, InvalidateScope};
pub use cache_value::{cache_key, CacheKey, CachedValue};
pub use config::{
    Config, ConfigCell, ConfigOverrides, FlagSnapshot, FlagStore, StaticFlagStore, Timeouts,
    TimeoutsFlag, YamlFileFlagStore,
};
pub use error::{FetchError, TimeoutStage};
pub use inflight::{Follower, InflightCoalescer, InflightLeader, Lookup};
pub use manager::{configure, get_manager, reset, FetchManager, ManagerOptions};
pub use memory::MemoryCache;
pub use normalize::{Body, CancellationHandle, NormalizedRequest, RequestInfo, RequestInit, TimeoutInit};
pub use orchestrator::SharedOutcome;
pub use response::{BodyUnusable, Response, ResponseError};
pub use semaphore::{ConcurrencyGate, OwnedRelease, Permit};
pub use storage::{
    AzureObjectStore, DistributedCache, GcsObjectStore, LocalObjectStore, MemoryObjectStore,
    ObjectStore, S3ObjectStore, StreamEntry,
};
pub use telemetry::{RecordedSpan, RecordingTelemetry, Span, Telemetry, TracingTelemetry};
pub use transport::{
    ByteStream, HyperTransport, MockTransport, ScriptedResponse, Transport, UpstreamResponse,
};

/// Fetch-API-shaped entry point (§4.9). Uses the process-wide manager,
/// lazily built from defaults via [`get_manager`] if [`configure`] was
/// never called.
pub async fn fetch(info: impl Into<RequestInfo>, init: RequestInit) -> Result<Response, FetchError> {
    let manager = get_manager().await;
    orchestrator::fetch(&manager, info.into(), init).await
}

/// Like [`fetch`], but hands back the raw upstream byte stream instead of
/// a buffered-or-streaming [`Response`].
pub async fn fetch_stream(
    info: impl Into<RequestInfo>,
    init: RequestInit,
) -> Result<ByteStream, FetchError> {
    let manager = get_manager().await;
    orchestrator::fetch_stream(&manager, info.into(), init).await
}

/// Runs `fetch`/`fetch_stream` against an explicit manager instead of the
/// process-wide singleton, for embedders holding several instances side by
/// side.
pub mod with_manager {
    use std::sync::Arc;

    use crate::error::FetchError;
    use crate::manager::FetchManager;
    use crate::normalize::{RequestInfo, RequestInit};
    use crate::orchestrator;
    use crate::response::Response;
    use crate::transport::ByteStream;

    pub async fn fetch(
        manager: &Arc<FetchManager>,
        info: impl Into<RequestInfo>,
        init: RequestInit,
    ) -> Result<Response, FetchError> {
        orchestrator::fetch(manager, info.into(), init).await
    }

    pub async fn fetch_stream(
        manager: &Arc<FetchManager>,
        info: impl Into<RequestInfo>,
        init: RequestInit,
    ) -> Result<ByteStream, FetchError> {
        orchestrator::fetch_stream(manager, info.into(), init).await
    }
}
