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

// Fetch Orchestrator (C9): composes C1-C8 into `fetch`/`fetch_stream`
// (§4.9). Plain mode (`!enhanced_enabled`) skips caching, coalescing, and
// the concurrency gate but still runs the streaming-detection dispatch;
// enhanced mode layers L1 -> L2 -> inflight -> gated upstream for GET, and
// a gated single-retry buffered call for every other method.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};

use crate::cache_value::{cache_key, CachedValue};
use crate::config::Config;
use crate::error::FetchError;
use crate::inflight::{InflightLeader, Lookup};
use crate::manager::FetchManager;
use crate::normalize::{normalize, RequestInfo, RequestInit};
use crate::response::{BodyUnusable, Response};
use crate::storage::DistributedCache;
use crate::strategy::{self, BufferOutcome};
use crate::tee::tee_bytestream;
use crate::transport::{ByteStream, Transport, UpstreamResponse};

/// What an inflight leader resolves followers with. The design's data
/// model names only a pending `CachedValue`; this generalizes to a
/// streamed outcome too, capped by the same `max_stream_*` limits as the
/// L2 stream tee, so a GET that ends up streaming still coalesces instead
/// of leaving followers to issue their own upstream calls.
#[derive(Clone)]
pub enum SharedOutcome {
    Buffered(CachedValue),
    Streamed {
        status_code: u16,
        headers: BTreeMap<String, String>,
        chunks: Arc<Vec<Bytes>>,
    },
}

impl SharedOutcome {
    fn into_response(self) -> Response {
        match self {
            SharedOutcome::Buffered(value) => {
                Response::buffered(value.status_code, value.headers, value.body)
            }
            SharedOutcome::Streamed {
                status_code,
                headers,
                chunks,
            } => {
                let body: ByteStream =
                    Box::pin(stream::iter((*chunks).clone().into_iter().map(Ok)));
                Response::streaming(status_code, headers, body)
            }
        }
    }
}

/// Fetch-API-compatible entry point (§4.9).
pub async fn fetch(
    manager: &FetchManager,
    info: RequestInfo,
    init: RequestInit,
) -> Result<Response, FetchError> {
    let config = manager.config.ensure_loaded().await;
    let timeouts = config.timeouts;
    let (url, request) = normalize(info, init, &manager.default_headers, timeouts);
    let key = cache_key(&request.method, &url);
    let method = request.method.clone();
    let signal = request.signal.clone();

    let mut span = manager.telemetry.start(&method, &url);
    span.record_bool("http.enhanced_fetch", config.enhanced_enabled);

    if !config.enhanced_enabled {
        let result = run_plain(manager, &method, &url, &request, &config, &mut *span).await;
        if let Err(e) = &result {
            span.record_error(e);
        }
        return result;
    }

    if method == "GET" {
        if let Some(value) = manager.memory.get(&key).await {
            span.record_bool("http.cache_hit", true);
            span.record_u64("http.status_code", value.status_code as u64);
            return Ok(Response::buffered(value.status_code, value.headers, value.body));
        }

        if let Some(distributed) = &manager.distributed {
            if let Some(value) = distributed.get_buffered(&key).await {
                manager.memory.put(key.clone(), value.clone()).await;
                span.record_bool("http.redis_hit", true);
                span.record_u64("http.status_code", value.status_code as u64);
                return Ok(Response::buffered(value.status_code, value.headers, value.body));
            }
            if let Some(entry) = distributed.get_stream(&key).await {
                span.record_bool("http.redis_stream_replay", true);
                span.record_u64("http.status_code", entry.status_code as u64);
                let body: ByteStream = Box::pin(stream::iter(entry.chunks.into_iter().map(Ok)));
                return Ok(Response::streaming(
                    entry.status_code,
                    entry.headers.into_iter().collect(),
                    body,
                ));
            }
        }

        return match manager.inflight.enter(&key) {
            Lookup::Follower(follower) => {
                span.record_bool("http.inflight_dedupe", true);
                match follower.join().await {
                    Ok(outcome) => {
                        let response = outcome.into_response();
                        span.record_u64("http.status_code", response.status_code as u64);
                        Ok(response)
                    }
                    Err(e) => {
                        span.record_error(&e);
                        Err(e)
                    }
                }
            }
            Lookup::Leader(leader) => {
                let result = run_leader(
                    manager,
                    &method,
                    &url,
                    &request,
                    &config,
                    key.clone(),
                    leader,
                    &mut *span,
                    signal.as_ref(),
                )
                .await;
                if let Err(e) = &result {
                    span.record_error(e);
                }
                result
            }
        };
    }

    // Enhanced, non-GET: bypass caches, still gated, one retry at most.
    let permit = manager.gate.acquire(signal.as_ref()).await?;
    let buffered = call_with_one_retry(manager.transport.as_ref(), &method, &url, &request, &config.timeouts).await;
    permit.release_now();
    match buffered {
        Ok((status_code, headers, body)) => {
            span.record_u64("http.status_code", status_code as u64);
            Ok(Response::buffered(status_code, headers, body))
        }
        Err(e) => {
            span.record_error(&e);
            Err(e)
        }
    }
}

/// Like `fetch`, but hands back the raw body stream in enhanced mode
/// instead of a full `Response` (§4.9). A buffered outcome is lifted into
/// a single-item stream by [`Response::into_stream`], so the caller always
/// gets a `ByteStream` regardless of which path produced the response.
pub async fn fetch_stream(
    manager: &FetchManager,
    info: RequestInfo,
    init: RequestInit,
) -> Result<ByteStream, FetchError> {
    let response = fetch(manager, info, init).await?;
    response.into_stream().map_err(|BodyUnusable| {
        FetchError::Transport("response body already consumed".into())
    })
}

async fn run_plain(
    manager: &FetchManager,
    method: &str,
    url: &str,
    request: &crate::normalize::NormalizedRequest,
    config: &Config,
    span: &mut dyn crate::telemetry::Span,
) -> Result<Response, FetchError> {
    let upstream = manager.transport.open(method, url, request, &config.timeouts).await?;
    span.record_u64("http.status_code", upstream.status_code as u64);
    let is_streaming = strategy::detect_streaming(&upstream.headers);
    span.record_bool("http.is_streaming", is_streaming);

    if is_streaming {
        let body = strategy::run_streaming(
            upstream.body,
            None,
            String::new(),
            upstream.headers.clone(),
            upstream.status_code,
            None,
            Arc::new(config.clone()),
        );
        return Ok(Response::streaming(upstream.status_code, upstream.headers, body));
    }

    match strategy::run_buffering(upstream.body, config).await {
        BufferOutcome::Buffered { body } => {
            span.record_u64("http.buffered_bytes", body.len() as u64);
            Ok(Response::buffered(upstream.status_code, upstream.headers, body))
        }
        BufferOutcome::Streamed { body, size_exceeded } => {
            span.record_bool("http.size_limit_exceeded", size_exceeded);
            Ok(Response::streaming(upstream.status_code, upstream.headers, body))
        }
        BufferOutcome::Error(e) => Err(e),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_leader(
    manager: &FetchManager,
    method: &str,
    url: &str,
    request: &crate::normalize::NormalizedRequest,
    config: &Arc<Config>,
    key: String,
    leader: InflightLeader<SharedOutcome>,
    span: &mut dyn crate::telemetry::Span,
    signal: Option<&crate::normalize::CancellationHandle>,
) -> Result<Response, FetchError> {
    let permit = match manager.gate.acquire(signal).await {
        Ok(p) => p,
        Err(e) => {
            leader.resolve(Err(e.clone()));
            return Err(e);
        }
    };

    let upstream = match manager.transport.open(method, url, request, &config.timeouts).await {
        Ok(u) => u,
        Err(e) => {
            permit.release_now();
            leader.resolve(Err(e.clone()));
            return Err(e);
        }
    };

    span.record_u64("http.status_code", upstream.status_code as u64);
    let is_streaming = strategy::detect_streaming(&upstream.headers);
    span.record_bool("http.is_streaming", is_streaming);

    if is_streaming {
        let release = permit.into_owned_release();
        let leader_body = tee_for_leader(
            upstream.body,
            leader,
            upstream.status_code,
            upstream.headers.clone(),
            Arc::clone(config),
        );
        let out_body = strategy::run_streaming(
            leader_body,
            Some(release),
            key,
            upstream.headers.clone(),
            upstream.status_code,
            manager.distributed.clone(),
            Arc::clone(config),
        );
        return Ok(Response::streaming(upstream.status_code, upstream.headers, out_body));
    }

    match strategy::run_buffering(upstream.body, config).await {
        BufferOutcome::Buffered { body } => {
            span.record_u64("http.buffered_bytes", body.len() as u64);
            let value = CachedValue::new(body.clone(), upstream.headers.clone(), upstream.status_code);
            manager.memory.put(key.clone(), value.clone()).await;
            permit.release_now();
            leader.resolve(Ok(SharedOutcome::Buffered(value.clone())));
            if let Some(distributed) = manager.distributed.clone() {
                let ttl = config.cache_ttl_seconds;
                let key = key.clone();
                tokio::spawn(async move { distributed.put_buffered(&key, &value, ttl).await });
            }
            Ok(Response::buffered(upstream.status_code, upstream.headers, body))
        }
        BufferOutcome::Streamed { body, size_exceeded } => {
            span.record_bool("http.size_limit_exceeded", size_exceeded);
            let release = permit.into_owned_release();
            let leader_body = tee_for_leader(
                body,
                leader,
                upstream.status_code,
                upstream.headers.clone(),
                Arc::clone(config),
            );
            let distributed_for_tee = if size_exceeded { None } else { manager.distributed.clone() };
            let out_body = strategy::run_streaming(
                leader_body,
                Some(release),
                key,
                upstream.headers.clone(),
                upstream.status_code,
                distributed_for_tee,
                Arc::clone(config),
            );
            Ok(Response::streaming(upstream.status_code, upstream.headers, out_body))
        }
        BufferOutcome::Error(e) => {
            permit.release_now();
            leader.resolve(Err(e.clone()));
            Err(e)
        }
    }
}

/// Tees `body` so the leader's own caller sees it untouched while a
/// background drain, capped the same way the L2 stream tee is, resolves
/// `leader`'s followers once the whole response has arrived.
fn tee_for_leader(
    body: ByteStream,
    leader: InflightLeader<SharedOutcome>,
    status_code: u16,
    headers: BTreeMap<String, String>,
    config: Arc<Config>,
) -> ByteStream {
    let (caller, mut follower_tee) = tee_bytestream(body);
    tokio::spawn(async move {
        let mut chunks = Vec::new();
        let mut total = 0usize;
        while let Some(item) = follower_tee.next().await {
            match item {
                Ok(chunk) => {
                    if chunks.len() >= config.max_stream_chunks || total > config.max_stream_total_bytes {
                        break;
                    }
                    total += chunk.len();
                    chunks.push(chunk);
                }
                Err(e) => {
                    leader.resolve(Err(e));
                    return;
                }
            }
        }
        leader.resolve(Ok(SharedOutcome::Streamed {
            status_code,
            headers,
            chunks: Arc::new(chunks),
        }));
    });
    caller
}

/// Non-GET enhanced path: one retry at the transport level, never
/// reordering bytes across the retry (§5: "retry restarts the byte stream
/// from offset zero").
async fn call_with_one_retry(
    transport: &dyn Transport,
    method: &str,
    url: &str,
    request: &crate::normalize::NormalizedRequest,
    timeouts: &crate::config::Timeouts,
) -> Result<(u16, BTreeMap<String, String>, Bytes), FetchError> {
    let mut attempt = open_and_buffer(transport, method, url, request, timeouts).await;
    if attempt.is_err() {
        attempt = open_and_buffer(transport, method, url, request, timeouts).await;
    }
    attempt
}

async fn open_and_buffer(
    transport: &dyn Transport,
    method: &str,
    url: &str,
    request: &crate::normalize::NormalizedRequest,
    timeouts: &crate::config::Timeouts,
) -> Result<(u16, BTreeMap<String, String>, Bytes), FetchError> {
    let upstream: UpstreamResponse = transport.open(method, url, request, timeouts).await?;
    let mut body = upstream.body;
    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok((upstream.status_code, upstream.headers, buf.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigCell, ConfigOverrides, StaticFlagStore};
    use crate::storage::{DistributedCache, MemoryObjectStore};
    use crate::telemetry::RecordingTelemetry;
    use crate::transport::{MockTransport, ScriptedResponse};

    async fn test_manager(enhanced: bool) -> (Arc<FetchManager>, Arc<MockTransport>, Arc<RecordingTelemetry>) {
        let mock = MockTransport::new();
        let telemetry = Arc::new(RecordingTelemetry::new());
        let flags = crate::config::FlagSnapshot {
            enhanced_enabled: Some(enhanced),
            ..Default::default()
        };
        let store: Arc<dyn crate::config::FlagStore> = Arc::new(StaticFlagStore::new(flags));
        let config = ConfigCell::new(store, ConfigOverrides::default());
        let loaded = config.ensure_loaded().await;
        let manager = Arc::new(FetchManager {
            gate: Arc::new(crate::semaphore::ConcurrencyGate::new(loaded.concurrency)),
            memory: Arc::new(crate::memory::MemoryCache::new(64)),
            distributed: Some(Arc::new(DistributedCache::new(Arc::new(MemoryObjectStore::new()), "test"))),
            inflight: Arc::new(crate::inflight::InflightCoalescer::new()),
            transport: Arc::clone(&mock) as Arc<dyn Transport>,
            telemetry: Arc::clone(&telemetry) as Arc<dyn crate::telemetry::Telemetry>,
            default_headers: Vec::new(),
            config,
        });
        (manager, mock, telemetry)
    }

    #[tokio::test]
    async fn plain_mode_bypasses_cache_and_hits_upstream_every_time() {
        let (manager, mock, _telemetry) = test_manager(false).await;
        mock.script("http://x/a", ScriptedResponse::ok(b"hi"));
        for _ in 0..3 {
            let resp = fetch(&manager, "http://x/a".into(), RequestInit::default()).await.unwrap();
            assert_eq!(resp.bytes().await.unwrap(), Bytes::from_static(b"hi"));
        }
        assert_eq!(mock.call_count("http://x/a"), 3);
    }

    #[tokio::test]
    async fn enhanced_get_populates_l1_on_first_call() {
        let (manager, mock, telemetry) = test_manager(true).await;
        mock.script("http://x/b", ScriptedResponse::ok(b"cached"));
        let resp = fetch(&manager, "http://x/b".into(), RequestInit::default()).await.unwrap();
        assert_eq!(resp.bytes().await.unwrap(), Bytes::from_static(b"cached"));
        assert_eq!(mock.call_count("http://x/b"), 1);

        let resp2 = fetch(&manager, "http://x/b".into(), RequestInit::default()).await.unwrap();
        assert_eq!(resp2.bytes().await.unwrap(), Bytes::from_static(b"cached"));
        assert_eq!(mock.call_count("http://x/b"), 1, "second call is served from L1");
        assert!(telemetry.spans().iter().any(|s| s.bools.get("http.cache_hit") == Some(&true)));
    }

    #[tokio::test]
    async fn concurrent_gets_for_same_key_coalesce_into_one_upstream_call() {
        let (manager, mock, telemetry) = test_manager(true).await;
        mock.script(
            "http://x/c",
            ScriptedResponse::ok(b"shared")
                .with_header("content-length", "6")
                .with_inter_chunk_delay(std::time::Duration::from_millis(30)),
        );

        let m1 = Arc::clone(&manager);
        let m2 = Arc::clone(&manager);
        let m3 = Arc::clone(&manager);
        let (a, b, c) = tokio::join!(
            fetch(&m1, "http://x/c".into(), RequestInit::default()),
            fetch(&m2, "http://x/c".into(), RequestInit::default()),
            fetch(&m3, "http://x/c".into(), RequestInit::default()),
        );
        let bodies = [a.unwrap().bytes().await.unwrap(), b.unwrap().bytes().await.unwrap(), c.unwrap().bytes().await.unwrap()];
        for body in &bodies {
            assert_eq!(body, &Bytes::from_static(b"shared"));
        }
        assert_eq!(mock.call_count("http://x/c"), 1);
        let dedup_count = telemetry
            .spans()
            .iter()
            .filter(|s| s.bools.get("http.inflight_dedupe") == Some(&true))
            .count();
        assert_eq!(dedup_count, 2, "two of three callers should be followers");
    }

    #[tokio::test]
    async fn non_get_bypasses_cache_even_in_enhanced_mode() {
        let (manager, mock, _telemetry) = test_manager(true).await;
        mock.script("http://x/d", ScriptedResponse::ok(b"posted"));
        let init = RequestInit {
            method: Some("POST".into()),
            ..Default::default()
        };
        fetch(&manager, "http://x/d".into(), init.clone()).await.unwrap();
        fetch(&manager, "http://x/d".into(), init).await.unwrap();
        assert_eq!(mock.call_count("http://x/d"), 2);
    }

    #[tokio::test]
    async fn oversize_response_streams_without_populating_l1() {
        let (manager, mock, telemetry) = test_manager(true).await;
        let chunks = vec![&b"aaaaaaaaaa"[..], &b"bbbbbbbbbb"[..]];
        mock.script("http://x/e", ScriptedResponse::ok(b"").chunked(chunks));
        let flags = crate::config::FlagSnapshot {
            enhanced_enabled: Some(true),
            max_response_bytes: Some(5),
            ..Default::default()
        };
        let store: Arc<dyn crate::config::FlagStore> = Arc::new(StaticFlagStore::new(flags));
        let small_cap_manager = Arc::new(FetchManager {
            gate: Arc::new(crate::semaphore::ConcurrencyGate::new(8)),
            memory: Arc::clone(&manager.memory),
            distributed: manager.distributed.clone(),
            inflight: Arc::new(crate::inflight::InflightCoalescer::new()),
            transport: Arc::clone(&mock) as Arc<dyn Transport>,
            telemetry: Arc::clone(&telemetry) as Arc<dyn crate::telemetry::Telemetry>,
            default_headers: Vec::new(),
            config: {
                let cell = ConfigCell::new(store, ConfigOverrides::default());
                cell.ensure_loaded().await;
                cell
            },
        });
        let resp = fetch(&small_cap_manager, "http://x/e".into(), RequestInit::default())
            .await
            .unwrap();
        let bytes = resp.bytes().await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"aaaaaaaaaabbbbbbbbbb"));
        assert!(small_cap_manager.memory.get("GET:http://x/e").await.is_none());
    }
}
