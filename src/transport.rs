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

// Transport (A1): the HTTP wire collaborator. `Transport` is the seam the
// orchestrator opens an upstream byte stream through; `HyperTransport` is
// the default implementation, `MockTransport` drives deterministic tests
// (§4.11).

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, Stream, StreamExt};
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request};
use hyper_rustls::HttpsConnectorBuilder;
use tokio::time::timeout;

use crate::config::Timeouts;
use crate::error::{FetchError, TimeoutStage};
use crate::normalize::NormalizedRequest;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

/// Status, headers, and a lazy byte stream for one upstream call. Headers
/// arrive before any body bytes are read, which is what lets C7 run its
/// streaming-detection predicate before a single byte is consumed (§4.7).
pub struct UpstreamResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: ByteStream,
}

/// The HTTP wire collaborator. Dyn-safe via `BoxFuture` so the orchestrator
/// can hold `Arc<dyn Transport>` without an `async_trait` dependency.
pub trait Transport: Send + Sync {
    fn open<'a>(
        &'a self,
        method: &'a str,
        url: &'a str,
        request: &'a NormalizedRequest,
        timeouts: &'a Timeouts,
    ) -> BoxFuture<'a, Result<UpstreamResponse, FetchError>>;
}

/// Default transport: a shared `hyper::Client` over TLS via `hyper-rustls`
/// (§4.11). Enforces the `connect` timeout stage at connection time; the
/// `socket`/`request` stages are enforced by the caller around body reads.
pub struct HyperTransport {
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>>,
}

impl HyperTransport {
    pub fn new() -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Self {
            client: Client::builder().build(https),
        }
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HyperTransport {
    fn open<'a>(
        &'a self,
        method: &'a str,
        url: &'a str,
        request: &'a NormalizedRequest,
        timeouts: &'a Timeouts,
    ) -> BoxFuture<'a, Result<UpstreamResponse, FetchError>> {
        Box::pin(async move {
            let method: Method = method
                .parse()
                .map_err(|_| FetchError::Config(format!("invalid method {method:?}")))?;

            let mut builder = Request::builder().method(method).uri(url);
            for (name, value) in request.headers.iter() {
                for v in value.values() {
                    builder = builder.header(name, v);
                }
            }
            let body = request
                .body
                .as_ref()
                .map(|b| Body::from(b.clone()))
                .unwrap_or_else(Body::empty);
            let req = builder
                .body(body)
                .map_err(|e| FetchError::Config(e.to_string()))?;

            let start = Instant::now();
            let response = match timeouts.connect {
                None => self.client.request(req).await.map_err(FetchError::from)?,
                Some(ms) => timeout(Duration::from_millis(ms), self.client.request(req))
                    .await
                    .map_err(|_| FetchError::Timeout(TimeoutStage::Connect))?
                    .map_err(FetchError::from)?,
            };

            let status_code = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();

            let body = response.into_body();
            // `request` is a wall-clock deadline over the whole call (from
            // just before `connect`); `socket` is an idle-read timeout reset
            // on every chunk. Whichever stage fires first wins.
            let request_deadline = timeouts.request.map(|ms| start + Duration::from_millis(ms));
            let socket_timeout = timeouts.socket.map(Duration::from_millis);
            let byte_stream = stream::unfold(
                (body, request_deadline, socket_timeout, false),
                |(mut body, request_deadline, socket_timeout, errored)| async move {
                    if errored {
                        return None;
                    }
                    if let Some(deadline) = request_deadline {
                        if Instant::now() >= deadline {
                            return Some((
                                Err(FetchError::Timeout(TimeoutStage::Request)),
                                (body, request_deadline, socket_timeout, true),
                            ));
                        }
                    }
                    let chunk = match socket_timeout {
                        Some(d) => match timeout(d, body.data()).await {
                            Ok(chunk) => chunk,
                            Err(_) => {
                                return Some((
                                    Err(FetchError::Timeout(TimeoutStage::Socket)),
                                    (body, request_deadline, socket_timeout, true),
                                ))
                            }
                        },
                        None => body.data().await,
                    };
                    match chunk {
                        Some(Ok(bytes)) => {
                            Some((Ok(bytes), (body, request_deadline, socket_timeout, false)))
                        }
                        Some(Err(e)) => Some((
                            Err(FetchError::from(e)),
                            (body, request_deadline, socket_timeout, true),
                        )),
                        None => None,
                    }
                },
            );

            Ok(UpstreamResponse {
                status_code,
                headers,
                body: Box::pin(byte_stream),
            })
        })
    }
}

/// Scripted response used to drive one call through [`MockTransport`].
#[derive(Clone)]
pub struct ScriptedResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub chunks: Vec<Bytes>,
    pub inter_chunk_delay: Option<Duration>,
    pub fail_before_bytes: bool,
}

impl ScriptedResponse {
    pub fn ok(body: &'static [u8]) -> Self {
        Self {
            status_code: 200,
            headers: BTreeMap::new(),
            chunks: vec![Bytes::from_static(body)],
            inter_chunk_delay: None,
            fail_before_bytes: false,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = status;
        self
    }

    pub fn chunked(mut self, chunks: Vec<&'static [u8]>) -> Self {
        self.chunks = chunks.into_iter().map(Bytes::from_static).collect();
        self
    }

    pub fn with_inter_chunk_delay(mut self, delay: Duration) -> Self {
        self.inter_chunk_delay = Some(delay);
        self
    }
}

/// An in-memory `Transport` that replays scripted responses keyed by URL,
/// and counts how many times `open` was called per URL — used to assert
/// inflight coalescing collapses concurrent calls into one upstream hit
/// (§8 scenario 4).
pub struct MockTransport {
    scripts: dashmap::DashMap<String, ScriptedResponse>,
    call_counts: dashmap::DashMap<String, usize>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: dashmap::DashMap::new(),
            call_counts: dashmap::DashMap::new(),
        })
    }

    pub fn script(&self, url: impl Into<String>, response: ScriptedResponse) {
        self.scripts.insert(url.into(), response);
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.call_counts.get(url).map(|c| *c).unwrap_or(0)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            scripts: dashmap::DashMap::new(),
            call_counts: dashmap::DashMap::new(),
        }
    }
}

impl Transport for MockTransport {
    fn open<'a>(
        &'a self,
        _method: &'a str,
        url: &'a str,
        _request: &'a NormalizedRequest,
        _timeouts: &'a Timeouts,
    ) -> BoxFuture<'a, Result<UpstreamResponse, FetchError>> {
        Box::pin(async move {
            *self.call_counts.entry(url.to_string()).or_insert(0) += 1;

            let script = self
                .scripts
                .get(url)
                .map(|s| s.clone())
                .ok_or_else(|| FetchError::Transport(format!("no script for {url}")))?;

            if script.fail_before_bytes {
                return Err(FetchError::Transport("scripted failure".into()));
            }

            let delay = script.inter_chunk_delay;
            let chunks = script.chunks.clone();
            let byte_stream = stream::iter(chunks.into_iter().map(Ok)).then(move |item| async move {
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                item
            });

            Ok(UpstreamResponse {
                status_code: script.status_code,
                headers: script.headers.clone(),
                body: Box::pin(byte_stream),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize, RequestInfo, RequestInit};

    fn req(url: &str) -> NormalizedRequest {
        let (_, normalized) = normalize(
            RequestInfo::Url(url.to_string()),
            RequestInit::default(),
            &[],
            Timeouts::default(),
        );
        normalized
    }

    #[tokio::test]
    async fn mock_transport_replays_scripted_body() {
        let mock = MockTransport::new();
        mock.script("http://x/y", ScriptedResponse::ok(b"hello"));
        let normalized = req("http://x/y");
        let resp = mock
            .open("GET", "http://x/y", &normalized, &Timeouts::default())
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
        let bytes: Vec<Bytes> = resp.body.map(|r| r.unwrap()).collect().await;
        assert_eq!(bytes.concat(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn mock_transport_counts_calls_per_url() {
        let mock = MockTransport::new();
        mock.script("http://x/y", ScriptedResponse::ok(b"hi"));
        let normalized = req("http://x/y");
        for _ in 0..3 {
            let _ = mock
                .open("GET", "http://x/y", &normalized, &Timeouts::default())
                .await
                .unwrap();
        }
        assert_eq!(mock.call_count("http://x/y"), 3);
    }
}
