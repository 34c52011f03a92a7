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

// Streaming Strategy (C7): detects a response that should never be
// buffered, and carries it to the caller untouched while an optional
// background tee feeds the L2 stream-replay encoding (§4.7).

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::StreamExt;

use crate::config::Config;
use crate::semaphore::OwnedRelease;
use crate::storage::DistributedCache;
use crate::tee::tee_bytestream;
use crate::transport::ByteStream;

/// True if `headers` describe a response that must be streamed rather than
/// buffered: chunked transfer-encoding, an event-stream/multipart
/// content-type, or a transfer-encoding present with no content-length
/// (§4.7 detection predicate). Lookups are case-insensitive.
pub fn detect_streaming(headers: &BTreeMap<String, String>) -> bool {
    let get = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };
    let transfer_encoding = get("transfer-encoding");
    if transfer_encoding
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        return true;
    }
    if let Some(content_type) = get("content-type") {
        let lower = content_type.to_ascii_lowercase();
        if lower.starts_with("text/event-stream") || lower.starts_with("multipart/") {
            return true;
        }
    }
    if get("content-length").is_none() && transfer_encoding.is_some() {
        return true;
    }
    false
}

/// Wraps `body` so `release` fires exactly once, on stream end or on the
/// first error, instead of staying held until the caller drops the
/// `Response` (§4.3: ownership of the permit transfers to whichever
/// strategy ends up owning the body). `release` is optional because the
/// plain (non-enhanced) path never acquires the gate in the first place.
pub fn release_on_end(body: ByteStream, release: Option<OwnedRelease>) -> ByteStream {
    let Some(release) = release else { return body };
    Box::pin(futures::stream::unfold(
        (body, Some(release)),
        |(mut body, mut release)| async move {
            match body.next().await {
                None => {
                    if let Some(r) = release.take() {
                        r.release();
                    }
                    None
                }
                Some(item) => {
                    if item.is_err() {
                        if let Some(r) = release.take() {
                            r.release();
                        }
                    }
                    Some((item, (body, release)))
                }
            }
        },
    ))
}

/// Runs the pure-streaming path: the caller gets the upstream bytes as-is;
/// if an L2 cache is configured and `stream_enabled` is set, a background
/// task tees the same bytes into the stream-replay encoding (§4.7, §4.5).
/// `release` is guaranteed to fire exactly once regardless of which branch
/// runs.
#[allow(clippy::too_many_arguments)]
pub fn run_streaming(
    body: ByteStream,
    release: Option<OwnedRelease>,
    cache_key: String,
    headers: BTreeMap<String, String>,
    status_code: u16,
    distributed: Option<Arc<DistributedCache>>,
    config: Arc<Config>,
) -> ByteStream {
    let body = match distributed {
        Some(distributed) if config.stream_enabled => {
            let (caller, mut tee) = tee_bytestream(body);
            let headers_vec: Vec<(String, String)> = headers.into_iter().collect();
            tokio::spawn(async move {
                let mut chunks = Vec::new();
                while let Some(item) = tee.next().await {
                    match item {
                        Ok(chunk) => chunks.push(chunk),
                        Err(_) => return,
                    }
                }
                distributed
                    .put_stream(&cache_key, &chunks, &headers_vec, status_code, &config)
                    .await;
            });
            caller
        }
        _ => body,
    };
    release_on_end(body, release)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn chunked_transfer_encoding_is_streaming() {
        assert!(detect_streaming(&headers(&[("transfer-encoding", "chunked")])));
    }

    #[test]
    fn event_stream_content_type_is_streaming() {
        assert!(detect_streaming(&headers(&[(
            "content-type",
            "text/event-stream; charset=utf-8"
        )])));
    }

    #[test]
    fn multipart_content_type_is_streaming() {
        assert!(detect_streaming(&headers(&[(
            "content-type",
            "multipart/byteranges; boundary=x"
        )])));
    }

    #[test]
    fn transfer_encoding_without_content_length_is_streaming() {
        assert!(detect_streaming(&headers(&[("transfer-encoding", "gzip")])));
    }

    #[test]
    fn ordinary_json_response_is_not_streaming() {
        assert!(!detect_streaming(&headers(&[
            ("content-type", "application/json"),
            ("content-length", "12"),
        ])));
    }

    #[tokio::test]
    async fn release_fires_once_on_end() {
        use crate::semaphore::ConcurrencyGate;
        use bytes::Bytes;
        use futures::stream;
        use std::sync::Arc as StdArc;

        let gate = StdArc::new(ConcurrencyGate::new(1));
        let permit = gate.acquire(None).await.unwrap();
        let release = permit.into_owned_release();

        let body: ByteStream = Box::pin(stream::iter(vec![Ok(Bytes::from_static(b"a"))]));
        let mut wrapped = release_on_end(body, Some(release.clone()));
        assert!(!release.is_released());
        while wrapped.next().await.is_some() {}
        assert!(release.is_released());
        assert_eq!(gate.available_permits(), 1);
    }
}
