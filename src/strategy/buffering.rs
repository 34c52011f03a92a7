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

// Buffering Strategy (C8): BUFFER/DECIDE/STREAM/EMIT_B/EMIT_S state machine
// for a response whose streaming-ness isn't known up front (§4.8).
//
// `max_response_bytes` is a hard cap, enforced on every chunk regardless of
// phase: crossing it sets `sizeExceeded` and forces STREAM no matter how
// little has been buffered so far. `stream_detect_buffer` marks the end of
// the BUFFER phase; only once buffered bytes cross it does DECIDE start
// comparing against the soft `stream_buffer_max` cap on each subsequent
// chunk. A `stream_detect_buffer` at or below `stream_buffer_max` (the
// common case) makes `stream_buffer_max` the effective soft threshold, same
// as checking it alone; setting `stream_detect_buffer` above
// `stream_buffer_max` genuinely delays the soft cap until that much has
// been sampled. Ending without crossing either threshold is EMIT_B.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};

use crate::config::Config;
use crate::error::FetchError;
use crate::transport::ByteStream;

pub enum BufferOutcome {
    /// Upstream ended before either threshold was crossed: `body` is the
    /// complete response and is safe to hand to L1/L2 (EMIT_B).
    Buffered { body: Bytes },
    /// A threshold was crossed: `body` replays whatever was already
    /// buffered, then continues from upstream (STREAM -> EMIT_S).
    /// `size_exceeded` is `true` when the hard cap fired rather than the
    /// soft one, so the caller knows this response must not be cached.
    Streamed { body: ByteStream, size_exceeded: bool },
    Error(FetchError),
}

pub async fn run_buffering(mut body: ByteStream, config: &Config) -> BufferOutcome {
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0usize;
    loop {
        match body.next().await {
            None => {
                let mut buf = BytesMut::with_capacity(total);
                for chunk in &chunks {
                    buf.extend_from_slice(chunk);
                }
                return BufferOutcome::Buffered { body: buf.freeze() };
            }
            Some(Err(e)) => return BufferOutcome::Error(e),
            Some(Ok(chunk)) => {
                let would_total = total + chunk.len();
                if would_total > config.max_response_bytes {
                    tracing::info!(
                        cap = config.max_response_bytes,
                        "response body exceeded max_response_bytes, switching to streaming"
                    );
                    let rest: ByteStream = Box::pin(stream::once(async move { Ok(chunk) }).chain(body));
                    return BufferOutcome::Streamed {
                        body: primed(chunks, rest),
                        size_exceeded: true,
                    };
                }
                chunks.push(chunk);
                total = would_total;
                if total > config.stream_detect_buffer && total > config.stream_buffer_max {
                    return BufferOutcome::Streamed {
                        body: primed(chunks, body),
                        size_exceeded: false,
                    };
                }
            }
        }
    }
}

fn primed(primer: Vec<Bytes>, rest: ByteStream) -> ByteStream {
    Box::pin(stream::iter(primer.into_iter().map(Ok)).chain(rest))
}
