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

// Response Adapter (C10): a uniform Response over either a buffered byte
// buffer or a lazy, at-most-once-consumed byte stream (§4.10).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;

use crate::error::FetchError;
use crate::tee::tee_bytestream;
use crate::transport::ByteStream;

/// Returned once a body has already been consumed, or once a second clone
/// is attempted after consumption (§4.10: "body is unusable").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyUnusable;

impl fmt::Display for BodyUnusable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "body is unusable")
    }
}

impl std::error::Error for BodyUnusable {}

#[derive(Debug)]
pub enum ResponseError {
    Unusable,
    Transport(FetchError),
    Decode(String),
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseError::Unusable => write!(f, "body is unusable"),
            ResponseError::Transport(e) => write!(f, "{e}"),
            ResponseError::Decode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ResponseError {}

impl From<BodyUnusable> for ResponseError {
    fn from(_: BodyUnusable) -> Self {
        ResponseError::Unusable
    }
}

enum BodyState {
    Buffered(Bytes),
    Stream(ByteStream),
    Consumed,
}

/// The Fetch-API-shaped response handed back from `fetch`/`fetch_stream`.
/// Headers are lower-cased, mirroring `CachedValue` (§3).
pub struct Response {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    body: Mutex<BodyState>,
}

impl Response {
    pub fn buffered(status_code: u16, headers: BTreeMap<String, String>, body: Bytes) -> Self {
        Self {
            status_code,
            headers,
            body: Mutex::new(BodyState::Buffered(body)),
        }
    }

    pub fn streaming(status_code: u16, headers: BTreeMap<String, String>, body: ByteStream) -> Self {
        Self {
            status_code,
            headers,
            body: Mutex::new(BodyState::Stream(body)),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn is_streaming_body(&self) -> bool {
        matches!(*self.body.lock().unwrap(), BodyState::Stream(_))
    }

    /// Takes ownership of the raw body stream, as `fetch_stream` returns it
    /// to the caller in enhanced mode (§4.9). Fails if the body is already
    /// buffered-only or already consumed.
    pub fn into_stream(self) -> Result<ByteStream, BodyUnusable> {
        match self.body.into_inner().unwrap() {
            BodyState::Stream(s) => Ok(s),
            BodyState::Buffered(b) => Ok(Box::pin(stream::once(async move { Ok(b) }))),
            BodyState::Consumed => Err(BodyUnusable),
        }
    }

    /// Drains the body into a single buffer. A streaming body is fully read
    /// in upstream order; a buffered body is returned immediately.
    pub async fn bytes(&self) -> Result<Bytes, BodyUnusable> {
        let state = {
            let mut guard = self.body.lock().unwrap();
            std::mem::replace(&mut *guard, BodyState::Consumed)
        };
        match state {
            BodyState::Buffered(b) => Ok(b),
            BodyState::Stream(mut s) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = s.next().await {
                    match chunk {
                        Ok(c) => buf.extend_from_slice(&c),
                        Err(_) => break,
                    }
                }
                Ok(buf.freeze())
            }
            BodyState::Consumed => Err(BodyUnusable),
        }
    }

    pub async fn text(&self) -> Result<String, ResponseError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(&self) -> Result<T, ResponseError> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ResponseError::Decode(e.to_string()))
    }

    /// Tees an unconsumed body into two independent readers sharing the
    /// upstream data exactly once; fails with [`BodyUnusable`] if the body
    /// has already been consumed (§4.10).
    pub fn clone_response(&self) -> Result<Response, BodyUnusable> {
        let mut guard = self.body.lock().unwrap();
        match std::mem::replace(&mut *guard, BodyState::Consumed) {
            BodyState::Buffered(b) => {
                *guard = BodyState::Buffered(b.clone());
                Ok(Response {
                    status_code: self.status_code,
                    headers: self.headers.clone(),
                    body: Mutex::new(BodyState::Buffered(b)),
                })
            }
            BodyState::Stream(s) => {
                let (left, right) = tee_bytestream(s);
                *guard = BodyState::Stream(left);
                Ok(Response {
                    status_code: self.status_code,
                    headers: self.headers.clone(),
                    body: Mutex::new(BodyState::Stream(right)),
                })
            }
            BodyState::Consumed => Err(BodyUnusable),
        }
    }
}
