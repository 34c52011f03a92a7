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

// Request Normalizer (C2): canonicalize URL + options; merge headers;
// resolve timeouts (§4.2).

use bytes::Bytes;

use crate::config::Timeouts;

/// A single header value, after merge. Duplicate header names collapse into
/// `Multi`, except `User-Agent`, which always joins with a single space
/// (§4.2, §9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValue {
    pub fn as_single(&self) -> Option<&str> {
        match self {
            HeaderValue::Single(v) => Some(v),
            HeaderValue::Multi(_) => None,
        }
    }

    pub fn values(&self) -> Vec<&str> {
        match self {
            HeaderValue::Single(v) => vec![v.as_str()],
            HeaderValue::Multi(vs) => vs.iter().map(String::as_str).collect(),
        }
    }
}

/// An ordered, case-insensitive header map that preserves the case of each
/// name's first occurrence (§4.2, §9).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, HeaderValue)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.position(name).map(|i| &self.entries[i].1)
    }

    pub fn remove(&mut self, name: &str) {
        if let Some(i) = self.position(name) {
            self.entries.remove(i);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies one `(name, value)` pair using the merge rules: first
    /// occurrence wins the stored case; an empty value removes the key
    /// ("empty values override defaults by removing the key"); `User-Agent`
    /// collisions join with a single space; any other collision becomes a
    /// `Multi` list.
    pub fn apply(&mut self, name: &str, value: &str) {
        if value.is_empty() {
            self.remove(name);
            return;
        }
        match self.position(name) {
            None => self.entries.push((name.to_string(), HeaderValue::Single(value.to_string()))),
            Some(i) => {
                let is_user_agent = name.eq_ignore_ascii_case("user-agent");
                let (_, existing) = &mut self.entries[i];
                if is_user_agent {
                    let joined = match existing {
                        HeaderValue::Single(v) => format!("{v} {value}"),
                        HeaderValue::Multi(vs) => {
                            let mut joined = vs.join(" ");
                            joined.push(' ');
                            joined.push_str(value);
                            joined
                        }
                    };
                    *existing = HeaderValue::Single(joined);
                } else {
                    match existing {
                        HeaderValue::Single(v) => {
                            *existing = HeaderValue::Multi(vec![v.clone(), value.to_string()]);
                        }
                        HeaderValue::Multi(vs) => vs.push(value.to_string()),
                    }
                }
            }
        }
    }

    /// Merges `other` on top of `self` in order, applying [`Self::apply`]
    /// for every entry (later entries, e.g. caller headers over defaults,
    /// win collisions per the rules above).
    pub fn merge_from(&mut self, other: &[(String, String)]) {
        for (name, value) in other {
            self.apply(name, value);
        }
    }
}

/// Request body as the caller supplies it.
#[derive(Debug, Clone)]
pub enum Body {
    Bytes(Bytes),
    /// Form parameters; becomes `application/x-www-form-urlencoded` bytes.
    Form(Vec<(String, String)>),
}

/// Caller-supplied timeout shape: either a single millisecond figure
/// (expands to `{connect, socket}`) or a per-stage record (§4.2).
#[derive(Debug, Clone, Copy)]
pub enum TimeoutInit {
    Millis(u64),
    Staged {
        connect: Option<u64>,
        socket: Option<u64>,
        request: Option<u64>,
    },
}

/// A URL, or a request-like carrying its own timeout (§4.2 "Inputs").
#[derive(Debug, Clone)]
pub enum RequestInfo {
    Url(String),
    WithTimeout {
        url: String,
        timeout: Option<TimeoutInit>,
    },
}

impl From<&str> for RequestInfo {
    fn from(s: &str) -> Self {
        RequestInfo::Url(s.to_string())
    }
}

impl From<String> for RequestInfo {
    fn from(s: String) -> Self {
        RequestInfo::Url(s)
    }
}

/// A cancellation handle forwarded to `acquire()` and to the transport
/// (§5). Cloning shares the same underlying signal.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    inner: std::sync::Arc<tokio::sync::Notify>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.notify_waiters();
    }

    pub async fn cancelled(&self) {
        self.inner.notified().await;
    }
}

/// Caller-supplied request options, before normalization (§4.2 "Inputs").
#[derive(Debug, Clone, Default)]
pub struct RequestInit {
    pub method: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Body>,
    pub timeout: Option<TimeoutInit>,
    pub signal: Option<CancellationHandle>,
}

/// `(method, headers, body, timeout, signal)` after normalization (§3
/// "Request options (normalized)").
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub method: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Timeouts,
    pub signal: Option<CancellationHandle>,
}

fn resolve_timeout(defaults: Timeouts, caller: Option<TimeoutInit>) -> Timeouts {
    let mut effective = defaults;
    match caller {
        None => {}
        Some(TimeoutInit::Millis(n)) => {
            effective.connect = Some(n);
            effective.socket = Some(n);
        }
        Some(TimeoutInit::Staged {
            connect,
            socket,
            request,
        }) => {
            // An explicit zero removes that stage from the effective timeout.
            if let Some(c) = connect {
                effective.connect = if c == 0 { None } else { Some(c) };
            }
            if let Some(s) = socket {
                effective.socket = if s == 0 { None } else { Some(s) };
            }
            if let Some(r) = request {
                effective.request = if r == 0 { None } else { Some(r) };
            }
        }
    }
    effective
}

fn encode_form(pairs: &[(String, String)]) -> Bytes {
    let encoded = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish();
    Bytes::from(encoded.into_bytes())
}

/// Normalizes a request-info value plus caller options against the
/// manager's defaults, producing `(url, options)` (§4.2).
///
/// `normalize(normalize(x)) == normalize(x)`: feeding an already-normalized
/// request back in as caller options (with empty defaults) reproduces the
/// same output, since merging is idempotent per key and the method is
/// already upper-case.
pub fn normalize(
    info: RequestInfo,
    mut init: RequestInit,
    default_headers: &[(String, String)],
    default_timeout: Timeouts,
) -> (String, NormalizedRequest) {
    let (url, info_timeout) = match info {
        RequestInfo::Url(url) => (url, None),
        RequestInfo::WithTimeout { url, timeout } => (url, timeout),
    };

    // A request-like's own timeout is a default; explicit `init.timeout`
    // (the caller option) still wins per the usual default-then-override
    // order.
    let timeout = init.timeout.take().or(info_timeout);

    let method = init
        .method
        .map(|m| m.to_ascii_uppercase())
        .unwrap_or_else(|| "GET".to_string());

    let mut headers = HeaderMap::new();
    headers.merge_from(default_headers);

    let body = match init.body.take() {
        None => None,
        Some(Body::Bytes(b)) => Some(b),
        Some(Body::Form(pairs)) => {
            let encoded = encode_form(&pairs);
            headers.merge_from(&init.headers);
            if headers.get("content-type").is_none() {
                headers.apply(
                    "Content-Type",
                    "application/x-www-form-urlencoded;charset=UTF-8",
                );
            }
            let normalized = NormalizedRequest {
                method,
                headers,
                body: Some(encoded),
                timeout: resolve_timeout(default_timeout, timeout),
                signal: init.signal,
            };
            return (url, normalized);
        }
    };

    headers.merge_from(&init.headers);

    let normalized = NormalizedRequest {
        method,
        headers,
        body,
        timeout: resolve_timeout(default_timeout, timeout),
        signal: init.signal,
    };
    (url, normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_get_uppercased() {
        let (_, req) = normalize(
            RequestInfo::Url("http://svc/a".into()),
            RequestInit::default(),
            &[],
            Timeouts::default(),
        );
        assert_eq!(req.method, "GET");

        let (_, req) = normalize(
            RequestInfo::Url("http://svc/a".into()),
            RequestInit {
                method: Some("post".into()),
                ..Default::default()
            },
            &[],
            Timeouts::default(),
        );
        assert_eq!(req.method, "POST");
    }

    #[test]
    fn form_body_encodes_and_sets_content_type() {
        let (_, req) = normalize(
            RequestInfo::Url("http://svc/f".into()),
            RequestInit {
                method: Some("post".into()),
                body: Some(Body::Form(vec![
                    ("a".into(), "1".into()),
                    ("b".into(), "2".into()),
                ])),
                ..Default::default()
            },
            &[],
            Timeouts::default(),
        );
        assert_eq!(req.body.as_deref(), Some(&b"a=1&b=2"[..]));
        assert_eq!(
            req.headers.get("content-type").and_then(|v| v.as_single()),
            Some("application/x-www-form-urlencoded;charset=UTF-8")
        );
    }

    #[test]
    fn form_body_keeps_existing_content_type() {
        let (_, req) = normalize(
            RequestInfo::Url("http://svc/f".into()),
            RequestInit {
                method: Some("post".into()),
                headers: vec![("Content-Type".into(), "application/json".into())],
                body: Some(Body::Form(vec![("a".into(), "1".into())])),
                ..Default::default()
            },
            &[],
            Timeouts::default(),
        );
        assert_eq!(
            req.headers.get("content-type").and_then(|v| v.as_single()),
            Some("application/json")
        );
    }

    #[test]
    fn user_agent_joins_with_space() {
        let (_, req) = normalize(
            RequestInfo::Url("http://svc/a".into()),
            RequestInit {
                headers: vec![("User-Agent".into(), "caller/1.0".into())],
                ..Default::default()
            },
            &[("User-Agent".into(), "default/1.0".into())],
            Timeouts::default(),
        );
        assert_eq!(
            req.headers.get("user-agent").and_then(|v| v.as_single()),
            Some("default/1.0 caller/1.0")
        );
    }

    #[test]
    fn other_collisions_become_multi() {
        let (_, req) = normalize(
            RequestInfo::Url("http://svc/a".into()),
            RequestInit {
                headers: vec![("X-Tag".into(), "two".into())],
                ..Default::default()
            },
            &[("X-Tag".into(), "one".into())],
            Timeouts::default(),
        );
        assert_eq!(
            req.headers.get("x-tag"),
            Some(&HeaderValue::Multi(vec!["one".into(), "two".into()]))
        );
    }

    #[test]
    fn first_occurrence_case_wins() {
        let (_, req) = normalize(
            RequestInfo::Url("http://svc/a".into()),
            RequestInit {
                headers: vec![("x-tag".into(), "override".into())],
                ..Default::default()
            },
            &[("X-Tag".into(), "default".into())],
            Timeouts::default(),
        );
        let (name, _) = req.headers.iter().next().unwrap();
        assert_eq!(name, "X-Tag");
    }

    #[test]
    fn empty_value_removes_default_header() {
        let (_, req) = normalize(
            RequestInfo::Url("http://svc/a".into()),
            RequestInit {
                headers: vec![("X-Tag".into(), "".into())],
                ..Default::default()
            },
            &[("X-Tag".into(), "default".into())],
            Timeouts::default(),
        );
        assert!(req.headers.get("x-tag").is_none());
    }

    #[test]
    fn numeric_timeout_expands_to_connect_and_socket() {
        let (_, req) = normalize(
            RequestInfo::Url("http://svc/a".into()),
            RequestInit {
                timeout: Some(TimeoutInit::Millis(500)),
                ..Default::default()
            },
            &[],
            Timeouts::default(),
        );
        assert_eq!(req.timeout.connect, Some(500));
        assert_eq!(req.timeout.socket, Some(500));
        assert_eq!(req.timeout.request, None);
    }

    #[test]
    fn explicit_zero_timeout_removes_stage() {
        let defaults = Timeouts {
            connect: Some(100),
            socket: Some(100),
            request: Some(100),
        };
        let (_, req) = normalize(
            RequestInfo::Url("http://svc/a".into()),
            RequestInit {
                timeout: Some(TimeoutInit::Staged {
                    connect: Some(0),
                    socket: None,
                    request: None,
                }),
                ..Default::default()
            },
            &[],
            defaults,
        );
        assert_eq!(req.timeout.connect, None);
        assert_eq!(req.timeout.socket, Some(100));
        assert_eq!(req.timeout.request, Some(100));
    }

    #[test]
    fn normalize_is_idempotent() {
        let (url, first) = normalize(
            RequestInfo::Url("http://svc/a".into()),
            RequestInit {
                method: Some("post".into()),
                headers: vec![("X-Tag".into(), "one".into())],
                body: Some(Body::Bytes(Bytes::from_static(b"hi"))),
                timeout: Some(TimeoutInit::Millis(500)),
                ..Default::default()
            },
            &[],
            Timeouts::default(),
        );

        let replay_headers: Vec<(String, String)> = first
            .headers
            .iter()
            .flat_map(|(k, v)| v.values().into_iter().map(move |v| (k.to_string(), v.to_string())))
            .collect();

        let (_, second) = normalize(
            RequestInfo::Url(url),
            RequestInit {
                method: Some(first.method.clone()),
                headers: replay_headers,
                body: first.body.clone().map(Body::Bytes),
                timeout: Some(TimeoutInit::Staged {
                    connect: first.timeout.connect.or(Some(0)),
                    socket: first.timeout.socket.or(Some(0)),
                    request: first.timeout.request.or(Some(0)),
                }),
                ..Default::default()
            },
            &[],
            Timeouts::default(),
        );

        assert_eq!(first.method, second.method);
        assert_eq!(first.body, second.body);
        assert_eq!(first.headers, second.headers);
    }
}
