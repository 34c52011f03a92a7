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

// Telemetry (A2): one span per call recording exactly the attribute set of
// §6. `TracingTelemetry` is the default sink; `RecordingTelemetry` lets
// tests assert on what the orchestrator recorded without a subscriber.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::FetchError;

pub trait Span: Send {
    fn record_bool(&mut self, key: &'static str, value: bool);
    fn record_u64(&mut self, key: &'static str, value: u64);
    fn record_error(&mut self, err: &FetchError);
}

pub trait Telemetry: Send + Sync {
    fn start(&self, method: &str, url: &str) -> Box<dyn Span>;
}

/// Opens a `tracing::Span` named `http.fetch` and records the §6 attribute
/// set as fields are produced by the orchestrator. Fields are declared
/// `Empty` up front since `tracing` spans have a fixed field set.
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn start(&self, method: &str, url: &str) -> Box<dyn Span> {
        let span = tracing::info_span!(
            "http.fetch",
            http.method = %method,
            http.url = %url,
            http.enhanced_fetch = tracing::field::Empty,
            http.cache_hit = tracing::field::Empty,
            http.redis_hit = tracing::field::Empty,
            http.redis_stream_replay = tracing::field::Empty,
            http.inflight_dedupe = tracing::field::Empty,
            http.is_streaming = tracing::field::Empty,
            http.status_code = tracing::field::Empty,
            http.size_limit_exceeded = tracing::field::Empty,
            http.buffered_bytes = tracing::field::Empty,
            http.error = tracing::field::Empty,
        );
        Box::new(TracingSpan { span })
    }
}

struct TracingSpan {
    span: tracing::Span,
}

impl Span for TracingSpan {
    fn record_bool(&mut self, key: &'static str, value: bool) {
        self.span.record(key, value);
    }

    fn record_u64(&mut self, key: &'static str, value: u64) {
        self.span.record(key, value);
    }

    fn record_error(&mut self, err: &FetchError) {
        if let Some(tag) = err.telemetry_tag() {
            self.span.record("http.error", tag);
        }
    }
}

/// A snapshot of everything recorded on one span, captured by
/// [`RecordingTelemetry`] for assertions in tests (§8 scenario 4: "two of
/// the three spans" recorded `http.inflight_dedupe = true`).
#[derive(Debug, Default, Clone)]
pub struct RecordedSpan {
    pub method: String,
    pub url: String,
    pub bools: BTreeMap<&'static str, bool>,
    pub u64s: BTreeMap<&'static str, u64>,
    pub error: Option<&'static str>,
}

/// An in-memory `Telemetry` used by tests; every `start()` call appends a
/// new [`RecordedSpan`] reachable via [`RecordingTelemetry::spans`].
#[derive(Default)]
pub struct RecordingTelemetry {
    spans: Mutex<Vec<Arc<Mutex<RecordedSpan>>>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.lock().unwrap().clone())
            .collect()
    }
}

impl Telemetry for RecordingTelemetry {
    fn start(&self, method: &str, url: &str) -> Box<dyn Span> {
        let recorded = Arc::new(Mutex::new(RecordedSpan {
            method: method.to_string(),
            url: url.to_string(),
            ..Default::default()
        }));
        self.spans.lock().unwrap().push(Arc::clone(&recorded));
        Box::new(RecordingSpan { recorded })
    }
}

struct RecordingSpan {
    recorded: Arc<Mutex<RecordedSpan>>,
}

impl Span for RecordingSpan {
    fn record_bool(&mut self, key: &'static str, value: bool) {
        self.recorded.lock().unwrap().bools.insert(key, value);
    }

    fn record_u64(&mut self, key: &'static str, value: u64) {
        self.recorded.lock().unwrap().u64s.insert(key, value);
    }

    fn record_error(&mut self, err: &FetchError) {
        self.recorded.lock().unwrap().error = err.telemetry_tag();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_telemetry_captures_fields_per_call() {
        let telemetry = RecordingTelemetry::new();
        let mut span = telemetry.start("GET", "http://x/y");
        span.record_bool("http.cache_hit", true);
        span.record_u64("http.status_code", 200);
        drop(span);

        let spans = telemetry.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].method, "GET");
        assert_eq!(spans[0].bools.get("http.cache_hit"), Some(&true));
        assert_eq!(spans[0].u64s.get("http.status_code"), Some(&200));
    }

    #[test]
    fn record_error_sets_telemetry_tag() {
        let telemetry = RecordingTelemetry::new();
        let mut span = telemetry.start("GET", "http://x");
        span.record_error(&FetchError::Transport("boom".into()));
        drop(span);
        assert_eq!(telemetry.spans()[0].error, Some("network"));
    }
}
