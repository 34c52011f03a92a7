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

// Shared domain types used across L1 (memory), L2 (distributed), and the
// inflight coalescer (§3 glossary: CacheKey, CachedValue).

use std::collections::BTreeMap;

use bytes::Bytes;

/// `"<METHOD>:<normalized-URL>"`. Method is upper-case ASCII; the URL is
/// exactly what the normalizer produced, with no query reordering (§3).
///
/// This is distinct from the hashed path a storage backend uses to address
/// an L2 entry on disk or in an object store — see `storage::hash_key`.
pub type CacheKey = String;

pub fn cache_key(method: &str, url: &str) -> CacheKey {
    format!("{}:{}", method.to_ascii_uppercase(), url)
}

/// A complete buffered upstream response. Immutable after construction
/// (§3). `headers` keys are lower-cased for stable equality and cheap
/// case-insensitive lookup once frozen into this shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    pub body: Bytes,
    pub headers: BTreeMap<String, String>,
    pub status_code: u16,
}

impl CachedValue {
    pub fn new(
        body: Bytes,
        headers: impl IntoIterator<Item = (String, String)>,
        status_code: u16,
    ) -> Self {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        Self {
            body,
            headers,
            status_code,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_upper_cases_method_only() {
        assert_eq!(cache_key("get", "http://x/y?Q=1"), "GET:http://x/y?Q=1");
    }

    #[test]
    fn headers_are_normalized_to_lower_case() {
        let v = CachedValue::new(
            Bytes::from_static(b"body"),
            vec![("Content-Type".to_string(), "text/plain".to_string())],
            200,
        );
        assert_eq!(v.header("content-type"), Some("text/plain"));
        assert_eq!(v.header("Content-Type"), Some("text/plain"));
    }
}
