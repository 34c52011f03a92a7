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

// Shared L2 wire format: gzip(json(base64(body))), the teacher's encoding
// (see storage/{local,s3,gcs,azure}.rs) generalized to cover both the
// buffered and stream-replay shapes of §4.5, plus TTL expiry (the teacher's
// backends have no TTL of their own — object stores and the filesystem
// don't expire keys for you, so expiry is carried in the envelope and
// checked on read).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

use crate::cache_value::CachedValue;

#[derive(Debug)]
pub enum EnvelopeError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Base64(base64::DecodeError),
    Expired,
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::Io(e) => write!(f, "io error: {e}"),
            EnvelopeError::Json(e) => write!(f, "json error: {e}"),
            EnvelopeError::Base64(e) => write!(f, "base64 error: {e}"),
            EnvelopeError::Expired => write!(f, "entry expired"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Hashes the logical CacheKey into a path-safe identifier for a storage
/// backend (filesystem / object key). Never used for the logical CacheKey
/// itself — see the "Cache path encoding" note.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Serialize, Deserialize)]
struct BufferedEnvelope {
    body_b64: String,
    headers: Vec<(String, String)>,
    status_code: u16,
    inserted_at_epoch_ms: i64,
    ttl_seconds: u64,
}

pub fn encode_buffered(value: &CachedValue, ttl_seconds: u64) -> Result<Vec<u8>, EnvelopeError> {
    let envelope = BufferedEnvelope {
        body_b64: STANDARD.encode(&value.body),
        headers: value
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        status_code: value.status_code,
        inserted_at_epoch_ms: Utc::now().timestamp_millis(),
        ttl_seconds,
    };
    gzip_json(&envelope)
}

pub fn decode_buffered(bytes: &[u8]) -> Result<CachedValue, EnvelopeError> {
    let envelope: BufferedEnvelope = un_gzip_json(bytes)?;
    if is_expired(envelope.inserted_at_epoch_ms, envelope.ttl_seconds) {
        return Err(EnvelopeError::Expired);
    }
    let body = STANDARD
        .decode(&envelope.body_b64)
        .map_err(EnvelopeError::Base64)?;
    Ok(CachedValue::new(Bytes::from(body), envelope.headers, envelope.status_code))
}

#[derive(Serialize, Deserialize)]
struct StreamEnvelope {
    chunks_b64: Vec<String>,
    headers: Vec<(String, String)>,
    status_code: u16,
    inserted_at_epoch_ms: i64,
    ttl_seconds: u64,
}

pub fn encode_stream(
    chunks: &[Bytes],
    headers: &[(String, String)],
    status_code: u16,
    ttl_seconds: u64,
) -> Result<Vec<u8>, EnvelopeError> {
    let envelope = StreamEnvelope {
        chunks_b64: chunks.iter().map(|c| STANDARD.encode(c)).collect(),
        headers: headers.to_vec(),
        status_code,
        inserted_at_epoch_ms: Utc::now().timestamp_millis(),
        ttl_seconds,
    };
    gzip_json(&envelope)
}

pub struct DecodedStream {
    pub chunks: Vec<Bytes>,
    pub headers: Vec<(String, String)>,
    pub status_code: u16,
}

/// Length of the stream list without full decode, mirroring the "check
/// stream list length" step of the lookup order in §4.5.
pub fn stream_chunk_count(bytes: &[u8]) -> Result<usize, EnvelopeError> {
    let envelope: StreamEnvelope = un_gzip_json(bytes)?;
    if is_expired(envelope.inserted_at_epoch_ms, envelope.ttl_seconds) {
        return Err(EnvelopeError::Expired);
    }
    Ok(envelope.chunks_b64.len())
}

pub fn decode_stream(bytes: &[u8]) -> Result<DecodedStream, EnvelopeError> {
    let envelope: StreamEnvelope = un_gzip_json(bytes)?;
    if is_expired(envelope.inserted_at_epoch_ms, envelope.ttl_seconds) {
        return Err(EnvelopeError::Expired);
    }
    let chunks = envelope
        .chunks_b64
        .iter()
        .map(|c| STANDARD.decode(c).map(Bytes::from))
        .collect::<Result<Vec<_>, _>>()
        .map_err(EnvelopeError::Base64)?;
    Ok(DecodedStream {
        chunks,
        headers: envelope.headers,
        status_code: envelope.status_code,
    })
}

fn is_expired(inserted_at_epoch_ms: i64, ttl_seconds: u64) -> bool {
    let age_ms = Utc::now().timestamp_millis() - inserted_at_epoch_ms;
    age_ms < 0 || age_ms as u64 > ttl_seconds * 1000
}

fn gzip_json<T: Serialize>(value: &T) -> Result<Vec<u8>, EnvelopeError> {
    let json = serde_json::to_vec(value).map_err(EnvelopeError::Json)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).map_err(EnvelopeError::Io)?;
    encoder.finish().map_err(EnvelopeError::Io)
}

fn un_gzip_json<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, EnvelopeError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(EnvelopeError::Io)?;
    serde_json::from_slice(&decompressed).map_err(EnvelopeError::Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_round_trips() {
        let value = CachedValue::new(
            Bytes::from_static(b"hello"),
            vec![("content-type".to_string(), "text/plain".to_string())],
            200,
        );
        let encoded = encode_buffered(&value, 300).unwrap();
        let decoded = decode_buffered(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn buffered_expired_is_rejected() {
        let value = CachedValue::new(Bytes::from_static(b"x"), vec![], 200);
        let encoded = encode_buffered(&value, 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(matches!(decode_buffered(&encoded), Err(EnvelopeError::Expired)));
    }

    #[test]
    fn stream_round_trips_with_chunk_count() {
        let chunks = vec![Bytes::from_static(b"a"), Bytes::from_static(b"bc")];
        let encoded = encode_stream(&chunks, &[], 200, 300).unwrap();
        assert_eq!(stream_chunk_count(&encoded).unwrap(), 2);
        let decoded = decode_stream(&encoded).unwrap();
        assert_eq!(decoded.chunks, chunks);
        assert_eq!(decoded.status_code, 200);
    }

    #[test]
    fn hash_key_is_stable_and_hex() {
        let h1 = hash_key("GET:http://x");
        let h2 = hash_key("GET:http://x");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }
}
