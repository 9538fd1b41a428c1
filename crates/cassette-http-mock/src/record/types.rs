//! In-memory representation of a recorded exchange.

use bytes::Bytes;
use serde_json::Value;
use std::path::PathBuf;

/// A response header as recorded, with its lowercase name precomputed so the
/// replay hot path can skip hop-by-hop and internal headers without
/// re-lowercasing on every request.
#[derive(Debug, Clone)]
pub struct StoredHeader {
    pub name: String,
    pub name_lower: String,
    pub value: String,
}

impl StoredHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let name_lower = name.to_ascii_lowercase();
        Self {
            name,
            name_lower,
            value: value.into(),
        }
    }
}

/// A single recorded Server-Sent-Event.
///
/// `serialized` holds the exact bytes emitted after `data: ` on replay. The
/// literal string `[DONE]` is kept unquoted; everything else is the JSON
/// encoding of `data`.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub data: Value,
    /// Seconds after the first byte of the recorded stream.
    pub timestamp: f64,
    pub serialized: Bytes,
}

/// A fully materialized mock response, built once at startup and immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub request_id: String,
    /// URL path component only; query, scheme and host are discarded.
    pub path: String,
    pub method: String,
    pub mock_id: String,
    /// Normalized media type: parameters stripped, whitespace trimmed,
    /// defaulted to `application/json` when the record carries none.
    pub content_type: String,
    pub status_code: u16,
    pub headers: Vec<StoredHeader>,
    /// Pre-serialized body, ready to write. For SSE records this is the full
    /// concatenated `data: …\n\n` stream, used when timing replay is off.
    pub body_bytes: Bytes,
    pub full_url: String,
    /// Total recorded latency in seconds. For SSE, first byte to last event.
    pub delay: f64,
    /// Populated iff `is_sse`; drives timed replay.
    pub sse_events: Vec<SseEvent>,
    pub is_sse: bool,
}

impl MockResponse {
    /// Case-insensitive lookup into the recorded response headers.
    pub fn header(&self, name_lower: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name_lower == name_lower)
            .map(|h| h.value.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("invalid mock record: missing request or response object")]
    InvalidRecord,
    #[error("failed to parse record JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to read record file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
