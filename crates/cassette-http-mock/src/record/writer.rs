//! Record file emission (proxy side).
//!
//! One file per captured exchange, pretty-printed with two-space indentation,
//! named `<sanitized_content_type>_<yyyymmdd_hhmmss>_<4-byte-hex>.json` under
//! `<base_dir>/<mock_id>/`. The random hex suffix keeps same-second bursts
//! from colliding.

use base64::Engine;
use chrono::{Local, SecondsFormat, Utc};
use rand::RngCore;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

/// Request half of an exchange, captured before forwarding.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub request_id: String,
    pub timestamp: String,
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Decoded JSON when the body parses, raw string otherwise, `""` when
    /// the request had no body.
    pub body: Value,
    pub mock_id: String,
}

/// Response half of a non-streaming exchange.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub content_type: String,
    pub content_encoding: String,
    /// Total request latency in seconds.
    pub delay: f64,
}

/// One captured SSE event with its offset from the first byte of the stream.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub data: Value,
    pub timestamp: f64,
}

/// Writes request/response records organized by mock-id.
#[derive(Debug)]
pub struct RecordWriter {
    base_dir: PathBuf,
}

impl RecordWriter {
    pub fn new(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Record a buffered (non-SSE) exchange.
    ///
    /// Gzip bodies are stored verbatim as base64 (not decompressed); other
    /// bodies are stored as decoded JSON when they parse, raw text otherwise.
    pub fn write_pair(&self, req: &CapturedRequest, resp: &CapturedResponse) -> io::Result<PathBuf> {
        let body = if resp.content_encoding == "gzip" {
            Value::String(base64::engine::general_purpose::STANDARD.encode(&resp.body))
        } else if resp.content_type == super::codec::SSE_CONTENT_TYPE {
            // A buffered event stream (upstream closed before the streaming
            // branch engaged): keep the data payloads, without timestamps.
            let text = String::from_utf8_lossy(&resp.body);
            match parse_sse_data_values(&text) {
                Some(events) => Value::Array(events),
                None => Value::String(text.into_owned()),
            }
        } else {
            match serde_json::from_slice(&resp.body) {
                Ok(json) => json,
                Err(_) => Value::String(String::from_utf8_lossy(&resp.body).into_owned()),
            }
        };

        let content_type = if resp.content_type.is_empty() {
            "application/octet-stream"
        } else {
            &resp.content_type
        };
        self.write_record(
            req,
            resp.status,
            &resp.headers,
            body,
            resp.delay,
            &sanitize_content_type(content_type),
        )
    }

    /// Record a streamed SSE exchange with its timestamped events.
    pub fn write_sse_pair(
        &self,
        req: &CapturedRequest,
        status: u16,
        headers: &[(String, String)],
        events: &[CapturedEvent],
        delay: f64,
    ) -> io::Result<PathBuf> {
        let body = Value::Array(
            events
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "data": e.data,
                        "timestamp": e.timestamp,
                    })
                })
                .collect(),
        );
        self.write_record(req, status, headers, body, delay, "text_event-stream")
    }

    fn write_record(
        &self,
        req: &CapturedRequest,
        status: u16,
        headers: &[(String, String)],
        body: Value,
        delay: f64,
        file_stem: &str,
    ) -> io::Result<PathBuf> {
        // Upstream x-mock-id is dropped; the caller's partition label wins.
        let mut response_headers: HashMap<&str, &str> = headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("x-mock-id"))
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        if !req.mock_id.is_empty() {
            response_headers.insert("x-mock-id", &req.mock_id);
        }

        let record = serde_json::json!({
            "request": {
                "request_id": req.request_id,
                "timestamp": req.timestamp,
                "method": req.method,
                "url": req.url,
                "headers": req.headers,
                "body": req.body,
            },
            "response": {
                "request_id": req.request_id,
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
                "status_code": status,
                "headers": response_headers,
                "body": body,
                "delay": delay,
            },
        });

        let mock_id = if req.mock_id.is_empty() {
            "default"
        } else {
            &req.mock_id
        };
        let dir = self.base_dir.join(mock_id);
        std::fs::create_dir_all(&dir)?;

        let filename = format!(
            "{}_{}_{}.json",
            file_stem,
            Local::now().format("%Y%m%d_%H%M%S"),
            random_hex(4)
        );
        let path = dir.join(filename);
        std::fs::write(&path, serde_json::to_vec_pretty(&record)?)?;
        Ok(path)
    }
}

/// Scan a buffered SSE body for `data: ` lines, JSON-parsing each payload and
/// falling back to the raw string. Returns `None` when no events were found.
fn parse_sse_data_values(body: &str) -> Option<Vec<Value>> {
    let mut events = Vec::new();
    for line in body.lines() {
        if let Some(payload) = line.trim().strip_prefix("data: ") {
            match serde_json::from_str(payload) {
                Ok(json) => events.push(json),
                Err(_) => events.push(Value::String(payload.to_string())),
            }
        }
    }
    if events.is_empty() {
        None
    } else {
        Some(events)
    }
}

/// Monotonically-unique id per proxy process: a UTC timestamp with nanosecond
/// resolution.
pub fn generate_request_id() -> String {
    Utc::now().format("%Y%m%d%H%M%S%.9f").to_string()
}

/// Turn a media type into a safe file name component: parameters stripped,
/// `/`, `+` and `.` replaced with `_`, empty input becomes `unknown`.
pub fn sanitize_content_type(content_type: &str) -> String {
    let stripped = content_type.split(';').next().unwrap_or("").trim();
    if stripped.is_empty() {
        return "unknown".to_string();
    }
    stripped.replace(['/', '+', '.'], "_")
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}
