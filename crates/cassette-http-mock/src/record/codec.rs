//! Record file parsing.
//!
//! Records are parsed as a generic JSON tree so unknown fields never cause
//! rejection. The parser mirrors the writer in `writer.rs`: a freshly written
//! record loads back into a [`MockResponse`] with identical replay fields.

use super::types::{MockResponse, RecordError, SseEvent, StoredHeader};
use base64::Engine;
use bytes::Bytes;
use flate2::read::GzDecoder;
use serde_json::Value;
use std::io::Read;
use std::path::Path;
use url::Url;

pub const SSE_CONTENT_TYPE: &str = "text/event-stream";
pub const DONE_SENTINEL: &str = "[DONE]";

/// Load and parse one record file. `fallback_mock_id` is used when the
/// recorded request carries no `x-mock-id` header (the directory name for
/// index loading, the scenario name for scenario loading).
pub fn load_from_file(path: &Path, fallback_mock_id: &str) -> Result<MockResponse, RecordError> {
    let data = std::fs::read(path).map_err(|source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_record(&data, fallback_mock_id)
}

/// Parse the raw bytes of one record document into a [`MockResponse`].
pub fn parse_record(data: &[u8], fallback_mock_id: &str) -> Result<MockResponse, RecordError> {
    let root: Value = serde_json::from_slice(data)?;
    let request = root
        .get("request")
        .and_then(Value::as_object)
        .ok_or(RecordError::InvalidRecord)?;
    let response = root
        .get("response")
        .and_then(Value::as_object)
        .ok_or(RecordError::InvalidRecord)?;

    let full_url = request
        .get("url")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let path = extract_path(&full_url);

    let mut mock_id = fallback_mock_id.to_string();
    if let Some(headers) = request.get("headers").and_then(Value::as_object) {
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("x-mock-id") {
                if let Some(id) = value.as_str() {
                    if !id.is_empty() {
                        mock_id = id.to_string();
                    }
                }
            }
        }
    }

    let mut headers = Vec::new();
    let mut content_type_raw = String::new();
    let mut content_encoding = String::new();
    if let Some(map) = response.get("headers").and_then(Value::as_object) {
        for (name, value) in map {
            if let Some(value) = value.as_str() {
                let header = StoredHeader::new(name.clone(), value);
                match header.name_lower.as_str() {
                    "content-type" => content_type_raw = value.to_string(),
                    "content-encoding" => content_encoding = value.to_string(),
                    _ => {}
                }
                headers.push(header);
            }
        }
    }
    let content_type = normalize_content_type(&content_type_raw);

    let mut body = response.get("body").cloned().unwrap_or(Value::Null);
    if content_encoding == "gzip" {
        if let Value::String(encoded) = &body {
            if !encoded.is_empty() {
                if let Some(decoded) = decode_gzip_body(encoded) {
                    body = decoded;
                }
            }
        }
    }

    let method = match request.get("method").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => "GET".to_string(),
    };
    let status_code = response
        .get("status_code")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(200);
    let request_id = request
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let delay = response
        .get("delay")
        .and_then(Value::as_f64)
        .or_else(|| response.get("elapsed_seconds").and_then(Value::as_f64))
        .unwrap_or(0.0);

    let is_sse = content_type == SSE_CONTENT_TYPE;
    let (body_bytes, sse_events) = if is_sse {
        materialize_sse_body(&body)?
    } else {
        (materialize_body(&body)?, Vec::new())
    };

    Ok(MockResponse {
        request_id,
        path,
        method,
        mock_id,
        content_type,
        status_code,
        headers,
        body_bytes,
        full_url,
        delay,
        sse_events,
        is_sse,
    })
}

/// Strip media type parameters and surrounding whitespace; an absent or
/// parameter-only type defaults to `application/json`. Idempotent.
pub fn normalize_content_type(raw: &str) -> String {
    let stripped = raw.split(';').next().unwrap_or("").trim();
    if stripped.is_empty() {
        "application/json".to_string()
    } else {
        stripped.to_string()
    }
}

/// Extract the path component of a recorded URL. Relative URLs (no scheme)
/// are accepted; an empty path becomes `/`.
fn extract_path(url: &str) -> String {
    if let Ok(parsed) = Url::parse(url) {
        let path = parsed.path();
        if path.is_empty() {
            return "/".to_string();
        }
        return path.to_string();
    }
    let path = url.split(['?', '#']).next().unwrap_or("");
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

/// Best-effort rehydration of a gzip body stored as base64. Any failure up to
/// decompression leaves the original string body in place; a decompressed
/// payload that is not JSON survives as a plain string.
fn decode_gzip_body(encoded: &str) -> Option<Value> {
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let mut decompressed = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut decompressed)
        .ok()?;
    match serde_json::from_slice(&decompressed) {
        Ok(json) => Some(json),
        Err(_) => Some(Value::String(
            String::from_utf8_lossy(&decompressed).into_owned(),
        )),
    }
}

fn materialize_body(body: &Value) -> Result<Bytes, RecordError> {
    match body {
        Value::String(s) => Ok(Bytes::from(s.clone().into_bytes())),
        other => Ok(Bytes::from(serde_json::to_vec(other)?)),
    }
}

fn serialize_event_data(data: &Value) -> Result<Bytes, RecordError> {
    if data.as_str() == Some(DONE_SENTINEL) {
        Ok(Bytes::from_static(DONE_SENTINEL.as_bytes()))
    } else {
        Ok(Bytes::from(serde_json::to_vec(data)?))
    }
}

/// Build the pre-serialized `data: …\n\n` stream and the timed event list
/// from an SSE record body.
fn materialize_sse_body(body: &Value) -> Result<(Bytes, Vec<SseEvent>), RecordError> {
    match body {
        Value::Array(items) => {
            let mut stream = Vec::new();
            let mut events = Vec::with_capacity(items.len());
            for item in items {
                if let Value::Object(map) = item {
                    let Some(data) = map.get("data") else {
                        continue;
                    };
                    let serialized = serialize_event_data(data)?;
                    stream.extend_from_slice(b"data: ");
                    stream.extend_from_slice(&serialized);
                    stream.extend_from_slice(b"\n\n");
                    events.push(SseEvent {
                        data: data.clone(),
                        timestamp: map.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0),
                        serialized,
                    });
                } else {
                    // Bare event payloads (older proxy output) carry no
                    // timestamps and only feed the concatenated stream.
                    let serialized = serialize_event_data(item)?;
                    stream.extend_from_slice(b"data: ");
                    stream.extend_from_slice(&serialized);
                    stream.extend_from_slice(b"\n\n");
                }
            }
            Ok((Bytes::from(stream), events))
        }
        Value::String(s) => Ok((Bytes::from(s.clone().into_bytes()), Vec::new())),
        _ => Ok((Bytes::new(), Vec::new())),
    }
}
