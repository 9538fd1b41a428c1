//! 404 request logging.
//!
//! Unmatched requests are persisted with the same record shape as proxy
//! captures, but into a flat directory (no per-mock-id subdirectory). These
//! logs are ephemeral: the flat layout keeps them out of the index, which only
//! walks `<mock_id>/` subdirectories.

use super::writer::sanitize_content_type;
use chrono::{Local, SecondsFormat, Utc};
use rand::RngCore;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

/// Writes one JSON file per unmatched request.
#[derive(Debug)]
pub struct NotFoundLogger {
    base_dir: PathBuf,
}

impl NotFoundLogger {
    pub fn new(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Persist an unmatched request together with the 404 response it
    /// received. The file name is derived from the request's Accept header.
    pub fn log(
        &self,
        method: &str,
        url: &str,
        accept: &str,
        headers: HashMap<String, String>,
        body: &[u8],
        response_body: &[u8],
    ) -> io::Result<PathBuf> {
        let request_id = super::writer::generate_request_id();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);

        let record = serde_json::json!({
            "request": {
                "request_id": request_id,
                "timestamp": timestamp,
                "method": method,
                "url": url,
                "headers": headers,
                "body": decode_body(body),
            },
            "response": {
                "request_id": request_id,
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
                "status_code": 404,
                "headers": {"Content-Type": "application/json"},
                "body": decode_body(response_body),
                "delay": 0,
            },
        });

        let filename = format!(
            "{}_{}_{}.json",
            sanitize_content_type(&accept_media_type(accept)),
            Local::now().format("%Y%m%d_%H%M%S"),
            random_hex(4)
        );
        let path = self.base_dir.join(filename);
        std::fs::write(&path, serde_json::to_vec_pretty(&record)?)?;
        Ok(path)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

fn decode_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::String(String::new());
    }
    match serde_json::from_slice(body) {
        Ok(json) => json,
        Err(_) => Value::String(String::from_utf8_lossy(body).into_owned()),
    }
}

/// First media type of an Accept header; empty or `*/*` maps to
/// `application/json`.
fn accept_media_type(accept: &str) -> String {
    if accept.is_empty() || accept == "*/*" {
        return "application/json".to_string();
    }
    let first = accept.split(',').next().unwrap_or("");
    let first = first.split(';').next().unwrap_or("");
    first.trim().to_string()
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}
