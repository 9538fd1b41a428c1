//! The recording proxy handler: capture, forward, persist, relay.

use super::client::UpstreamClient;
use super::sse;
use crate::record::{self, CapturedRequest, CapturedResponse, RecordWriter};
use crate::server::handler::{full_body, MockBody};
use anyhow::Context;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::HeaderValue;
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};
use url::Url;

/// The upstream target, parsed once at startup.
#[derive(Debug, Clone)]
pub struct Target {
    /// `scheme://host[:port]`, used to build forwarded URIs.
    pub origin: String,
    pub host: String,
    pub port: u16,
    pub https: bool,
    /// Host header value: `host[:port]` with default ports left implicit.
    pub authority: String,
}

impl Target {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("invalid target URL {raw:?}"))?;
        let https = match url.scheme() {
            "http" => false,
            "https" => true,
            other => anyhow::bail!("unsupported target scheme {other:?}"),
        };
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("target URL {raw:?} has no host"))?
            .to_string();
        let port = url.port().unwrap_or(if https { 443 } else { 80 });
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };
        Ok(Self {
            origin: format!("{}://{authority}", url.scheme()),
            host,
            port,
            https,
            authority,
        })
    }
}

/// JSON error response, used for upstream failures.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<MockBody> {
    let body = format!(r#"{{"error": "{message}"}}"#);
    let mut response = Response::new(full_body(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Response headers not relayed to the client on the buffered path. The body
/// is re-framed from collected bytes, but encoding headers stay: the payload
/// is passed through verbatim, compressed or not.
fn is_stripped_response_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "x-mock-id"
    )
}

fn is_stripped_forward_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "host" | "x-mock-id" | "proxy-connection" | "proxy-authenticate" | "proxy-authorization"
    )
}

/// Forwards every request to the target, records the exchange, and relays
/// the response. SSE requests take the raw streaming path.
pub struct RecordingProxy {
    writer: Arc<RecordWriter>,
    client: UpstreamClient,
    tls: TlsConnector,
    target: Target,
}

impl RecordingProxy {
    pub fn new(
        writer: RecordWriter,
        client: UpstreamClient,
        tls_config: Arc<rustls::ClientConfig>,
        target: Target,
    ) -> Self {
        Self {
            writer: Arc::new(writer),
            client,
            tls: TlsConnector::from(tls_config),
            target,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<MockBody>, Infallible>
    where
        B: Body<Data = Bytes>,
    {
        if req.method() == Method::CONNECT {
            return Ok(error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "CONNECT is not supported; use plain reverse-proxy mode",
            ));
        }

        let (parts, body) = req.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => Bytes::new(),
        };

        let captured = capture_request(&parts, &body_bytes, &self.target);
        info!(
            request_id = %captured.request_id,
            method = %captured.method,
            url = %captured.url,
            mock_id = %display_mock_id(&captured.mock_id),
            "incoming request"
        );

        let accept = parts
            .headers
            .get(hyper::header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if accept.contains(record::SSE_CONTENT_TYPE) {
            return Ok(sse::record_sse_exchange(
                &self.target,
                &self.tls,
                Arc::clone(&self.writer),
                &parts,
                &body_bytes,
                captured,
            )
            .await);
        }

        Ok(self.forward_and_record(&parts, body_bytes, captured).await)
    }

    async fn forward_and_record(
        &self,
        parts: &Parts,
        body_bytes: Bytes,
        captured: CapturedRequest,
    ) -> Response<MockBody> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("{}{}", self.target.origin, path_and_query);

        let mut upstream_req = Request::builder().method(parts.method.clone()).uri(uri);
        for (name, value) in &parts.headers {
            if is_stripped_forward_header(name.as_str()) {
                continue;
            }
            upstream_req = upstream_req.header(name, value);
        }
        let upstream_req = match upstream_req.body(Full::new(body_bytes)) {
            Ok(req) => req,
            Err(err) => {
                warn!(request_id = %captured.request_id, error = %err, "failed to build upstream request");
                return error_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        let start = Instant::now();
        let upstream_response = match self.client.request(upstream_req).await {
            Ok(response) => response,
            Err(err) => {
                warn!(request_id = %captured.request_id, error = %err, "upstream request failed");
                return error_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        let (resp_parts, resp_body) = upstream_response.into_parts();
        let resp_bytes = match resp_body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                warn!(request_id = %captured.request_id, error = %err, "failed to read upstream response body");
                return error_response(StatusCode::BAD_GATEWAY, "Failed to read upstream response");
            }
        };
        let elapsed = start.elapsed().as_secs_f64();

        let headers: Vec<(String, String)> = resp_parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let content_type = resp_parts
            .headers
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let content_encoding = resp_parts
            .headers
            .get(hyper::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let status = resp_parts.status.as_u16();
        info!(
            request_id = %captured.request_id,
            status,
            elapsed = %format!("{elapsed:.3}s"),
            "upstream responded"
        );

        // Persistence is fire-and-forget: a failed write is logged, never
        // surfaced to the client.
        let writer = Arc::clone(&self.writer);
        let record_response = CapturedResponse {
            status,
            headers,
            body: resp_bytes.to_vec(),
            content_type,
            content_encoding,
            delay: elapsed,
        };
        let request_id = captured.request_id.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(error) = writer.write_pair(&captured, &record_response) {
                warn!(%request_id, %error, "failed to record exchange");
            }
        });

        let mut response = Response::new(full_body(resp_bytes));
        *response.status_mut() = resp_parts.status;
        for (name, value) in &resp_parts.headers {
            if is_stripped_response_header(name.as_str()) {
                continue;
            }
            response.headers_mut().insert(name.clone(), value.clone());
        }
        response
    }
}

fn display_mock_id(mock_id: &str) -> &str {
    if mock_id.is_empty() {
        "default"
    } else {
        mock_id
    }
}

/// Snapshot the request for recording: headers, JSON-decoded body, mock-id.
fn capture_request(parts: &Parts, body: &Bytes, target: &Target) -> CapturedRequest {
    let mock_id = parts
        .headers
        .get("x-mock-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut headers: HashMap<String, String> = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    if !mock_id.is_empty() {
        headers.insert("x-mock-id".to_string(), mock_id.clone());
    }

    let body_value = if body.is_empty() {
        Value::String(String::new())
    } else {
        match serde_json::from_slice(body) {
            Ok(json) => json,
            Err(_) => Value::String(String::from_utf8_lossy(body).into_owned()),
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = match parts
        .headers
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
    {
        Some(host) => format!("http://{host}{path_and_query}"),
        None => format!("{}{}", target.origin, path_and_query),
    };

    CapturedRequest {
        request_id: record::generate_request_id(),
        timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        method: parts.method.to_string(),
        url,
        headers,
        body: body_value,
        mock_id,
    }
}
