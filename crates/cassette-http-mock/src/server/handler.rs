//! The mock request handler.
//!
//! The hot path works on byte slices straight out of the request: no header
//! values are converted to heap strings, method and content-type comparisons
//! are byte-wise, and the response body is a cheap handle onto the record's
//! pre-serialized bytes. The one unavoidable allocation is the composite
//! lookup key, which the store satisfies from a thread-local buffer.

use super::sse::SseWriterPool;
use super::timing::{self, TimingConfig};
use crate::record::{MockResponse, NotFoundLogger};
use crate::store::MockStore;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::warn;

pub type MockBody = BoxBody<Bytes, Infallible>;

const STATS_PATH: &str = "/__mock__/stats";
const LIST_PATH: &str = "/__mock__/list";
const DEFAULT_MOCK_ID: &[u8] = b"default";
const DEFAULT_CONTENT_TYPE: &[u8] = b"application/json";
const ACCEPT_ANY: &[u8] = b"*/*";
const NOT_FOUND_BODY: &[u8] = br#"{"error":"No mock found"}"#;

/// Everything a request needs, shared read-only across connections.
pub struct HandlerContext {
    pub store: Arc<MockStore>,
    pub timing: TimingConfig,
    pub sse_pool: Arc<SseWriterPool>,
    pub not_found: Option<Arc<NotFoundLogger>>,
}

/// Headers never copied from a record to the wire: hop-by-hop headers, body
/// framing the transport owns, and the internal partition label.
fn is_excluded_header(name_lower: &str) -> bool {
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
            | "content-encoding"
            | "content-length"
            | "x-mock-id"
    )
}

pub fn full_body(bytes: Bytes) -> MockBody {
    Full::new(bytes).boxed()
}

fn frame_ok(bytes: Bytes) -> Result<Frame<Bytes>, Infallible> {
    Ok(Frame::data(bytes))
}

pub fn channel_body(rx: mpsc::Receiver<Bytes>) -> MockBody {
    StreamBody::new(ReceiverStream::new(rx).map(frame_ok)).boxed()
}

fn cached_json(bytes: Bytes) -> Response<MockBody> {
    let mut response = Response::new(full_body(bytes));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Handle one request end to end. Generic over the body type so tests can
/// drive it with `Full<Bytes>` while the server feeds it `Incoming`.
pub async fn handle<B>(
    ctx: &HandlerContext,
    req: Request<B>,
) -> Result<Response<MockBody>, Infallible>
where
    B: Body<Data = Bytes>,
{
    let (parts, body) = req.into_parts();
    let path = parts.uri.path();

    if parts.method == Method::GET {
        if path == STATS_PATH {
            return Ok(cached_json(ctx.store.stats_json()));
        }
        if path == LIST_PATH {
            return Ok(cached_json(ctx.store.mock_list_json()));
        }
    }

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    };

    let method_bytes = parts.method.as_str().as_bytes();
    let record = if ctx.store.has_scenarios() {
        ctx.store
            .match_scenario(path.as_bytes(), method_bytes, &body_bytes)
    } else {
        let mock_id = parts
            .headers
            .get("x-mock-id")
            .map(HeaderValue::as_bytes)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_MOCK_ID);
        let accept = parts
            .headers
            .get(ACCEPT)
            .map(HeaderValue::as_bytes)
            .unwrap_or(b"");

        if accept.is_empty() {
            ctx.store
                .find(path.as_bytes(), mock_id, DEFAULT_CONTENT_TYPE, method_bytes)
        } else if accept == ACCEPT_ANY {
            ctx.store
                .find_any_content_type(path.as_bytes(), mock_id, method_bytes)
        } else {
            ctx.store
                .find(path.as_bytes(), mock_id, first_media_type(accept), method_bytes)
        }
    };

    let Some(record) = record else {
        let response = not_found_response();
        log_not_found(ctx, &parts, &body_bytes);
        return Ok(response);
    };

    // Non-SSE latency replay; the SSE writer handles its own timing.
    if ctx.timing.replay_timing && !record.is_sse && record.delay > 0.0 {
        let delay =
            timing::jittered_delay(record.delay, ctx.timing.jitter, &mut rand::thread_rng());
        if delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
    }

    let body = if record.is_sse && !record.sse_events.is_empty() && ctx.timing.replay_timing {
        let scale = timing::jitter_scale(ctx.timing.jitter, &mut rand::thread_rng());
        spawn_sse_stream(ctx, Arc::clone(&record), scale)
    } else {
        full_body(record.body_bytes.clone())
    };

    Ok(assemble_response(&record, body))
}

/// Cut the Accept header down to its first media type: everything before the
/// first `,`, then before the first `;`, trimmed. Returns a subslice.
fn first_media_type(accept: &[u8]) -> &[u8] {
    let mut accept = accept;
    if let Some(i) = accept.iter().position(|&b| b == b',') {
        accept = &accept[..i];
    }
    if let Some(i) = accept.iter().position(|&b| b == b';') {
        accept = &accept[..i];
    }
    crate::store::normalize_content_type_bytes(accept)
}

fn spawn_sse_stream(ctx: &HandlerContext, record: Arc<MockResponse>, scale: f64) -> MockBody {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let mut writer = ctx.sse_pool.acquire();
    writer.prepare(record, scale);
    let pool = Arc::clone(&ctx.sse_pool);
    tokio::spawn(async move {
        writer.stream_to(&tx).await;
        pool.release(writer);
    });
    channel_body(rx)
}

fn assemble_response(record: &MockResponse, body: MockBody) -> Response<MockBody> {
    let mut response = Response::new(body);
    *response.status_mut() =
        StatusCode::from_u16(record.status_code).unwrap_or(StatusCode::OK);

    let mut content_type_set = false;
    for header in &record.headers {
        if is_excluded_header(&header.name_lower) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(header.name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(&header.value) else {
            continue;
        };
        response.headers_mut().insert(name, value);
        if header.name_lower == "content-type" {
            content_type_set = true;
        }
    }

    if !content_type_set {
        let content_type = if record.content_type.is_empty() {
            "application/json"
        } else {
            record.content_type.as_str()
        };
        if let Ok(value) = HeaderValue::from_str(content_type) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
    }

    response
}

fn not_found_response() -> Response<MockBody> {
    let mut response = Response::new(full_body(Bytes::from_static(NOT_FOUND_BODY)));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Hand the unmatched request to the 404 logger, off the request path.
/// Logging failure never surfaces to the client.
fn log_not_found(ctx: &HandlerContext, parts: &hyper::http::request::Parts, body: &Bytes) {
    let Some(logger) = ctx.not_found.clone() else {
        return;
    };
    let method = parts.method.to_string();
    let url = parts.uri.to_string();
    let accept = parts
        .headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let headers: HashMap<String, String> = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = body.clone();

    tokio::task::spawn_blocking(move || {
        if let Err(error) =
            logger.log(&method, &url, &accept, headers, &body, NOT_FOUND_BODY)
        {
            warn!(%error, "failed to write 404 log");
        }
    });
}
