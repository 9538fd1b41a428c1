//! SSE recording pipeline.
//!
//! When a client asks for `text/event-stream`, the proxy opens a raw
//! connection to the upstream, relays the response head immediately, then
//! streams the body to the client byte-for-byte while parsing it line by
//! line. Blank lines delimit events; every `data: ` payload is captured with
//! its offset from the first byte so the replay side can reproduce the
//! original pacing.

use super::handler::{error_response, Target};
use crate::record::{CapturedEvent, CapturedRequest, RecordWriter};
use crate::server::handler::{channel_body, MockBody};
use bytes::Bytes;
use hyper::http::request::Parts;
use hyper::{Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

/// Headers not relayed to the client on the SSE path. The body is re-framed
/// by the server transport, so framing headers must go too.
fn is_stripped_sse_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "connection" | "keep-alive" | "transfer-encoding" | "content-length" | "x-mock-id"
    )
}

/// Request headers never forwarded upstream.
fn is_stripped_request_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "host"
            | "x-mock-id"
            | "content-length"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
    )
}

/// Record an SSE exchange while relaying it. Errors before the body starts
/// yield a 502; errors mid-stream are terminal but whatever was captured is
/// still persisted.
pub(crate) async fn record_sse_exchange(
    target: &Target,
    tls: &TlsConnector,
    writer: Arc<RecordWriter>,
    parts: &Parts,
    body: &Bytes,
    captured: CapturedRequest,
) -> Response<MockBody> {
    let start = Instant::now();

    let stream = match dial(target, tls).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(request_id = %captured.request_id, error = %err, "SSE upstream dial failed");
            return error_response(StatusCode::BAD_GATEWAY, "Failed to connect to upstream");
        }
    };

    let mut stream = stream;
    let head = build_request_head(target, parts, body.len());
    let write_result = async {
        stream.write_all(head.as_bytes()).await?;
        if !body.is_empty() {
            stream.write_all(body).await?;
        }
        stream.flush().await
    }
    .await;
    if let Err(err) = write_result {
        warn!(request_id = %captured.request_id, error = %err, "SSE upstream write failed");
        return error_response(StatusCode::BAD_GATEWAY, "Failed to write request to upstream");
    }

    let mut reader = BufReader::new(stream);
    let (status, upstream_headers) = match read_response_head(&mut reader).await {
        Ok(head) => head,
        Err(err) => {
            warn!(request_id = %captured.request_id, error = %err, "SSE upstream head read failed");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "Failed to read response headers from upstream",
            );
        }
    };

    let chunked = upstream_headers
        .iter()
        .any(|(name, value)| {
            name.eq_ignore_ascii_case("transfer-encoding") && value.eq_ignore_ascii_case("chunked")
        });

    // Headers as captured, for the record; upstream x-mock-id is dropped by
    // the writer.
    let saved_headers: Vec<(String, String)> = upstream_headers.clone();

    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let mut response = Response::new(channel_body(rx));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    for (name, value) in &upstream_headers {
        if is_stripped_sse_header(&name.to_ascii_lowercase()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            hyper::header::HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }

    info!(request_id = %captured.request_id, status, "SSE streaming started");

    tokio::spawn(async move {
        let events = pump_event_stream(&mut reader, chunked, &tx, start).await;
        let delay = start.elapsed().as_secs_f64();
        drop(tx);

        let request_id = captured.request_id.clone();
        let event_count = events.len();
        let persisted = tokio::task::spawn_blocking(move || {
            writer.write_sse_pair(&captured, status, &saved_headers, &events, delay)
        })
        .await;
        match persisted {
            Ok(Ok(_)) => {
                info!(%request_id, events = event_count, elapsed = %format!("{delay:.3}s"), "SSE completed");
            }
            Ok(Err(err)) => warn!(%request_id, error = %err, "failed to record SSE exchange"),
            Err(err) => warn!(%request_id, error = %err, "SSE record task failed"),
        }
    });

    response
}

async fn dial(target: &Target, tls: &TlsConnector) -> anyhow::Result<Box<dyn UpstreamIo>> {
    let tcp = tokio::time::timeout(
        DIAL_TIMEOUT,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await??;

    if target.https {
        let server_name = rustls::pki_types::ServerName::try_from(target.host.clone())?;
        let tls_stream = tls.connect(server_name, tcp).await?;
        Ok(Box::new(tls_stream))
    } else {
        Ok(Box::new(tcp))
    }
}

fn build_request_head(target: &Target, parts: &Parts, body_len: usize) -> String {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut head = String::with_capacity(256);
    head.push_str(parts.method.as_str());
    head.push(' ');
    head.push_str(path_and_query);
    head.push_str(" HTTP/1.1\r\n");
    head.push_str("Host: ");
    head.push_str(&target.authority);
    head.push_str("\r\n");

    for (name, value) in &parts.headers {
        if is_stripped_request_header(name.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if body_len > 0 {
        head.push_str(&format!("Content-Length: {body_len}\r\n"));
    }
    head.push_str("\r\n");
    head
}

/// Read an HTTP/1.1 status line and header block.
async fn read_response_head<R>(reader: &mut R) -> std::io::Result<(u16, Vec<(String, String)>)>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed status line: {line:?}"),
            )
        })?;

    let mut headers = Vec::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Ok((status, headers))
}

/// Stream the upstream body line by line: every line is relayed to the
/// client (with LF framing) and accumulated into the current event buffer; a
/// blank line closes the event and its `data: ` payloads are captured with
/// the elapsed time since the stream started.
///
/// A failed send means the client hung up; relaying stops but the upstream
/// is drained to the end so the record stays complete.
pub(crate) async fn pump_event_stream<R>(
    reader: &mut R,
    chunked: bool,
    tx: &mpsc::Sender<Bytes>,
    start: Instant,
) -> Vec<CapturedEvent>
where
    R: AsyncBufRead + Unpin,
{
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut client_gone = false;

    if chunked {
        let mut size_line = String::new();
        loop {
            size_line.clear();
            match reader.read_line(&mut size_line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let Ok(chunk_size) = usize::from_str_radix(size_line.trim(), 16) else {
                break;
            };
            if chunk_size == 0 {
                break;
            }

            let mut chunk = vec![0u8; chunk_size];
            if reader.read_exact(&mut chunk).await.is_err() {
                break;
            }
            // Trailing CRLF after the chunk payload.
            size_line.clear();
            let _ = reader.read_line(&mut size_line).await;

            let text = String::from_utf8_lossy(&chunk);
            let lines: Vec<&str> = text.split('\n').collect();
            let single = lines.len() == 1;
            for raw in lines {
                let line = raw.trim_end_matches('\r');
                if line.is_empty() && single {
                    continue;
                }
                process_line(
                    line,
                    start,
                    tx,
                    &mut current_event,
                    &mut events,
                    &mut client_gone,
                )
                .await;
            }
        }
    } else {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
            process_line(
                &trimmed,
                start,
                tx,
                &mut current_event,
                &mut events,
                &mut client_gone,
            )
            .await;
        }
    }

    events
}

async fn process_line(
    line: &str,
    start: Instant,
    tx: &mpsc::Sender<Bytes>,
    current_event: &mut String,
    events: &mut Vec<CapturedEvent>,
    client_gone: &mut bool,
) {
    let elapsed = start.elapsed().as_secs_f64();

    if !*client_gone {
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        if tx.send(Bytes::from(framed)).await.is_err() {
            *client_gone = true;
        }
    }

    current_event.push_str(line);
    current_event.push('\n');

    if line.is_empty() && current_event.len() > 1 {
        extract_data_lines(current_event, elapsed, events);
        current_event.clear();
    }
}

fn extract_data_lines(event_text: &str, elapsed: f64, events: &mut Vec<CapturedEvent>) {
    for line in event_text.trim().split('\n') {
        if let Some(payload) = line.strip_prefix("data: ") {
            let data = match serde_json::from_str::<Value>(payload) {
                Ok(json) => json,
                Err(_) => Value::String(payload.to_string()),
            };
            events.push(CapturedEvent {
                data,
                timestamp: elapsed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: mpsc::Receiver<Bytes>) -> String {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn plain_stream_tees_and_captures_events() {
        let upstream = b"data: {\"token\":\"a\"}\n\ndata: [DONE]\n\n";
        let mut reader = BufReader::new(&upstream[..]);
        let (tx, rx) = mpsc::channel(64);

        let (events, relayed) = tokio::join!(
            async {
                let events = pump_event_stream(&mut reader, false, &tx, Instant::now()).await;
                drop(tx);
                events
            },
            drain(rx)
        );

        assert_eq!(relayed, "data: {\"token\":\"a\"}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, serde_json::json!({"token": "a"}));
        assert_eq!(events[1].data, Value::String("[DONE]".to_string()));
        assert!(events[0].timestamp <= events[1].timestamp);
    }

    #[tokio::test]
    async fn chunked_stream_is_decoded_before_parsing() {
        let mut upstream = Vec::new();
        for payload in ["data: {\"i\":1}\n\n", "data: {\"i\":2}\n\n"] {
            upstream.extend_from_slice(format!("{:x}\r\n", payload.len()).as_bytes());
            upstream.extend_from_slice(payload.as_bytes());
            upstream.extend_from_slice(b"\r\n");
        }
        upstream.extend_from_slice(b"0\r\n\r\n");

        let mut reader = BufReader::new(&upstream[..]);
        let (tx, rx) = mpsc::channel(64);

        let (events, relayed) = tokio::join!(
            async {
                let events = pump_event_stream(&mut reader, true, &tx, Instant::now()).await;
                drop(tx);
                events
            },
            drain(rx)
        );

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, serde_json::json!({"i": 1}));
        assert_eq!(events[1].data, serde_json::json!({"i": 2}));
        assert!(relayed.contains("data: {\"i\":1}\n"));
        assert!(relayed.contains("data: {\"i\":2}\n"));
        // The chunked framing itself is never relayed.
        assert!(!relayed.contains("\r\n"));
    }

    #[tokio::test]
    async fn non_data_lines_are_relayed_but_not_captured() {
        let upstream = b"event: ping\ndata: \"pong\"\n\n: comment\n\n";
        let mut reader = BufReader::new(&upstream[..]);
        let (tx, rx) = mpsc::channel(64);

        let (events, relayed) = tokio::join!(
            async {
                let events = pump_event_stream(&mut reader, false, &tx, Instant::now()).await;
                drop(tx);
                events
            },
            drain(rx)
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, Value::String("pong".to_string()));
        assert!(relayed.contains("event: ping\n"));
        assert!(relayed.contains(": comment\n"));
    }

    #[tokio::test]
    async fn client_disconnect_keeps_capturing() {
        let upstream = b"data: 1\n\ndata: 2\n\ndata: 3\n\n";
        let mut reader = BufReader::new(&upstream[..]);
        let (tx, rx) = mpsc::channel(64);
        drop(rx);

        let events = pump_event_stream(&mut reader, false, &tx, Instant::now()).await;
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn reads_response_head() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\nrest";
        let mut reader = BufReader::new(&raw[..]);
        let (status, headers) = read_response_head(&mut reader).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("Content-Type".to_string(), "text/event-stream".to_string()));

        let mut rest = String::new();
        reader.read_line(&mut rest).await.unwrap();
        assert_eq!(rest, "rest");
    }

    #[tokio::test]
    async fn malformed_status_line_is_an_error() {
        let raw = b"garbage\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_response_head(&mut reader).await.is_err());
    }
}
