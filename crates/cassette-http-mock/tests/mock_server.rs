//! End-to-end tests driving the mock handler over stores loaded from disk,
//! the way the binary wires everything together.

use bytes::Bytes;
use cassette_http_mock::server::{handle, HandlerContext, MockBody, SseWriterPool, TimingConfig};
use cassette_http_mock::store::MockStore;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Request, Response, StatusCode};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn write_mock(dir: &Path, mock_id: &str, file: &str, record: serde_json::Value) {
    let mock_dir = dir.join(mock_id);
    std::fs::create_dir_all(&mock_dir).unwrap();
    std::fs::write(mock_dir.join(file), record.to_string()).unwrap();
}

fn context(store: MockStore) -> HandlerContext {
    HandlerContext {
        store: Arc::new(store),
        timing: TimingConfig::default(),
        sse_pool: Arc::new(SseWriterPool::new()),
        not_found: None,
    }
}

fn request(method: &str, path: &str, headers: &[(&str, &str)], body: &[u8]) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder
        .body(Full::new(Bytes::copy_from_slice(body)))
        .unwrap()
}

async fn json_body(response: Response<MockBody>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn user_record() -> serde_json::Value {
    json!({
        "request": {
            "request_id": "20240101120000.1",
            "method": "GET",
            "url": "http://u/users/1",
            "headers": {"Accept": "application/json"}
        },
        "response": {
            "status_code": 200,
            "headers": {"Content-Type": "application/json"},
            "body": {"id": 1, "name": "A"}
        }
    })
}

#[tokio::test]
async fn plain_lookup_from_disk() {
    let dir = TempDir::new().unwrap();
    write_mock(
        dir.path(),
        "default",
        "application_json_20240101_120000_ab12.json",
        user_record(),
    );

    let ctx = context(MockStore::load(dir.path()).unwrap());
    let response = handle(&ctx, request("GET", "/users/1", &[], b""))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(CONTENT_TYPE).unwrap(),
        "application/json"
    );
    assert_eq!(json_body(response).await, json!({"id": 1, "name": "A"}));
}

#[tokio::test]
async fn accept_any_matches_any_content_type() {
    let dir = TempDir::new().unwrap();
    let mut record = user_record();
    record["response"]["headers"]["Content-Type"] = json!("text/html");
    record["response"]["body"] = json!("<p>hi</p>");
    write_mock(dir.path(), "default", "text_html_20240101_120000_cd34.json", record);

    let ctx = context(MockStore::load(dir.path()).unwrap());

    // Exact JSON lookup misses (the record is text/html)...
    let response = handle(&ctx, request("GET", "/users/1", &[], b""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // ...but Accept: */* finds it.
    let response = handle(&ctx, request("GET", "/users/1", &[("Accept", "*/*")], b""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"<p>hi</p>");
}

#[tokio::test]
async fn mock_id_header_partitions_records() {
    let dir = TempDir::new().unwrap();
    write_mock(
        dir.path(),
        "default",
        "application_json_20240101_120000_01.json",
        user_record(),
    );
    let mut variant = user_record();
    variant["response"]["body"] = json!({"id": 1, "name": "B"});
    write_mock(
        dir.path(),
        "variant",
        "application_json_20240101_120000_02.json",
        variant,
    );

    let ctx = context(MockStore::load(dir.path()).unwrap());

    let response = handle(&ctx, request("GET", "/users/1", &[], b""))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["name"], "A");

    let response = handle(
        &ctx,
        request("GET", "/users/1", &[("x-mock-id", "variant")], b""),
    )
    .await
    .unwrap();
    assert_eq!(json_body(response).await["name"], "B");
}

#[tokio::test]
async fn scenario_routing_matches_body_predicates_in_order() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("done.json"),
        json!({
            "request": {"method": "POST", "url": "http://u/api/v1/status"},
            "response": {"status_code": 200, "headers": {}, "body": {"result": "done"}}
        })
        .to_string(),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("pending.json"),
        json!({
            "request": {"method": "POST", "url": "http://u/api/v1/status"},
            "response": {"status_code": 200, "headers": {}, "body": {"result": "pending"}}
        })
        .to_string(),
    )
    .unwrap();
    let config = dir.path().join("scenarios.yml");
    std::fs::write(
        &config,
        r#"
scenarios:
  - name: done
    path: /api/v1/status
    method: POST
    filter:
      body:
        and:
          - eq: {field: processing.state, value: done}
          - rx: {field: payload.id, value: "^[A-Z]{3}-[0-9]{4}$"}
    response:
      file: done.json
  - name: catch-all
    path: /api/v1/status
    method: POST
    response:
      file: pending.json
"#,
    )
    .unwrap();

    let mut store = MockStore::load(&dir.path().join("no-mocks")).unwrap();
    store.load_scenarios(&config).unwrap();
    let ctx = context(store);

    let response = handle(
        &ctx,
        request(
            "POST",
            "/api/v1/status",
            &[("x-mock-id", "ignored-in-scenario-mode")],
            br#"{"processing":{"state":"done"},"payload":{"id":"ABC-1234"}}"#,
        ),
    )
    .await
    .unwrap();
    assert_eq!(json_body(response).await["result"], "done");

    let response = handle(
        &ctx,
        request(
            "POST",
            "/api/v1/status",
            &[],
            br#"{"processing":{"state":"pending"}}"#,
        ),
    )
    .await
    .unwrap();
    assert_eq!(json_body(response).await["result"], "pending");

    // The list projection reports scenario identity.
    let response = handle(&ctx, request("GET", "/__mock__/list", &[], b""))
        .await
        .unwrap();
    let list = json_body(response).await;
    assert_eq!(list["total"], 2);
    assert_eq!(list["mocks"][0]["mock_id"], "done");
    assert_eq!(list["mocks"][0]["path"], "/api/v1/status");
}

#[tokio::test(start_paused = true)]
async fn sse_scenario_with_delay_override_replays_compressed_timing() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("stream.json"),
        json!({
            "request": {"method": "GET", "url": "http://u/sse-stream"},
            "response": {
                "headers": {"Content-Type": "text/event-stream"},
                "body": [
                    {"data": {"i": 1}, "timestamp": 0.1},
                    {"data": {"i": 2}, "timestamp": 0.2},
                    {"data": {"i": 3}, "timestamp": 0.3},
                    {"data": {"i": 4}, "timestamp": 0.4},
                    {"data": {"i": 5}, "timestamp": 0.5}
                ],
                "delay": 5.0
            }
        })
        .to_string(),
    )
    .unwrap();
    let config = dir.path().join("scenarios.yml");
    std::fs::write(
        &config,
        "scenarios:\n  - name: fast-stream\n    path: /sse-stream\n    method: GET\n    response:\n      file: stream.json\n      delay: 1.0\n",
    )
    .unwrap();

    let mut store = MockStore::load(&dir.path().join("no-mocks")).unwrap();
    store.load_scenarios(&config).unwrap();
    let mut ctx = context(store);
    ctx.timing = TimingConfig {
        replay_timing: true,
        jitter: 0.0,
    };

    let start = tokio::time::Instant::now();
    let response = handle(&ctx, request("GET", "/sse-stream", &[], b""))
        .await
        .unwrap();
    assert_eq!(
        response.headers().get(CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let elapsed = start.elapsed().as_secs_f64();

    // delay 5.0 -> 1.0 compresses the last event from 0.5s to 0.1s.
    assert!((elapsed - 0.1).abs() < 0.01, "elapsed {elapsed}");
    let text = std::str::from_utf8(&body).unwrap();
    assert_eq!(text.matches("data: ").count(), 5);
}
