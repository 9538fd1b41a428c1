//! Timed SSE replay.
//!
//! One writer per in-flight SSE request, drawn from a shared pool to
//! amortize allocation. The writer emits each recorded event at its
//! jitter-scaled offset from the moment streaming begins, not from request
//! arrival, which keeps timekeeping out of the request handler.

use crate::record::MockResponse;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

static DATA_PREFIX: Bytes = Bytes::from_static(b"data: ");
static DATA_SUFFIX: Bytes = Bytes::from_static(b"\n\n");

/// Writers kept around after release; beyond this they are dropped.
const MAX_POOLED_WRITERS: usize = 64;

/// Streams the events of one record with timing fidelity.
#[derive(Debug, Default)]
pub struct SseStreamWriter {
    record: Option<Arc<MockResponse>>,
    jitter_scale: f64,
}

impl SseStreamWriter {
    /// Arm the writer for one request. `jitter_scale` is computed once per
    /// request by the handler; event timestamps are already delay-scaled in
    /// the record.
    pub fn prepare(&mut self, record: Arc<MockResponse>, jitter_scale: f64) {
        self.record = Some(record);
        self.jitter_scale = jitter_scale;
    }

    /// Emit every event in order, sleeping until each one's target offset.
    /// A failed send means the client disconnected; streaming stops but the
    /// writer still returns to the pool via [`SseWriterPool::release`].
    pub async fn stream_to(&mut self, tx: &mpsc::Sender<Bytes>) {
        let Some(record) = self.record.take() else {
            return;
        };
        let start = tokio::time::Instant::now();

        for event in &record.sse_events {
            let offset = event.timestamp * self.jitter_scale;
            if offset.is_finite() && offset > 0.0 {
                tokio::time::sleep_until(start + Duration::from_secs_f64(offset)).await;
            }
            if tx.send(DATA_PREFIX.clone()).await.is_err() {
                return;
            }
            if tx.send(event.serialized.clone()).await.is_err() {
                return;
            }
            if tx.send(DATA_SUFFIX.clone()).await.is_err() {
                return;
            }
        }
    }

    fn reset(&mut self) {
        self.record = None;
        self.jitter_scale = 0.0;
    }
}

/// Concurrent acquire/release pool of [`SseStreamWriter`]s. Writers are never
/// shared while in use; the pool only amortizes allocation across requests.
#[derive(Debug, Default)]
pub struct SseWriterPool {
    writers: Mutex<Vec<SseStreamWriter>>,
}

impl SseWriterPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> SseStreamWriter {
        self.writers.lock().pop().unwrap_or_default()
    }

    pub fn release(&self, mut writer: SseStreamWriter) {
        writer.reset();
        let mut writers = self.writers.lock();
        if writers.len() < MAX_POOLED_WRITERS {
            writers.push(writer);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.writers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::parse_record;
    use serde_json::json;

    fn sse_record(timestamps: &[f64]) -> Arc<MockResponse> {
        let events: Vec<_> = timestamps
            .iter()
            .enumerate()
            .map(|(i, ts)| json!({"data": {"i": i}, "timestamp": ts}))
            .collect();
        Arc::new(
            parse_record(
                json!({
                    "request": {"method": "GET", "url": "http://u/stream"},
                    "response": {
                        "headers": {"Content-Type": "text/event-stream"},
                        "body": events,
                        "delay": timestamps.last().copied().unwrap_or(0.0)
                    }
                })
                .to_string()
                .as_bytes(),
                "default",
            )
            .unwrap(),
        )
    }

    async fn drain(mut rx: mpsc::Receiver<Bytes>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn emits_events_at_scaled_offsets() {
        let record = sse_record(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        let (tx, rx) = mpsc::channel(32);
        let mut writer = SseStreamWriter::default();
        writer.prepare(Arc::clone(&record), 1.0);

        let start = tokio::time::Instant::now();
        let handle = tokio::spawn(async move {
            writer.stream_to(&tx).await;
        });
        let body = drain(rx).await;
        handle.await.unwrap();

        let elapsed = start.elapsed().as_secs_f64();
        assert!((elapsed - 0.5).abs() < 0.01, "elapsed {elapsed}");

        let text = String::from_utf8(body).unwrap();
        assert_eq!(text.matches("data: ").count(), 5);
        assert!(text.starts_with("data: {\"i\":0}\n\n"));
        assert!(text.ends_with("data: {\"i\":4}\n\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_scale_stretches_the_stream() {
        let record = sse_record(&[0.1, 0.2]);
        let (tx, rx) = mpsc::channel(32);
        let mut writer = SseStreamWriter::default();
        writer.prepare(record, 1.5);

        let start = tokio::time::Instant::now();
        let handle = tokio::spawn(async move { writer.stream_to(&tx).await });
        drain(rx).await;
        handle.await.unwrap();

        let elapsed = start.elapsed().as_secs_f64();
        assert!((elapsed - 0.3).abs() < 0.01, "elapsed {elapsed}");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_scale_emits_everything_immediately() {
        let record = sse_record(&[1.0, 2.0, 3.0]);
        let (tx, rx) = mpsc::channel(32);
        let mut writer = SseStreamWriter::default();
        writer.prepare(record, 0.0);

        let start = tokio::time::Instant::now();
        let handle = tokio::spawn(async move { writer.stream_to(&tx).await });
        let body = drain(rx).await;
        handle.await.unwrap();

        assert!(start.elapsed().as_secs_f64() < 0.01);
        assert_eq!(String::from_utf8(body).unwrap().matches("data: ").count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn client_disconnect_stops_streaming() {
        let record = sse_record(&[0.0, 10.0]);
        let (tx, mut rx) = mpsc::channel(32);
        let mut writer = SseStreamWriter::default();
        writer.prepare(record, 1.0);

        let handle = tokio::spawn(async move { writer.stream_to(&tx).await });
        // Read the first event, then hang up.
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        drop(rx);
        // The writer must observe the failed send and finish early.
        handle.await.unwrap();
    }

    #[test]
    fn pool_reuses_writers_up_to_capacity() {
        let pool = SseWriterPool::new();
        let writer = pool.acquire();
        assert_eq!(pool.pooled(), 0);
        pool.release(writer);
        assert_eq!(pool.pooled(), 1);
        let _again = pool.acquire();
        assert_eq!(pool.pooled(), 0);
    }
}
