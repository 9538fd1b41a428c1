//! The mock HTTP server: accept loop and per-connection serving.

pub mod handler;
pub mod sse;
pub mod timing;

pub use handler::{channel_body, full_body, handle, HandlerContext, MockBody};
pub use sse::{SseStreamWriter, SseWriterPool};
pub use timing::TimingConfig;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// The mock server: binds, accepts, and spawns one task per connection.
/// All shared state lives in the [`HandlerContext`] and is read-only after
/// startup, so connections need no synchronization on the lookup path.
pub struct MockServer {
    ctx: Arc<HandlerContext>,
    host: String,
    port: u16,
}

impl MockServer {
    pub fn new(ctx: HandlerContext, host: impl Into<String>, port: u16) -> Self {
        Self {
            ctx: Arc::new(ctx),
            host: host.into(),
            port,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        info!("mock server listening on http://{}:{}", self.host, self.port);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let ctx = Arc::clone(&self.ctx);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let ctx = Arc::clone(&ctx);
                    async move { handler::handle(&ctx, req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("error serving connection from {}: {}", remote_addr, err);
                }
            });
        }
    }
}
