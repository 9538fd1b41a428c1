//! The recording reverse proxy.

mod client;
mod handler;
mod sse;
mod tls;

pub use client::{create_http_client, UpstreamClient};
pub use handler::{RecordingProxy, Target};
pub use tls::{build_client_tls_config, load_client_identity, NoVerifier};

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Accept loop for the recording proxy: one task per connection, all
/// forwarding state shared read-only through the [`RecordingProxy`].
pub struct ProxyServer {
    proxy: Arc<RecordingProxy>,
    host: String,
    port: u16,
}

impl ProxyServer {
    pub fn new(proxy: RecordingProxy, host: impl Into<String>, port: u16) -> Self {
        Self {
            proxy: Arc::new(proxy),
            host: host.into(),
            port,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        info!(
            "recording proxy listening on http://{}:{} -> {}",
            self.host,
            self.port,
            self.proxy.target().origin
        );

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let proxy = Arc::clone(&self.proxy);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let proxy = Arc::clone(&proxy);
                    async move { proxy.handle(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("error serving connection from {}: {}", remote_addr, err);
                }
            });
        }
    }
}
