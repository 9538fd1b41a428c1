use cassette_http_mock::proxy::{
    build_client_tls_config, create_http_client, load_client_identity, ProxyServer,
    RecordingProxy, Target,
};
use cassette_http_mock::record::RecordWriter;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "cassette-record-proxy",
    about = "Recording reverse proxy: forwards traffic and persists every exchange"
)]
struct Args {
    /// Directory to store recorded mock files
    #[arg(long, default_value = "mocks")]
    log_dir: PathBuf,

    /// Host to bind the proxy to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the proxy to
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Target URL to proxy requests to (e.g. http://localhost:3000)
    #[arg(long)]
    target: String,

    /// Client certificate PEM for upstream mTLS
    #[arg(long, requires = "client_key")]
    client_cert: Option<PathBuf>,

    /// Client key PEM for upstream mTLS
    #[arg(long, requires = "client_cert")]
    client_key: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let target = Target::parse(&args.target)?;
    info!("recording to {}", args.log_dir.display());
    let writer = RecordWriter::new(&args.log_dir)?;

    let identity = match (&args.client_cert, &args.client_key) {
        (Some(cert), Some(key)) => {
            let identity = load_client_identity(cert, key)?;
            info!("client certificate loaded from {}", cert.display());
            Some(identity)
        }
        _ => None,
    };
    let tls_config = build_client_tls_config(identity)?;
    let client = create_http_client(tls_config.clone());

    let proxy = RecordingProxy::new(writer, client, tls_config, target);
    let server = ProxyServer::new(proxy, args.host, args.port);

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down recording proxy");
            Ok(())
        }
    }
}
