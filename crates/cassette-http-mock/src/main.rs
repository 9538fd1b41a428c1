use cassette_http_mock::record::NotFoundLogger;
use cassette_http_mock::server::{HandlerContext, MockServer, SseWriterPool, TimingConfig};
use cassette_http_mock::store::MockStore;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "cassette-mock",
    about = "High-throughput replay server for recorded HTTP traffic"
)]
struct Args {
    /// Directory containing recorded mock files, one subdirectory per mock-id
    #[arg(long, default_value = "mocks")]
    mock_dir: PathBuf,

    /// Scenario YAML; when set, scenario routing replaces header-based lookup
    #[arg(long)]
    mock_config: Option<PathBuf>,

    /// Directory for 404 request logs; empty string disables logging
    #[arg(long, default_value = "mock_log")]
    log_dir: String,

    /// Host to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Replay recorded request/response timing
    #[arg(long)]
    replay_timing: bool,

    /// Random timing jitter fraction (0.0-1.0; 0.1 = ±10%)
    #[arg(long, default_value_t = 0.0)]
    jitter: f64,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("loading mocks from {}", args.mock_dir.display());
    let mut store = MockStore::load(&args.mock_dir)?;

    if let Some(config) = &args.mock_config {
        info!("loading scenarios from {}", config.display());
        store.load_scenarios(config)?;
    } else {
        info!("scenario mode disabled, using x-mock-id header lookup");
    }

    let stats = store.stats();
    info!(
        "loaded {} responses ({} unique paths, {} unique mock ids)",
        stats.total_responses, stats.unique_paths, stats.unique_mock_ids
    );

    let timing = TimingConfig {
        replay_timing: args.replay_timing,
        jitter: args.jitter,
    };
    if timing.replay_timing {
        info!("timing replay enabled (jitter: {:.1}%)", timing.jitter * 100.0);
    } else {
        info!("timing replay disabled, responses are instant");
    }

    let not_found = if args.log_dir.is_empty() {
        None
    } else {
        match NotFoundLogger::new(&args.log_dir) {
            Ok(logger) => Some(Arc::new(logger)),
            Err(err) => {
                warn!("404 logging disabled, cannot create {}: {err}", args.log_dir);
                None
            }
        }
    };

    let ctx = HandlerContext {
        store: Arc::new(store),
        timing,
        sse_pool: Arc::new(SseWriterPool::new()),
        not_found,
    };

    info!(
        "stats endpoint: http://{}:{}/__mock__/stats",
        args.host, args.port
    );
    info!(
        "list endpoint:  http://{}:{}/__mock__/list",
        args.host, args.port
    );

    let server = MockServer::new(ctx, args.host, args.port);
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down mock server");
            Ok(())
        }
    }
}
