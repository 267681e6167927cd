use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use ride_map::{HazardStore, JsonlStore, MemoryStore, PipelineConfig, SessionAggregator};
use tracing_subscriber::EnvFilter;

mod api;

use api::{router, AppState, APP_COMMIT, APP_VERSION};

#[derive(Parser, Debug)]
#[command(author, version, about = "Ride comfort ingestion and query server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "RIDE_MAP_ADDR", default_value = "0.0.0.0:3000")]
    addr: SocketAddr,
    /// Directory for persisted points and samples; in-memory when omitted
    #[arg(long, env = "RIDE_MAP_STORAGE")]
    storage: Option<PathBuf>,
    /// Pipeline configuration (JSON)
    #[arg(long, env = "RIDE_MAP_CONFIG")]
    config: Option<PathBuf>,
    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let config = PipelineConfig::load_or_default(args.config.as_deref())
        .context("failed to load configuration")?;

    let store: Arc<dyn HazardStore> = match &args.storage {
        Some(dir) => Arc::new(
            JsonlStore::open(dir)
                .with_context(|| format!("failed to open store at {}", dir.display()))?,
        ),
        None => {
            tracing::warn!("no --storage given; points are kept in memory only");
            Arc::new(MemoryStore::default())
        }
    };

    let aggregator =
        SessionAggregator::new(config.window).context("invalid window configuration")?;
    let state = Arc::new(AppState {
        aggregator,
        store,
        bands: config.bands,
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    tracing::info!(
        addr = %args.addr,
        version = APP_VERSION,
        commit = APP_COMMIT,
        "ride map server listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "cannot listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("server error")?;
    tracing::info!("server stopped");
    Ok(())
}
