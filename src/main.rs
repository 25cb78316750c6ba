//! indexd Server
//!
//! Run with: cargo run --bin indexd -- --config config.toml
//!
//! # Startup
//!
//! 1. Load configuration (file, then `INDEXD_*` environment overrides)
//! 2. Serve HTTP; `/health/ready` answers 503 until step 3 is done
//! 3. Rebuild from a peer bundle or the local snapshot, then start the
//!    cleaner, persister and reporter
//!
//! On SIGINT/SIGTERM the server drains requests, stops the background
//! tasks and writes a final snapshot.
//!
//! `RUST_LOG` overrides the configured log level.

use clap::Parser;
use indexd::api::{serve, ApiConfig, AppState};
use indexd::config::{generate_default_config, Config, LoggingConfig};
use indexd::service::IndexService;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "indexd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "In-memory index of time-series metric metadata")]
struct Args {
    /// Path to a TOML config file (default: standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print a default config file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };

    init_logging(&config.logging);

    tracing::info!("Starting indexd v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        persist_dir = %config.cache.persist_dir,
        index_peers = config.cluster.index_peers.len(),
        registry_peers = config.cluster.registry_peers.len(),
        "configuration loaded"
    );

    let service = Arc::new(IndexService::from_config(&config)?);
    let api_config = ApiConfig::from(&config.api);
    let state = AppState::new(
        Arc::clone(service.index()),
        Arc::clone(service.snapshots()),
        api_config.clone(),
    );

    // Rebuild in the background so health checks answer while loading
    let startup = {
        let service = Arc::clone(&service);
        let state = state.clone();
        tokio::spawn(async move {
            match service.rebuild().await {
                Ok(report) => tracing::info!(
                    source = ?report.source,
                    loaded = report.loaded,
                    failed = report.failed,
                    "index rebuilt"
                ),
                Err(e) => tracing::error!(error = %e, "index rebuild failed, starting empty"),
            }
            state.set_ready();
            service.start();
        })
    };

    serve(state, &api_config).await?;

    if !startup.is_finished() {
        tracing::info!("waiting for startup rebuild to finish");
    }
    if let Err(e) = startup.await {
        tracing::error!(error = %e, "startup task failed");
    }

    tracing::info!("Stopping background tasks...");
    let report = service.shutdown().await?;
    tracing::info!(
        written = report.written,
        failed = report.failed,
        "indexd stopped"
    );

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("indexd={},tower_http=info", config.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
