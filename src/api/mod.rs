//! indexd REST API
//!
//! HTTP adapters over the endpoint index, built with Axum.
//!
//! # Endpoints
//!
//! ## Ingest
//! - `POST /api/index/push` - Batch of index items
//!
//! ## Query
//! - `POST /api/index/metrics` - Metric names of endpoints
//! - `POST /api/index/tagkv` - Tag catalog of metrics
//! - `POST /api/index/counter/fullmatch` - Existing counters of a tag set
//! - `POST /api/index/counter/clude` - Counters by include/exclude filters
//!
//! ## Delete
//! - `DELETE /api/index/endpoints` - Endpoints
//! - `DELETE /api/index/metrics` - Metrics of endpoints
//! - `DELETE /api/index/counter` - Tag values and their counters
//!
//! ## Snapshot
//! - `GET /api/index/dumpfile` - Write a snapshot to disk
//! - `GET /api/index/idxfile` - Download the snapshot bundle
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! # Example
//!
//! ```rust,ignore
//! use indexd::api::{serve, ApiConfig, AppState};
//! use indexd::{Config, IndexService};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = IndexService::from_config(&Config::default())?;
//!     let config = ApiConfig::default();
//!
//!     let state = AppState::new(
//!         Arc::clone(service.index()),
//!         Arc::clone(service.snapshots()),
//!         config.clone(),
//!     );
//!     state.set_ready();
//!     serve(state, &config).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::{ApiConfig, AppState};

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let max_body_size = state.config.max_body_size;

    let index_routes = Router::new()
        // Ingest
        .route("/push", post(routes::ingest::push))
        // Query and delete
        .route(
            "/metrics",
            post(routes::index::get_metrics).delete(routes::index::del_metrics),
        )
        .route("/endpoints", delete(routes::index::del_endpoints))
        .route("/counter", delete(routes::index::del_counter))
        .route("/tagkv", post(routes::index::get_tag_pairs))
        .route(
            "/counter/fullmatch",
            post(routes::index::get_counters_full_match),
        )
        .route("/counter/clude", post(routes::index::get_index_by_clude))
        // Snapshot
        .route("/dumpfile", get(routes::snapshot::dump))
        .route("/idxfile", get(routes::snapshot::download))
        .layer(DefaultBodyLimit::max(max_body_size));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    // Create shared state
    let shared_state = Arc::new(state);

    Router::new()
        .nest("/api/index", index_routes)
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(shared_state)
}

/// Start the API server
///
/// Returns once a shutdown signal has been received and in-flight
/// requests have drained.
pub async fn serve(state: AppState, config: &ApiConfig) -> Result<(), ApiError> {
    let router = build_router(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("indexd API listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("indexd API shut down gracefully");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
