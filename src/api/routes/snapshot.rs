//! Snapshot Routes
//!
//! - GET /api/index/dumpfile - Write a normal snapshot to disk
//! - GET /api/index/idxfile - Write a snapshot and return it as a tar.gz bundle
//!
//! Both answer 409 when another snapshot holds the gate.

use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use crate::api::dto::SnapshotResponse;
use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::persist::{SnapshotMode, ARCHIVE_FILE};

/// GET /api/index/dumpfile
pub async fn dump(State(state): State<Arc<AppState>>) -> ApiResult<Json<SnapshotResponse>> {
    let report = state.snapshots.snapshot(SnapshotMode::Normal).await?;

    Ok(Json(SnapshotResponse {
        status: "ok".to_string(),
        mode: report.mode.to_string(),
        written: report.written,
        failed: report.failed,
    }))
}

/// GET /api/index/idxfile
///
/// Used by peers rebuilding their index on startup. The bundle is
/// streamed from disk; a later snapshot replaces the file by rename, so
/// an open stream keeps reading the bundle it started with.
pub async fn download(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let report = state.snapshots.snapshot(SnapshotMode::Download).await?;
    let path = report
        .archive
        .unwrap_or_else(|| state.snapshots.archive_path());

    let file = tokio::fs::File::open(&path).await?;
    let size = file.metadata().await?.len();
    tracing::info!(
        written = report.written,
        size_bytes = size,
        "serving index bundle"
    );

    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", ARCHIVE_FILE),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
