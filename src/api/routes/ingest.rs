//! Ingest Routes
//!
//! - POST /api/index/push - Batch of index items

use axum::{extract::State, Json};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

use crate::api::dto::PushResponse;
use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::index::IndexItem;

/// POST /api/index/push
///
/// Index a batch of items. Every item shares the timestamp captured at
/// receipt. Items without an endpoint or metric are counted and skipped.
pub async fn push(
    State(state): State<Arc<AppState>>,
    Json(items): Json<Vec<IndexItem>>,
) -> ApiResult<Json<PushResponse>> {
    let start = Instant::now();
    let now = Utc::now().timestamp();

    let mut invalid = 0;
    for item in &items {
        if !item.is_valid() {
            invalid += 1;
            continue;
        }
        state.index.push(item, now);
    }

    let latency_ms = start.elapsed().as_millis() as u64;
    tracing::debug!(total = items.len(), invalid, latency_ms, "index push");

    Ok(Json(PushResponse {
        total: items.len(),
        invalid,
        latency_ms,
    }))
}
