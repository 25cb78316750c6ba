//! Data Transfer Objects
//!
//! Request and response types for the API endpoints.
//! These types are serialized/deserialized to/from JSON.

use serde::{Deserialize, Serialize};

use crate::index::{IndexStats, TagPair};

// ============================================
// INGEST DTOs
// ============================================

/// Batch ingest response
#[derive(Debug, Serialize, Deserialize)]
pub struct PushResponse {
    /// Items in the request
    pub total: usize,
    /// Items rejected for an empty endpoint or metric
    pub invalid: usize,
    /// Time from receipt to completion
    pub latency_ms: u64,
}

// ============================================
// QUERY DTOs
// ============================================

/// Request naming a set of endpoints
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EndpointsRequest {
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Metric names known for a set of endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub metrics: Vec<String>,
}

/// Request naming endpoints and metrics
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EndpointMetricsRequest {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
}

/// Tag catalog of one metric across endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct TagkvResponse {
    pub endpoints: Vec<String>,
    pub metric: String,
    pub tagkv: Vec<TagPair>,
}

/// One metric on several endpoints with a tag specification
///
/// Used by full-match queries and counter deletion.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CounterRequest {
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub metric: String,
    #[serde(default)]
    pub tagkv: Vec<TagPair>,
}

/// Counters of one full-match request entry
#[derive(Debug, Serialize, Deserialize)]
pub struct FullMatchItem {
    /// Endpoints on which the metric exists
    pub endpoints: Vec<String>,
    pub metric: String,
    pub tags: Vec<String>,
    pub step: i64,
    pub dstype: String,
}

/// Full-match response
#[derive(Debug, Serialize, Deserialize)]
pub struct FullMatchResponse {
    pub list: Vec<FullMatchItem>,
    /// Matched counters across all entries and endpoints
    pub count: usize,
}

/// Include/exclude query for one metric on several endpoints
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CludeRequest {
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub metric: String,
    #[serde(default)]
    pub include: Vec<TagPair>,
    #[serde(default)]
    pub exclude: Vec<TagPair>,
}

/// Counters of one (endpoint, metric)
#[derive(Debug, Serialize, Deserialize)]
pub struct CludeItem {
    pub endpoint: String,
    pub metric: String,
    pub tags: Vec<String>,
    pub step: i64,
    pub dstype: String,
}

// ============================================
// MUTATION / SNAPSHOT DTOs
// ============================================

/// Outcome of a delete
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    /// Status: "ok"
    pub status: String,
    /// Entries removed
    pub removed: usize,
}

impl DeleteResponse {
    pub fn ok(removed: usize) -> Self {
        Self {
            status: "ok".to_string(),
            removed,
        }
    }
}

/// Outcome of a triggered snapshot
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub status: String,
    pub mode: String,
    pub written: usize,
    pub failed: usize,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status: healthy, starting
    pub status: String,
    /// Index has finished loading its snapshot
    pub ready: bool,
    /// Current size of the index
    pub index: IndexStats,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// Application version
    pub version: String,
}
