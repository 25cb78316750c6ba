//! Index Structures
//!
//! In-memory inverted index over time-series metadata:
//!
//! - **EndpointIndexMap**: endpoint → per-endpoint metric map
//! - **MetricIndexMap**: metric name → step, dstype, tag catalog, counters
//! - **TagkvIndex**: tag key → observed values, each with a last-seen time
//! - **CounterIndex**: full tag combinations (counters) with a last-seen time
//!
//! # Architecture
//!
//! ```text
//! Query: "counters of cpu.idle on h1 with core=1"
//!        ↓
//! EndpointIndexMap: h1 → MetricIndexMap
//!        ↓
//! MetricIndexMap: cpu.idle → MetricIndex
//!        ↓
//! TagkvIndex: core=[0,1] host=[h1] → filter → expand
//!        ↓
//! ["core=1,host=h1"]
//! ```
//!
//! Every level carries its own lock; see [`metric_map`] for the ordering.

pub mod clude;
mod counter;
mod endpoint_map;
mod error;
pub mod metric_map;
mod queue;
mod tagkv;

pub use counter::{counter_key, CounterIndex, CounterMap};
pub use endpoint_map::EndpointIndexMap;
pub use error::{IndexError, IndexResult};
pub use metric_map::{
    EndpointSnapshot, MetricIndex, MetricIndexMap, MetricMeta, MetricSnapshot, PushOutcome,
};
pub use queue::{NewEndpointQueue, DEFAULT_QUEUE_CAPACITY};
pub use tagkv::{TagkvIndex, TagkvMap};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::AddAssign;

/// Default cap on the number of counters a clude query may expand to
pub const DEFAULT_MAX_QUERY_COUNT: usize = 100_000;

/// One observation of a series, as reported by a collector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexItem {
    pub endpoint: String,
    pub metric: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub step: i64,
    #[serde(default, rename = "dstype")]
    pub ds_type: String,
}

impl IndexItem {
    /// Create an item without tags
    pub fn new(endpoint: impl Into<String>, metric: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            metric: metric.into(),
            ..Default::default()
        }
    }

    /// Add a single tag (builder pattern)
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add several tags (builder pattern)
    pub fn tags<I, K, V>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.tags
            .extend(tags.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn step(mut self, step: i64) -> Self {
        self.step = step;
        self
    }

    pub fn ds_type(mut self, ds_type: impl Into<String>) -> Self {
        self.ds_type = ds_type.into();
        self
    }

    /// Canonical counter of this item's tags
    pub fn counter(&self) -> String {
        counter_key(&self.tags)
    }

    /// Endpoint and metric must both be present
    pub fn is_valid(&self) -> bool {
        !self.endpoint.is_empty() && !self.metric.is_empty()
    }
}

/// A tag key with a list of values, used by include/exclude filters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPair {
    #[serde(rename = "tagk", alias = "key")]
    pub key: String,
    #[serde(rename = "tagv", alias = "values", default)]
    pub values: Vec<String>,
}

impl TagPair {
    pub fn new<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Entries removed by a freshness sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanStats {
    pub endpoints: usize,
    pub metrics: usize,
    pub counters: usize,
    pub tag_values: usize,
}

impl AddAssign for CleanStats {
    fn add_assign(&mut self, other: Self) {
        self.endpoints += other.endpoints;
        self.metrics += other.metrics;
        self.counters += other.counters;
        self.tag_values += other.tag_values;
    }
}

/// Size of the index at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Number of endpoints
    pub endpoints: usize,
    /// Number of (endpoint, metric) pairs
    pub metrics: usize,
    /// Number of counters across all metrics
    pub counters: usize,
    /// Number of distinct tag values across all metrics
    pub tag_values: usize,
    /// Endpoints waiting to be registered
    pub pending_reports: usize,
}
