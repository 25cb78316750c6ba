//! Metric Index Map - everything known about one endpoint
//!
//! Maps metric name → [`MetricIndex`] (step, dstype, last seen, tag catalog,
//! counters) and carries the endpoint's `reported` flag.
//!
//! # Locking
//! ```text
//! MetricIndexMap lock  → metric name map + reported flag
//!   MetricIndex meta   → step / dstype / last seen
//!   TagkvIndex lock    → tag catalog of one metric
//!   CounterIndex lock  → counters of one metric
//! ```
//! Locks are only ever taken top-down and never held across an await.
//!
//! # Persistence
//! The whole map serializes to a single JSON document (one file per
//! endpoint in a snapshot directory).

use crate::index::counter::{CounterIndex, CounterMap};
use crate::index::error::{IndexError, IndexResult};
use crate::index::tagkv::{TagkvIndex, TagkvMap};
use crate::index::{CleanStats, IndexItem};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const SNAPSHOT_VERSION: u32 = 1;

/// Step, dstype and last-seen of one metric
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricMeta {
    pub step: i64,
    pub ds_type: String,
    pub ts: i64,
}

/// Index entry for one (endpoint, metric) pair
#[derive(Debug)]
pub struct MetricIndex {
    meta: RwLock<MetricMeta>,
    tagkv: TagkvIndex,
    counters: CounterIndex,
}

impl MetricIndex {
    /// Create an entry from its first observation
    pub fn new(item: &IndexItem, counter: &str, now: i64) -> Self {
        let index = Self {
            meta: RwLock::new(MetricMeta {
                step: item.step,
                ds_type: item.ds_type.clone(),
                ts: now,
            }),
            tagkv: TagkvIndex::new(),
            counters: CounterIndex::new(),
        };

        index.tagkv.set_tags(&item.tags, now);
        index.counters.set(counter, now);
        index
    }

    /// Merge a further observation
    ///
    /// Step and dstype follow the most recent observation; an observation
    /// older than the stored one only contributes its tags and counter.
    pub fn update(&self, item: &IndexItem, counter: &str, now: i64) {
        {
            let mut meta = self.meta.write();
            if now >= meta.ts {
                meta.step = item.step;
                if meta.ds_type != item.ds_type {
                    meta.ds_type = item.ds_type.clone();
                }
                meta.ts = now;
            }
        }

        self.tagkv.set_tags(&item.tags, now);
        self.counters.set(counter, now);
    }

    /// Fold another entry for the same metric into this one
    pub fn absorb(&self, other: &MetricIndex) {
        let theirs = other.meta();
        {
            let mut meta = self.meta.write();
            if theirs.ts > meta.ts {
                *meta = theirs;
            }
        }
        self.tagkv.merge_map(other.tagkv.to_map());
        self.counters.merge_map(other.counters.to_map());
    }

    pub fn meta(&self) -> MetricMeta {
        self.meta.read().clone()
    }

    pub fn step(&self) -> i64 {
        self.meta.read().step
    }

    pub fn ds_type(&self) -> String {
        self.meta.read().ds_type.clone()
    }

    pub fn last_seen(&self) -> i64 {
        self.meta.read().ts
    }

    pub fn tagkv(&self) -> &TagkvIndex {
        &self.tagkv
    }

    pub fn counters(&self) -> &CounterIndex {
        &self.counters
    }

    /// Whether the whole metric is older than the freshness window
    pub fn is_stale(&self, now: i64, max_age: i64) -> bool {
        now - self.last_seen() > max_age
    }

    /// Remove a tag value and every counter carrying it
    pub fn del_tag(&self, key: &str, value: &str) -> usize {
        self.tagkv.del_tag(key, value);
        self.counters.remove_with_tag(key, value)
    }

    fn to_snapshot(&self) -> MetricSnapshot {
        let meta = self.meta();
        MetricSnapshot {
            step: meta.step,
            ds_type: meta.ds_type,
            ts: meta.ts,
            tagkv: self.tagkv.to_map(),
            counters: self.counters.to_map(),
        }
    }

    fn from_snapshot(snapshot: MetricSnapshot) -> Self {
        Self {
            meta: RwLock::new(MetricMeta {
                step: snapshot.step,
                ds_type: snapshot.ds_type,
                ts: snapshot.ts,
            }),
            tagkv: TagkvIndex::from_map(snapshot.tagkv),
            counters: CounterIndex::from_map(snapshot.counters),
        }
    }
}

/// Persisted form of one metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub step: i64,
    #[serde(rename = "dstype")]
    pub ds_type: String,
    pub ts: i64,
    #[serde(default)]
    pub tagkv: TagkvMap,
    #[serde(default)]
    pub counters: CounterMap,
}

/// Persisted form of one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub reported: bool,
    #[serde(default)]
    pub metrics: HashMap<String, MetricSnapshot>,
}

#[derive(Debug, Default)]
struct MetricMapState {
    metrics: HashMap<String, Arc<MetricIndex>>,
    reported: bool,
}

/// All metrics of one endpoint
#[derive(Debug, Default)]
pub struct MetricIndexMap {
    state: RwLock<MetricMapState>,
}

/// Result of [`MetricIndexMap::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// A new metric entry was installed
    Created,
    /// An existing metric entry was refreshed
    Updated,
}

impl MetricIndexMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a map holding the first observation of an endpoint
    pub fn with_item(item: &IndexItem, counter: &str, now: i64) -> Self {
        let map = Self::new();
        map.state.write().metrics.insert(
            item.metric.clone(),
            Arc::new(MetricIndex::new(item, counter, now)),
        );
        map
    }

    /// Create-or-merge one observation
    ///
    /// The map lock is held across the update so a sweep cannot remove
    /// the entry between lookup and refresh.
    pub fn push(&self, item: &IndexItem, counter: &str, now: i64) -> PushOutcome {
        {
            let state = self.state.read();
            if let Some(metric) = state.metrics.get(&item.metric) {
                metric.update(item, counter, now);
                return PushOutcome::Updated;
            }
        }

        let mut state = self.state.write();
        match state.metrics.get(&item.metric) {
            // lost the race to another writer
            Some(metric) => {
                metric.update(item, counter, now);
                PushOutcome::Updated
            }
            None => {
                state.metrics.insert(
                    item.metric.clone(),
                    Arc::new(MetricIndex::new(item, counter, now)),
                );
                PushOutcome::Created
            }
        }
    }

    pub fn get_metric(&self, metric: &str) -> Option<Arc<MetricIndex>> {
        self.state.read().metrics.get(metric).cloned()
    }

    pub fn get_metrics(&self) -> Vec<String> {
        self.state.read().metrics.keys().cloned().collect()
    }

    pub fn del_metric(&self, metric: &str) -> bool {
        self.state.write().metrics.remove(metric).is_some()
    }

    pub fn is_reported(&self) -> bool {
        self.state.read().reported
    }

    pub fn set_reported(&self, reported: bool) {
        self.state.write().reported = reported;
    }

    pub fn len(&self) -> usize {
        self.state.read().metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().metrics.is_empty()
    }

    /// Fold a rebuilt map into this one
    ///
    /// Used when a push created the endpoint before its snapshot file was
    /// installed. The reported flag is kept if either side has it.
    pub fn merge(&self, other: MetricIndexMap) {
        let theirs = other.state.into_inner();
        let mut state = self.state.write();

        state.reported |= theirs.reported;
        for (name, metric) in theirs.metrics {
            match state.metrics.get(&name) {
                Some(existing) => existing.absorb(&metric),
                None => {
                    state.metrics.insert(name, metric);
                }
            }
        }
    }

    /// Sweep every metric of this endpoint
    ///
    /// Stale metrics are removed outright; fresh ones have their tag values
    /// and counters swept. Leaf sweeps run without the map's write lock.
    pub fn clean(&self, now: i64, max_age: i64) -> CleanStats {
        let mut stats = CleanStats::default();
        let metrics: Vec<(String, Arc<MetricIndex>)> = self
            .state
            .read()
            .metrics
            .iter()
            .map(|(name, metric)| (name.clone(), Arc::clone(metric)))
            .collect();

        let mut stale = Vec::new();
        for (name, metric) in metrics {
            if metric.is_stale(now, max_age) {
                stale.push(name);
            } else {
                stats.tag_values += metric.tagkv.clean(now, max_age);
                stats.counters += metric.counters.clean(now, max_age);
            }
        }

        if !stale.is_empty() {
            let mut state = self.state.write();
            for name in stale {
                // a push may have refreshed it since the read pass
                let still_stale = state
                    .metrics
                    .get(&name)
                    .map(|m| m.is_stale(now, max_age))
                    .unwrap_or(false);
                if still_stale {
                    state.metrics.remove(&name);
                    stats.metrics += 1;
                }
            }
        }

        stats
    }

    /// (metrics, counters, tag values) held by this endpoint
    pub fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.read();
        let counters = state.metrics.values().map(|m| m.counters.len()).sum();
        let tag_values = state.metrics.values().map(|m| m.tagkv.value_count()).sum();
        (state.metrics.len(), counters, tag_values)
    }

    pub fn to_snapshot(&self) -> EndpointSnapshot {
        let state = self.state.read();
        EndpointSnapshot {
            version: SNAPSHOT_VERSION,
            reported: state.reported,
            metrics: state
                .metrics
                .iter()
                .map(|(name, metric)| (name.clone(), metric.to_snapshot()))
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: EndpointSnapshot) -> Self {
        let metrics = snapshot
            .metrics
            .into_iter()
            .map(|(name, metric)| (name, Arc::new(MetricIndex::from_snapshot(metric))))
            .collect();

        Self {
            state: RwLock::new(MetricMapState {
                metrics,
                reported: snapshot.reported,
            }),
        }
    }

    /// Serialize to the on-disk representation
    pub fn encode(&self) -> IndexResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_snapshot())?)
    }

    /// Deserialize from the on-disk representation
    pub fn decode(bytes: &[u8]) -> IndexResult<Self> {
        let snapshot: EndpointSnapshot = serde_json::from_slice(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(IndexError::Serialization(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(Self::from_snapshot(snapshot))
    }
}
