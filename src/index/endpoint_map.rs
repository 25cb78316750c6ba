//! Endpoint Index - process-wide root of the index
//!
//! Maps endpoint → [`MetricIndexMap`]. Creating an endpoint publishes its
//! name on the [`NewEndpointQueue`] once the first metric is in place, so
//! the registration loop never sees a half-built entry.
//!
//! # Example
//! ```ignore
//! let index = EndpointIndexMap::new(100_000);
//! index.push(&IndexItem::new("h1", "cpu.idle").tag("core", "0"), now);
//!
//! let metrics = index.get_metrics_by("h1");        // ["cpu.idle"]
//! let counters = index.get_index_by_clude("h1", "cpu.idle", &[], &[])?;
//! ```

use crate::index::clude::{expand, filter_tagkv, product_size};
use crate::index::error::{IndexError, IndexResult};
use crate::index::metric_map::{MetricIndex, MetricIndexMap};
use crate::index::queue::NewEndpointQueue;
use crate::index::{CleanStats, IndexItem, IndexStats, TagPair};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Endpoint → metrics of that endpoint
#[derive(Debug)]
pub struct EndpointIndexMap {
    endpoints: RwLock<HashMap<String, Arc<MetricIndexMap>>>,
    new_endpoints: Arc<NewEndpointQueue>,
    max_query_count: usize,
}

impl EndpointIndexMap {
    /// Create an empty index with its own new-endpoint queue
    pub fn new(max_query_count: usize) -> Self {
        Self::with_queue(Arc::new(NewEndpointQueue::default()), max_query_count)
    }

    /// Create an empty index publishing to an existing queue
    pub fn with_queue(new_endpoints: Arc<NewEndpointQueue>, max_query_count: usize) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            new_endpoints,
            max_query_count,
        }
    }

    /// Upsert one observation
    ///
    /// The outer lock stays held while the endpoint's map is updated, so a
    /// sweep cannot drop an endpoint that a push is refreshing.
    pub fn push(&self, item: &IndexItem, now: i64) {
        let counter = item.counter();

        {
            let endpoints = self.endpoints.read();
            if let Some(metrics) = endpoints.get(&item.endpoint) {
                metrics.push(item, &counter, now);
                return;
            }
        }

        let mut endpoints = self.endpoints.write();
        if let Some(metrics) = endpoints.get(&item.endpoint) {
            // lost the race to another writer
            metrics.push(item, &counter, now);
            return;
        }
        endpoints.insert(
            item.endpoint.clone(),
            Arc::new(MetricIndexMap::with_item(item, &counter, now)),
        );
        drop(endpoints);

        self.new_endpoints.push_front(item.endpoint.as_str());
    }

    pub fn get_metric_index_map(&self, endpoint: &str) -> Option<Arc<MetricIndexMap>> {
        self.endpoints.read().get(endpoint).cloned()
    }

    /// Metric names known for `endpoint`, empty when unknown
    pub fn get_metrics_by(&self, endpoint: &str) -> Vec<String> {
        match self.get_metric_index_map(endpoint) {
            Some(metrics) => metrics.get_metrics(),
            None => Vec::new(),
        }
    }

    pub fn get_metric_index(&self, endpoint: &str, metric: &str) -> Option<Arc<MetricIndex>> {
        self.get_metric_index_map(endpoint)
            .and_then(|metrics| metrics.get_metric(metric))
    }

    /// Like [`get_metric_index`](Self::get_metric_index) but absence is an error
    pub fn metric_index(&self, endpoint: &str, metric: &str) -> IndexResult<Arc<MetricIndex>> {
        self.get_metric_index(endpoint, metric)
            .ok_or_else(|| IndexError::NotFound {
                endpoint: endpoint.to_string(),
                metric: metric.to_string(),
            })
    }

    /// Counters of (endpoint, metric) matching the include/exclude filters
    ///
    /// Counters are produced by expanding the filtered tag catalog, keys
    /// ascending. An unknown endpoint or metric yields an empty list.
    pub fn get_index_by_clude(
        &self,
        endpoint: &str,
        metric: &str,
        include: &[TagPair],
        exclude: &[TagPair],
    ) -> IndexResult<Vec<String>> {
        let Some(index) = self.get_metric_index(endpoint, metric) else {
            debug!(endpoint, metric, "clude query on unknown metric");
            return Ok(Vec::new());
        };

        let tagkv = index.tagkv().get_tagkv_map();
        let Some(tags) = filter_tagkv(&tagkv, include, exclude) else {
            return Ok(Vec::new());
        };

        let count = product_size(&tags);
        if count > self.max_query_count as u128 {
            return Err(IndexError::ResultTooLarge {
                endpoint: endpoint.to_string(),
                metric: metric.to_string(),
                include: describe(include),
                exclude: describe(exclude),
                count,
                limit: self.max_query_count,
            });
        }

        Ok(expand(&tags))
    }

    /// Remove an endpoint and everything under it
    pub fn del_by_endpoint(&self, endpoint: &str) -> bool {
        self.endpoints.write().remove(endpoint).is_some()
    }

    /// Remove the named metrics of one endpoint; returns how many existed
    ///
    /// The endpoint itself stays, even if left empty, until the next sweep.
    pub fn del_metrics<S: AsRef<str>>(&self, endpoint: &str, metrics: &[S]) -> usize {
        let Some(map) = self.get_metric_index_map(endpoint) else {
            return 0;
        };
        metrics
            .iter()
            .filter(|metric| map.del_metric(metric.as_ref()))
            .count()
    }

    /// Remove tag values of one metric and every counter carrying them
    ///
    /// Returns the number of counters removed.
    pub fn del_tags(&self, endpoint: &str, metric: &str, tags: &[TagPair]) -> usize {
        let Some(index) = self.get_metric_index(endpoint, metric) else {
            return 0;
        };

        let mut removed = 0;
        for pair in tags {
            for value in &pair.values {
                removed += index.del_tag(&pair.key, value);
            }
        }
        removed
    }

    /// Snapshot of endpoint names (order unspecified)
    pub fn get_endpoints(&self) -> Vec<String> {
        self.endpoints.read().keys().cloned().collect()
    }

    /// Set the reported flag; returns false when the endpoint is gone
    pub fn set_reported(&self, endpoint: &str, reported: bool) -> bool {
        match self.get_metric_index_map(endpoint) {
            Some(metrics) => {
                metrics.set_reported(reported);
                true
            }
            None => false,
        }
    }

    /// Install a rebuilt endpoint entry
    ///
    /// An unreported entry is queued for registration first. If a push
    /// already created the endpoint, the rebuilt state is merged into it.
    pub fn install(&self, endpoint: &str, metrics: MetricIndexMap) {
        if !metrics.is_reported() {
            self.new_endpoints.push_front(endpoint);
        }

        let mut endpoints = self.endpoints.write();
        match endpoints.get(endpoint) {
            Some(existing) => existing.merge(metrics),
            None => {
                endpoints.insert(endpoint.to_string(), Arc::new(metrics));
            }
        }
    }

    /// Freshness sweep at the current wall-clock time
    pub fn clean(&self, max_age: i64) -> CleanStats {
        let start = Instant::now();
        let stats = self.clean_at(chrono::Utc::now().timestamp(), max_age);

        info!(
            endpoints = stats.endpoints,
            metrics = stats.metrics,
            counters = stats.counters,
            tag_values = stats.tag_values,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "index sweep finished"
        );
        stats
    }

    /// Freshness sweep at `now`
    ///
    /// Endpoints left without metrics are removed under the outer write
    /// lock after re-checking that no push refilled them.
    pub fn clean_at(&self, now: i64, max_age: i64) -> CleanStats {
        let mut stats = CleanStats::default();
        let endpoints: Vec<(String, Arc<MetricIndexMap>)> = self
            .endpoints
            .read()
            .iter()
            .map(|(name, metrics)| (name.clone(), Arc::clone(metrics)))
            .collect();

        let mut emptied = Vec::new();
        for (name, metrics) in endpoints {
            stats += metrics.clean(now, max_age);
            if metrics.is_empty() {
                emptied.push(name);
            }
        }

        if !emptied.is_empty() {
            let mut endpoints = self.endpoints.write();
            for name in emptied {
                let still_empty = endpoints
                    .get(&name)
                    .map(|metrics| metrics.is_empty())
                    .unwrap_or(false);
                if still_empty {
                    endpoints.remove(&name);
                    stats.endpoints += 1;
                }
            }
        }

        stats
    }

    /// Current size of the index
    pub fn stats(&self) -> IndexStats {
        let endpoints: Vec<Arc<MetricIndexMap>> =
            self.endpoints.read().values().cloned().collect();

        let mut stats = IndexStats {
            endpoints: endpoints.len(),
            pending_reports: self.new_endpoints.len(),
            ..Default::default()
        };
        for metrics in endpoints {
            let (m, c, t) = metrics.counts();
            stats.metrics += m;
            stats.counters += c;
            stats.tag_values += t;
        }
        stats
    }

    pub fn new_endpoints(&self) -> &Arc<NewEndpointQueue> {
        &self.new_endpoints
    }

    pub fn max_query_count(&self) -> usize {
        self.max_query_count
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}

/// `core=[0,1] host=[h1]`
fn describe(pairs: &[TagPair]) -> String {
    pairs
        .iter()
        .map(|p| format!("{}=[{}]", p.key, p.values.join(",")))
        .collect::<Vec<_>>()
        .join(" ")
}
