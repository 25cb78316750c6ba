//! Index Query Routes
//!
//! Read and delete operations over the endpoint index.
//!
//! - POST /api/index/metrics - Metric names of several endpoints
//! - DELETE /api/index/metrics - Remove metrics from endpoints
//! - DELETE /api/index/endpoints - Remove endpoints
//! - DELETE /api/index/counter - Remove tag values and their counters
//! - POST /api/index/tagkv - Tag catalog of metrics across endpoints
//! - POST /api/index/counter/fullmatch - Existing counters of an exact tag spec
//! - POST /api/index/counter/clude - Counters matching include/exclude filters

use axum::{extract::State, Json};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use crate::api::dto::{
    CludeItem, CludeRequest, CounterRequest, DeleteResponse, EndpointMetricsRequest,
    EndpointsRequest, FullMatchItem, FullMatchResponse, MetricsResponse, TagkvResponse,
};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::index::clude::{expand, product_size, sort_tag_pairs};
use crate::index::{IndexError, TagPair};

/// POST /api/index/metrics
///
/// Union of metric names over the requested endpoints, first seen first.
pub async fn get_metrics(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EndpointsRequest>,
) -> ApiResult<Json<MetricsResponse>> {
    let mut seen = HashSet::new();
    let mut metrics = Vec::new();

    for endpoint in &req.endpoints {
        for metric in state.index.get_metrics_by(endpoint) {
            if seen.insert(metric.clone()) {
                metrics.push(metric);
            }
        }
    }

    Ok(Json(MetricsResponse { metrics }))
}

/// DELETE /api/index/endpoints
pub async fn del_endpoints(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EndpointsRequest>,
) -> ApiResult<Json<DeleteResponse>> {
    let removed = req
        .endpoints
        .iter()
        .filter(|endpoint| state.index.del_by_endpoint(endpoint))
        .count();

    tracing::info!(requested = req.endpoints.len(), removed, "deleted endpoints");
    Ok(Json(DeleteResponse::ok(removed)))
}

/// DELETE /api/index/metrics
pub async fn del_metrics(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EndpointMetricsRequest>,
) -> ApiResult<Json<DeleteResponse>> {
    let removed: usize = req
        .endpoints
        .iter()
        .map(|endpoint| state.index.del_metrics(endpoint, &req.metrics))
        .sum();

    tracing::info!(
        endpoints = req.endpoints.len(),
        metrics = req.metrics.len(),
        removed,
        "deleted metrics"
    );
    Ok(Json(DeleteResponse::ok(removed)))
}

/// DELETE /api/index/counter
///
/// Removes the listed tag values of one metric, and with them every
/// counter carrying one of those `k=v` pairs.
pub async fn del_counter(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CounterRequest>,
) -> ApiResult<Json<DeleteResponse>> {
    if req.metric.is_empty() {
        return Err(ApiError::Validation("metric is required".to_string()));
    }

    let removed: usize = req
        .endpoints
        .iter()
        .map(|endpoint| state.index.del_tags(endpoint, &req.metric, &req.tagkv))
        .sum();

    tracing::info!(metric = %req.metric, removed, "deleted counters");
    Ok(Json(DeleteResponse::ok(removed)))
}

/// POST /api/index/tagkv
///
/// For each metric, the union of its tag catalog over the endpoints.
/// Keys and values are sorted.
pub async fn get_tag_pairs(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EndpointMetricsRequest>,
) -> ApiResult<Json<Vec<TagkvResponse>>> {
    let mut resp = Vec::with_capacity(req.metrics.len());

    for metric in &req.metrics {
        let mut union: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for endpoint in &req.endpoints {
            let Some(index) = state.index.get_metric_index(endpoint, metric) else {
                tracing::debug!(endpoint = %endpoint, metric = %metric, "tagkv query miss");
                continue;
            };
            for (key, values) in index.tagkv().get_tagkv_map() {
                union.entry(key).or_default().extend(values);
            }
        }

        resp.push(TagkvResponse {
            endpoints: req.endpoints.clone(),
            metric: metric.clone(),
            tagkv: union
                .into_iter()
                .map(|(key, values)| TagPair::new(key, values))
                .collect(),
        });
    }

    Ok(Json(resp))
}

/// POST /api/index/counter/fullmatch
///
/// Expands each entry's tag specification and keeps the counters that
/// exist on each endpoint. An entry without tags counts once per endpoint
/// on which the metric exists.
pub async fn get_counters_full_match(
    State(state): State<Arc<AppState>>,
    Json(reqs): Json<Vec<CounterRequest>>,
) -> ApiResult<Json<FullMatchResponse>> {
    let limit = state.index.max_query_count();
    let mut list = Vec::with_capacity(reqs.len());
    let mut count = 0;

    for req in &reqs {
        let sorted = sort_tag_pairs(&req.tagkv);
        let size = product_size(&sorted);
        if size > limit as u128 {
            return Err(IndexError::ResultTooLarge {
                endpoint: req.endpoints.join(","),
                metric: req.metric.clone(),
                include: String::new(),
                exclude: String::new(),
                count: size,
                limit,
            }
            .into());
        }
        let candidates = expand(&sorted);

        let mut endpoints = Vec::new();
        let mut tags = Vec::new();
        let mut seen = HashSet::new();
        let mut step = 0;
        let mut dstype = String::new();

        for endpoint in &req.endpoints {
            if endpoint.is_empty() || req.metric.is_empty() {
                continue;
            }
            let Some(index) = state.index.get_metric_index(endpoint, &req.metric) else {
                tracing::debug!(endpoint = %endpoint, metric = %req.metric, "fullmatch query miss");
                continue;
            };
            endpoints.push(endpoint.clone());

            if step == 0 || dstype.is_empty() {
                let meta = index.meta();
                step = meta.step;
                dstype = meta.ds_type;
            }

            if candidates.is_empty() {
                count += 1;
                continue;
            }

            for counter in index.counters().filter_existing(&candidates) {
                count += 1;
                if seen.insert(counter.clone()) {
                    tags.push(counter);
                }
            }
        }

        list.push(FullMatchItem {
            endpoints,
            metric: req.metric.clone(),
            tags,
            step,
            dstype,
        });
    }

    Ok(Json(FullMatchResponse { list, count }))
}

/// POST /api/index/counter/clude
///
/// One item per (endpoint, metric). An endpoint whose expansion exceeds
/// the query limit is logged and left out of the response. The untagged
/// counter `""` is only returned when no filter is given.
pub async fn get_index_by_clude(
    State(state): State<Arc<AppState>>,
    Json(reqs): Json<Vec<CludeRequest>>,
) -> ApiResult<Json<Vec<CludeItem>>> {
    let mut resp = Vec::new();

    for req in &reqs {
        for endpoint in &req.endpoints {
            if endpoint.is_empty() || req.metric.is_empty() {
                continue;
            }

            let Some(index) = state.index.get_metric_index(endpoint, &req.metric) else {
                tracing::debug!(endpoint = %endpoint, metric = %req.metric, "clude query miss");
                resp.push(CludeItem {
                    endpoint: endpoint.clone(),
                    metric: req.metric.clone(),
                    tags: Vec::new(),
                    step: 0,
                    dstype: String::new(),
                });
                continue;
            };

            // without filters the untagged counter "" is a valid answer
            let unfiltered = req.include.is_empty() && req.exclude.is_empty();
            let candidates = if unfiltered {
                index.counters().get_counters()
            } else {
                match state.index.get_index_by_clude(
                    endpoint,
                    &req.metric,
                    &req.include,
                    &req.exclude,
                ) {
                    Ok(counters) => counters,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping endpoint in clude query");
                        continue;
                    }
                }
            };

            let present = index.counters().filter_existing(&candidates);
            let mut seen = HashSet::new();
            let tags = present
                .into_iter()
                .filter(|counter| {
                    (unfiltered || !counter.is_empty()) && seen.insert(counter.clone())
                })
                .collect();

            let meta = index.meta();
            resp.push(CludeItem {
                endpoint: endpoint.clone(),
                metric: req.metric.clone(),
                tags,
                step: meta.step,
                dstype: meta.ds_type,
            });
        }
    }

    Ok(Json(resp))
}
