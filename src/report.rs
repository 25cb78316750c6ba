//! Endpoint registration
//!
//! Drains the new-endpoint queue in batches and posts each batch to a
//! registry peer. A batch is retried until some peer accepts it; accepted
//! endpoints get their reported flag set.
//!
//! ```text
//! push ──► NewEndpointQueue ──► pop ≤ batch_size ──► worker (≤ report_workers)
//!                                                     │ peers shuffled
//!                                                     ├─ POST /v1/portal/endpoint
//!                                                     └─ all failed → sleep, retry
//! ```

use crate::cluster::{base_url, Discovery};
use crate::index::{EndpointIndexMap, IndexError, IndexResult};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Header carrying the service token on registry calls
pub const TOKEN_HEADER: &str = "X-Srv-Token";

/// Configuration for the registration loop
#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Service token sent to registry peers
    pub token: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Batches in flight at once
    pub workers: usize,
    /// Endpoints per batch
    pub batch_size: usize,
    /// Sleep when the queue is empty
    pub idle_interval: Duration,
    /// Sleep after every peer rejected a batch
    pub retry_interval: Duration,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            token: "index-builtin-token".to_string(),
            timeout: Duration::from_secs(3),
            workers: 10,
            batch_size: 500,
            idle_interval: Duration::from_secs(1),
            retry_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    endpoints: &'a [String],
}

#[derive(Debug, Deserialize)]
struct RegistryReply {
    #[serde(default)]
    err: String,
}

/// Registry client plus the loop feeding it
pub struct Reporter {
    index: Arc<EndpointIndexMap>,
    discovery: Arc<dyn Discovery>,
    client: reqwest::Client,
    config: ReportConfig,
    permits: Arc<Semaphore>,
}

impl Reporter {
    pub fn new(
        index: Arc<EndpointIndexMap>,
        discovery: Arc<dyn Discovery>,
        config: ReportConfig,
    ) -> IndexResult<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));

        Ok(Self {
            index,
            discovery,
            client,
            config,
            permits,
        })
    }

    /// Run until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            workers = self.config.workers,
            batch_size = self.config.batch_size,
            "endpoint registration started"
        );

        loop {
            let batch = self
                .index
                .new_endpoints()
                .pop_back_batch(self.config.batch_size);

            if batch.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_interval) => continue,
                }
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let reporter = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                reporter.report_batch(&batch, &shutdown).await;
                drop(permit);
            });
        }

        info!("endpoint registration stopped");
    }

    /// Post `batch` until a peer accepts it
    ///
    /// Returns false only if `shutdown` fired first.
    pub async fn report_batch(&self, batch: &[String], shutdown: &CancellationToken) -> bool {
        loop {
            if self.post_to_any(batch).await {
                for endpoint in batch {
                    self.index.set_reported(endpoint, true);
                }
                debug!(endpoints = batch.len(), "endpoints registered");
                return true;
            }

            warn!(endpoints = batch.len(), "no registry peer accepted endpoints, retrying");
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_interval) => {}
            }
        }
    }

    /// One pass over the registry peers in random order
    async fn post_to_any(&self, batch: &[String]) -> bool {
        let mut peers = self.discovery.registry_peers().await;
        peers.shuffle(&mut rand::thread_rng());

        for peer in &peers {
            match self.post(peer, batch).await {
                Ok(()) => return true,
                Err(e) => warn!(peer = %peer, error = %e, "registry peer rejected endpoints"),
            }
        }
        false
    }

    /// POST one batch to one registry peer
    pub async fn post(&self, peer: &str, endpoints: &[String]) -> IndexResult<()> {
        let url = format!("{}/v1/portal/endpoint", base_url(peer));
        let response = self
            .client
            .post(&url)
            .header(TOKEN_HEADER, &self.config.token)
            .json(&RegisterRequest { endpoints })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IndexError::Transport(format!("{} replied {}", url, status)));
        }

        let reply: RegistryReply = response.json().await?;
        if !reply.err.is_empty() {
            return Err(IndexError::Transport(format!("{} replied err={}", url, reply.err)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticDiscovery;
    use crate::index::IndexItem;
    use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    #[derive(Clone, Default)]
    struct Registry {
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    async fn register(
        State(registry): State<Registry>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let token = headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if registry.fail || token != "secret" {
            return Json(json!({"err": "rejected", "dat": null}));
        }

        let endpoints = body["endpoints"].as_array().cloned().unwrap_or_default();
        registry.seen.lock().extend(
            endpoints
                .iter()
                .filter_map(|e| e.as_str().map(str::to_string)),
        );
        Json(json!({"err": "", "dat": "ok"}))
    }

    async fn spawn_registry(registry: Registry) -> String {
        let app = Router::new()
            .route("/v1/portal/endpoint", post(register))
            .with_state(registry);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(token: &str) -> ReportConfig {
        ReportConfig {
            token: token.to_string(),
            idle_interval: Duration::from_millis(20),
            retry_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn index_with(endpoints: &[&str]) -> Arc<EndpointIndexMap> {
        let index = Arc::new(EndpointIndexMap::new(100));
        for endpoint in endpoints {
            index.push(&IndexItem::new(*endpoint, "cpu.idle"), 1000);
        }
        index
    }

    fn reported(index: &EndpointIndexMap, endpoint: &str) -> bool {
        index
            .get_metric_index_map(endpoint)
            .map(|m| m.is_reported())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_post_accepted() {
        let registry = Registry::default();
        let url = spawn_registry(registry.clone()).await;
        let reporter = Reporter::new(
            index_with(&[]),
            Arc::new(StaticDiscovery::default()),
            config("secret"),
        )
        .unwrap();

        reporter.post(&url, &["h1".to_string()]).await.unwrap();
        assert_eq!(*registry.seen.lock(), vec!["h1"]);
    }

    #[tokio::test]
    async fn test_post_rejected_on_err_field() {
        let url = spawn_registry(Registry::default()).await;
        let reporter = Reporter::new(
            index_with(&[]),
            Arc::new(StaticDiscovery::default()),
            config("wrong"),
        )
        .unwrap();

        let err = reporter.post(&url, &["h1".to_string()]).await.unwrap_err();
        assert!(matches!(err, IndexError::Transport(_)));
    }

    #[tokio::test]
    async fn test_batch_marks_reported_after_failover() {
        let good = Registry::default();
        let bad = Registry {
            fail: true,
            ..Default::default()
        };
        let peers = vec![
            spawn_registry(bad).await,
            "127.0.0.1:1".to_string(),
            spawn_registry(good.clone()).await,
        ];

        let index = index_with(&["h1", "h2"]);
        let reporter = Reporter::new(
            Arc::clone(&index),
            Arc::new(StaticDiscovery::new("", Vec::new(), peers)),
            config("secret"),
        )
        .unwrap();

        let batch = index.new_endpoints().pop_back_batch(10);
        assert!(reporter.report_batch(&batch, &CancellationToken::new()).await);

        assert!(reported(&index, "h1"));
        assert!(reported(&index, "h2"));
        assert_eq!(good.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_retries_until_cancelled() {
        let index = index_with(&["h1"]);
        let reporter = Reporter::new(
            Arc::clone(&index),
            Arc::new(StaticDiscovery::new("", Vec::new(), vec!["127.0.0.1:1".to_string()])),
            config("secret"),
        )
        .unwrap();

        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        assert!(!reporter.report_batch(&["h1".to_string()], &shutdown).await);
        assert!(!reported(&index, "h1"));
    }

    #[tokio::test]
    async fn test_run_drains_queue() {
        let registry = Registry::default();
        let url = spawn_registry(registry.clone()).await;
        let index = index_with(&["h1", "h2", "h3"]);

        let reporter = Arc::new(
            Reporter::new(
                Arc::clone(&index),
                Arc::new(StaticDiscovery::new("", Vec::new(), vec![url])),
                ReportConfig {
                    batch_size: 2,
                    ..config("secret")
                },
            )
            .unwrap(),
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&reporter).run(shutdown.clone()));

        for _ in 0..100 {
            if ["h1", "h2", "h3"].iter().all(|e| reported(&index, e)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
        handle.await.unwrap();

        assert!(["h1", "h2", "h3"].iter().all(|e| reported(&index, e)));
        assert!(index.new_endpoints().is_empty());
        let mut seen = registry.seen.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["h1", "h2", "h3"]);
    }
}
