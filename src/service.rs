//! Index Service - lifecycle of the index
//!
//! Owns the index and runs its background activities:
//!
//! ```text
//! startup ─► rebuild (peer bundle or local db/)
//!            │
//!            ├─► cleaner    every clean_interval   sweep entries older than cache_duration
//!            ├─► persister  every persist_interval normal snapshot
//!            └─► reporter   continuous             register new endpoints
//!
//! shutdown ─► cancel loops ─► wait ─► end snapshot
//! ```

use crate::cluster::Discovery;
use crate::config::Config;
use crate::index::{EndpointIndexMap, IndexError, IndexResult};
use crate::persist::{RebuildReport, SnapshotManager, SnapshotMode, SnapshotReport};
use crate::report::Reporter;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Timing of the background activities
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Freshness window used by the sweeper
    pub cache_duration: Duration,
    pub clean_interval: Duration,
    pub persist_interval: Duration,
    /// Run the registration loop
    pub report_endpoint: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache_duration: Duration::from_secs(90_000),
            clean_interval: Duration::from_secs(3600),
            persist_interval: Duration::from_secs(900),
            report_endpoint: true,
        }
    }
}

/// Shortest period accepted for the cleaner and persister timers
const MIN_INTERVAL: Duration = Duration::from_secs(1);

impl ServiceConfig {
    /// Raise zero timer periods to [`MIN_INTERVAL`]
    pub fn normalized(mut self) -> Self {
        if self.clean_interval.is_zero() {
            warn!(
                min_secs = MIN_INTERVAL.as_secs(),
                "clean_interval is zero, using the minimum"
            );
            self.clean_interval = MIN_INTERVAL;
        }
        if self.persist_interval.is_zero() {
            warn!(
                min_secs = MIN_INTERVAL.as_secs(),
                "persist_interval is zero, using the minimum"
            );
            self.persist_interval = MIN_INTERVAL;
        }
        self
    }
}

/// Index plus the tasks that keep it fresh and durable
pub struct IndexService {
    index: Arc<EndpointIndexMap>,
    snapshots: Arc<SnapshotManager>,
    reporter: Option<Arc<Reporter>>,
    discovery: Arc<dyn Discovery>,
    config: ServiceConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IndexService {
    pub fn new(
        index: Arc<EndpointIndexMap>,
        snapshots: Arc<SnapshotManager>,
        reporter: Option<Arc<Reporter>>,
        discovery: Arc<dyn Discovery>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            index,
            snapshots,
            reporter,
            discovery,
            config: config.normalized(),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Wire every component from configuration
    pub fn from_config(config: &Config) -> IndexResult<Self> {
        let index = Arc::new(EndpointIndexMap::new(config.cache.max_query_count));
        let discovery: Arc<dyn Discovery> = Arc::new(config.discovery());
        let snapshots = Arc::new(SnapshotManager::new(
            Arc::clone(&index),
            config.snapshot_config(),
        )?);

        let service_config = config.service_config();
        let reporter = if service_config.report_endpoint {
            Some(Arc::new(Reporter::new(
                Arc::clone(&index),
                Arc::clone(&discovery),
                config.report_config(),
            )?))
        } else {
            None
        };

        Ok(Self::new(index, snapshots, reporter, discovery, service_config))
    }

    pub fn index(&self) -> &Arc<EndpointIndexMap> {
        &self.index
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Load the index from a peer or the local snapshot
    pub async fn rebuild(&self) -> IndexResult<RebuildReport> {
        self.snapshots.rebuild(self.discovery.as_ref()).await
    }

    /// Spawn the cleaner, persister and (if enabled) reporter
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_cleaner());
        tasks.push(self.spawn_persister());

        if let Some(reporter) = &self.reporter {
            tasks.push(tokio::spawn(
                Arc::clone(reporter).run(self.shutdown.child_token()),
            ));
        }

        info!(
            clean_interval_secs = self.config.clean_interval.as_secs(),
            persist_interval_secs = self.config.persist_interval.as_secs(),
            report_endpoint = self.reporter.is_some(),
            "index background tasks started"
        );
    }

    fn spawn_cleaner(&self) -> JoinHandle<()> {
        let index = Arc::clone(&self.index);
        let shutdown = self.shutdown.child_token();
        let period = self.config.clean_interval;
        let max_age = self.config.cache_duration.as_secs() as i64;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let index = Arc::clone(&index);
                if let Err(e) = tokio::task::spawn_blocking(move || index.clean(max_age)).await {
                    error!(error = %e, "index sweep panicked");
                }
            }
        })
    }

    fn spawn_persister(&self) -> JoinHandle<()> {
        let snapshots = Arc::clone(&self.snapshots);
        let shutdown = self.shutdown.child_token();
        let period = self.config.persist_interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match snapshots.snapshot(SnapshotMode::Normal).await {
                    Ok(_) => {}
                    Err(IndexError::Busy) => warn!("skipping periodic snapshot, another one is running"),
                    Err(e) => error!(error = %e, "periodic snapshot failed"),
                }
            }
        })
    }

    /// Stop the background tasks and write the final snapshot
    pub async fn shutdown(&self) -> IndexResult<SnapshotReport> {
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "background task failed");
            }
        }

        info!("writing final index snapshot");
        self.snapshots.snapshot(SnapshotMode::End).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticDiscovery;
    use crate::index::IndexItem;
    use crate::persist::{SnapshotConfig, DB_DIR};

    fn service(dir: &std::path::Path, config: ServiceConfig) -> IndexService {
        let index = Arc::new(EndpointIndexMap::new(100));
        let snapshots = Arc::new(
            SnapshotManager::new(
                Arc::clone(&index),
                SnapshotConfig {
                    dir: dir.to_path_buf(),
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        IndexService::new(
            index,
            snapshots,
            None,
            Arc::new(StaticDiscovery::default()),
            config,
        )
    }

    #[tokio::test]
    async fn test_cleaner_sweeps_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(
            dir.path(),
            ServiceConfig {
                cache_duration: Duration::from_secs(60),
                clean_interval: Duration::from_millis(20),
                persist_interval: Duration::from_secs(3600),
                report_endpoint: false,
            },
        );

        let now = chrono::Utc::now().timestamp();
        service.index().push(&IndexItem::new("old", "cpu.idle"), now - 3600);
        service.index().push(&IndexItem::new("fresh", "cpu.idle"), now);
        service.start();

        for _ in 0..100 {
            if service.index().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(service.index().get_endpoints(), vec!["fresh"]);

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_persister_writes_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(
            dir.path(),
            ServiceConfig {
                persist_interval: Duration::from_millis(20),
                report_endpoint: false,
                ..Default::default()
            },
        );
        service.index().push(&IndexItem::new("h1", "cpu.idle"), 1000);
        service.start();

        let file = dir.path().join(DB_DIR).join("h1");
        for _ in 0..100 {
            if file.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(file.exists());

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_writes_end_snapshot_and_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let first = service(dir.path(), ServiceConfig::default());
        first.index().push(&IndexItem::new("h1", "cpu.idle").tag("core", "0"), 1000);
        first.start();

        let report = first.shutdown().await.unwrap();
        assert_eq!(report.mode, SnapshotMode::End);
        assert_eq!(report.written, 1);

        let second = service(dir.path(), ServiceConfig::default());
        let rebuilt = second.rebuild().await.unwrap();
        assert_eq!(rebuilt.loaded, 1);
        assert_eq!(second.index().get_metrics_by("h1"), vec!["cpu.idle"]);
    }

    #[test]
    fn test_zero_intervals_are_raised() {
        let config = ServiceConfig {
            clean_interval: Duration::ZERO,
            persist_interval: Duration::ZERO,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.clean_interval, MIN_INTERVAL);
        assert_eq!(config.persist_interval, MIN_INTERVAL);

        let kept = ServiceConfig::default().normalized();
        assert_eq!(kept.clean_interval, Duration::from_secs(3600));
        assert_eq!(kept.persist_interval, Duration::from_secs(900));
    }

    #[tokio::test]
    async fn test_zero_interval_config_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache.clean_interval_secs = 0;
        config.cache.persist_interval_secs = 0;

        let service = service(
            dir.path(),
            ServiceConfig {
                report_endpoint: false,
                ..config.service_config()
            },
        );
        assert_eq!(service.config.clean_interval, MIN_INTERVAL);
        assert_eq!(service.config.persist_interval, MIN_INTERVAL);

        service.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = service.tasks.lock().drain(..).collect();
        assert_eq!(tasks.len(), 2);
        for task in tasks {
            assert!(task.await.is_ok());
        }
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.cache.report_endpoint = false;
        config.cache.max_query_count = 7;

        let service = IndexService::from_config(&config).unwrap();
        assert!(service.reporter.is_none());
        assert_eq!(service.index().max_query_count(), 7);
    }
}
