//! Snapshot Manager - on-disk image of the index
//!
//! Writes the whole index as one JSON file per endpoint and rebuilds it
//! on startup, either from a peer's bundle or from the local directory.
//!
//! # Layout
//!
//! ```text
//! persist_dir/
//! ├── db/          canonical snapshot, one file per endpoint
//! ├── tmp/         scratch for normal / end snapshots
//! ├── download/    scratch for download snapshots, and peer bundles on rebuild
//! ├── peer.tar.gz  peer bundle while it is being fetched
//! └── db.tar.gz    bundle produced by the last download snapshot
//! ```
//!
//! # Gate
//!
//! A single permit guards the directory. `normal` and `download` fail with
//! [`IndexError::Busy`] when it is taken; `end` and rebuild wait for it.
//! Scratch is written in full before `db/` is replaced by a rename.

pub mod archive;

use crate::cluster::{base_url, Discovery};
use crate::index::{EndpointIndexMap, IndexError, IndexResult, MetricIndexMap};
use rand::seq::SliceRandom;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Canonical snapshot directory
pub const DB_DIR: &str = "db";
/// Scratch directory for normal and end snapshots
pub const TMP_DIR: &str = "tmp";
/// Scratch directory for download snapshots and unpacked peer bundles
pub const DOWNLOAD_DIR: &str = "download";
/// Bundle file served to peers
pub const ARCHIVE_FILE: &str = "db.tar.gz";
/// Peer bundle streamed to disk before unpacking
pub const PEER_BUNDLE_FILE: &str = "peer.tar.gz";

/// Snapshot flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Periodic, fails fast when busy
    Normal,
    /// Shutdown, waits for the gate
    End,
    /// On-demand export, also writes the bundle; fails fast when busy
    Download,
}

impl SnapshotMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotMode::Normal => "normal",
            SnapshotMode::End => "end",
            SnapshotMode::Download => "download",
        }
    }

    fn scratch_dir(&self) -> &'static str {
        match self {
            SnapshotMode::Download => DOWNLOAD_DIR,
            SnapshotMode::Normal | SnapshotMode::End => TMP_DIR,
        }
    }
}

impl fmt::Display for SnapshotMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the snapshot manager
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Root of the on-disk layout
    pub dir: PathBuf,
    /// Width of the rebuild worker pool
    pub rebuild_workers: usize,
    /// Timeout for downloading a peer's bundle
    pub download_timeout: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./.index"),
            rebuild_workers: 20,
            download_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of one snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    pub mode: SnapshotMode,
    /// Endpoint files written
    pub written: usize,
    /// Endpoints that could not be written
    pub failed: usize,
    /// Bundle path, download mode only
    pub archive: Option<PathBuf>,
}

/// Where a rebuild took its data from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildSource {
    /// Bundle downloaded from this peer
    Peer(String),
    /// Local `db/` directory
    Local,
    /// Nothing to load
    Empty,
}

/// Outcome of a rebuild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub source: RebuildSource,
    /// Endpoints installed
    pub loaded: usize,
    /// Files that could not be read or decoded
    pub failed: usize,
}

/// Owns the persistence directory and its gate
pub struct SnapshotManager {
    index: Arc<EndpointIndexMap>,
    config: SnapshotConfig,
    gate: Semaphore,
    client: reqwest::Client,
}

impl SnapshotManager {
    pub fn new(index: Arc<EndpointIndexMap>, config: SnapshotConfig) -> IndexResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.download_timeout)
            .build()?;

        Ok(Self {
            index,
            config,
            gate: Semaphore::new(1),
            client,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    pub fn db_dir(&self) -> PathBuf {
        self.config.dir.join(DB_DIR)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.config.dir.join(ARCHIVE_FILE)
    }

    /// Write the whole index to disk
    pub async fn snapshot(&self, mode: SnapshotMode) -> IndexResult<SnapshotReport> {
        let _permit = match mode {
            SnapshotMode::End => self.gate.acquire().await.map_err(|_| IndexError::Busy)?,
            SnapshotMode::Normal | SnapshotMode::Download => {
                self.gate.try_acquire().map_err(|_| IndexError::Busy)?
            }
        };

        let start = Instant::now();
        let index = Arc::clone(&self.index);
        let root = self.config.dir.clone();
        let report =
            tokio::task::spawn_blocking(move || write_snapshot(&index, &root, mode)).await??;

        info!(
            mode = %mode,
            written = report.written,
            failed = report.failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "index snapshot finished"
        );
        Ok(report)
    }

    /// Populate the index from a peer bundle, else from the local snapshot
    ///
    /// Waits for the gate. Pushes arriving meanwhile are merged with the
    /// loaded state.
    pub async fn rebuild(&self, discovery: &dyn Discovery) -> IndexResult<RebuildReport> {
        let _permit = self.gate.acquire().await.map_err(|_| IndexError::Busy)?;
        let start = Instant::now();

        let mut peers = discovery.index_peers().await;
        peers.shuffle(&mut rand::thread_rng());

        let (source, dir) = match self.fetch_from_peers(&peers).await {
            Some(peer) => (RebuildSource::Peer(peer), self.config.dir.join(DOWNLOAD_DIR)),
            None => (RebuildSource::Local, self.db_dir()),
        };

        if !dir.is_dir() {
            info!(dir = %dir.display(), "no index snapshot found, starting empty");
            return Ok(RebuildReport {
                source: RebuildSource::Empty,
                loaded: 0,
                failed: 0,
            });
        }

        let (loaded, failed) = self.load_dir(&dir).await?;
        info!(
            source = ?source,
            loaded,
            failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "index rebuild finished"
        );

        Ok(RebuildReport {
            source,
            loaded,
            failed,
        })
    }

    /// Try peers in order; returns the first one whose bundle unpacked
    async fn fetch_from_peers(&self, peers: &[String]) -> Option<String> {
        for peer in peers {
            match self.fetch_bundle(peer).await {
                Ok(files) => {
                    info!(peer = %peer, files, "fetched index bundle from peer");
                    return Some(peer.clone());
                }
                Err(e) => warn!(peer = %peer, error = %e, "failed to fetch index bundle"),
            }
        }
        None
    }

    async fn fetch_bundle(&self, peer: &str) -> IndexResult<usize> {
        let url = format!("{}/api/index/idxfile", base_url(peer));
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(IndexError::Transport(format!(
                "{} replied {}",
                url,
                response.status()
            )));
        }

        let bundle = self.config.dir.join(PEER_BUNDLE_FILE);
        let result = self.unpack_response(response, &bundle).await;
        if let Err(e) = tokio::fs::remove_file(&bundle).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(file = %bundle.display(), error = %e, "failed to remove peer bundle");
            }
        }
        result
    }

    /// Stream a bundle body to `bundle`, then unpack it into the download directory
    async fn unpack_response(
        &self,
        mut response: reqwest::Response,
        bundle: &Path,
    ) -> IndexResult<usize> {
        let mut file = tokio::fs::File::create(bundle).await?;
        let mut size = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);
        debug!(file = %bundle.display(), size_bytes = size, "peer bundle downloaded");

        let bundle = bundle.to_path_buf();
        let dest = self.config.dir.join(DOWNLOAD_DIR);
        let files = tokio::task::spawn_blocking(move || {
            archive::unpack(io::BufReader::new(fs::File::open(&bundle)?), &dest)
        })
        .await??;
        Ok(files)
    }

    /// Decode and install every endpoint file of `dir`
    async fn load_dir(&self, dir: &Path) -> IndexResult<(usize, usize)> {
        let listing = dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || list_files(&listing)).await??;

        let workers = self.config.rebuild_workers.max(1).min(files.len().max(1));
        let chunk = files.len().div_ceil(workers).max(1);
        let loaded = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers);
        for batch in files.chunks(chunk) {
            let batch = batch.to_vec();
            let index = Arc::clone(&self.index);
            let loaded = Arc::clone(&loaded);
            let failed = Arc::clone(&failed);

            handles.push(tokio::task::spawn_blocking(move || {
                for path in batch {
                    match load_endpoint(&index, &path) {
                        Ok(()) => loaded.fetch_add(1, Ordering::Relaxed),
                        Err(e) => {
                            error!(file = %path.display(), error = %e, "failed to load endpoint index");
                            failed.fetch_add(1, Ordering::Relaxed)
                        }
                    };
                }
            }));
        }

        for handle in handles {
            handle.await?;
        }

        Ok((loaded.load(Ordering::Relaxed), failed.load(Ordering::Relaxed)))
    }
}

/// Regular files directly under `dir`
fn list_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

fn write_snapshot(
    index: &EndpointIndexMap,
    root: &Path,
    mode: SnapshotMode,
) -> IndexResult<SnapshotReport> {
    let scratch = root.join(mode.scratch_dir());
    remove_dir_if_exists(&scratch)?;
    fs::create_dir_all(&scratch)?;

    let endpoints = index.get_endpoints();
    info!(mode = %mode, endpoints = endpoints.len(), "writing index snapshot");

    let mut written = 0;
    let mut failed = 0;
    for endpoint in endpoints {
        match write_endpoint(index, &scratch, &endpoint) {
            Ok(true) => written += 1,
            // removed since the listing
            Ok(false) => {}
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "failed to write endpoint index");
                failed += 1;
            }
        }
    }

    let archive = if mode == SnapshotMode::Download {
        let path = root.join(ARCHIVE_FILE);
        archive::pack_dir(&scratch, &path)?;
        Some(path)
    } else {
        None
    };

    let db = root.join(DB_DIR);
    remove_dir_if_exists(&db)?;
    fs::rename(&scratch, &db)?;

    Ok(SnapshotReport {
        mode,
        written,
        failed,
        archive,
    })
}

fn write_endpoint(index: &EndpointIndexMap, dir: &Path, endpoint: &str) -> IndexResult<bool> {
    let Some(metrics) = index.get_metric_index_map(endpoint) else {
        return Ok(false);
    };
    let bytes = metrics.encode()?;
    fs::write(dir.join(file_name(endpoint)), bytes)?;
    Ok(true)
}

fn load_endpoint(index: &EndpointIndexMap, path: &Path) -> IndexResult<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| IndexError::Serialization(format!("bad file name {}", path.display())))?;
    let endpoint = endpoint_name(name)?;

    let bytes = fs::read(path)?;
    let metrics = MetricIndexMap::decode(&bytes)?;
    index.install(&endpoint, metrics);
    Ok(())
}

/// On-disk file name of an endpoint
pub fn file_name(endpoint: &str) -> String {
    urlencoding::encode(endpoint).into_owned()
}

/// Endpoint name from its on-disk file name
pub fn endpoint_name(file_name: &str) -> IndexResult<String> {
    urlencoding::decode(file_name)
        .map(|name| name.into_owned())
        .map_err(|e| IndexError::Serialization(format!("bad file name {}: {}", file_name, e)))
}

fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticDiscovery;
    use crate::index::{IndexItem, TagPair};
    use axum::{body::Body, routing::get, Router};
    use tokio_util::io::ReaderStream;

    fn populated() -> Arc<EndpointIndexMap> {
        let index = Arc::new(EndpointIndexMap::new(100_000));
        for (endpoint, core) in [("h1", "0"), ("h1", "1"), ("10.0.0.7", "0"), ("pod/a", "3")] {
            let item = IndexItem::new(endpoint, "cpu.idle")
                .tag("core", core)
                .step(10)
                .ds_type("GAUGE");
            index.push(&item, 1000);
        }
        index.push(&IndexItem::new("h1", "mem.used").step(60), 1000);
        index.set_reported("h1", true);
        index
    }

    fn manager(index: Arc<EndpointIndexMap>, dir: &Path) -> SnapshotManager {
        SnapshotManager::new(
            index,
            SnapshotConfig {
                dir: dir.to_path_buf(),
                rebuild_workers: 2,
                download_timeout: Duration::from_secs(5),
            },
        )
        .unwrap()
    }

    fn no_peers() -> StaticDiscovery {
        StaticDiscovery::default()
    }

    #[tokio::test]
    async fn test_snapshot_writes_db_dir() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = manager(populated(), dir.path());

        let report = snapshots.snapshot(SnapshotMode::Normal).await.unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(report.failed, 0);
        assert!(report.archive.is_none());

        let db = dir.path().join(DB_DIR);
        assert!(db.join("h1").is_file());
        assert!(db.join("10.0.0.7").is_file());
        assert!(db.join("pod%2Fa").is_file());
        assert!(!dir.path().join(TMP_DIR).exists());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let original = populated();
        manager(Arc::clone(&original), dir.path())
            .snapshot(SnapshotMode::End)
            .await
            .unwrap();

        let restored = Arc::new(EndpointIndexMap::new(100_000));
        let report = manager(Arc::clone(&restored), dir.path())
            .rebuild(&no_peers())
            .await
            .unwrap();

        assert_eq!(report.source, RebuildSource::Local);
        assert_eq!(report.loaded, 3);
        assert_eq!(report.failed, 0);

        let (a, b) = (original.stats(), restored.stats());
        assert_eq!((a.endpoints, a.metrics, a.counters, a.tag_values), (b.endpoints, b.metrics, b.counters, b.tag_values));

        let mut counters = restored
            .get_index_by_clude("h1", "cpu.idle", &[TagPair::new("core", ["1"])], &[])
            .unwrap();
        counters.sort();
        assert_eq!(counters, vec!["core=1"]);
        assert_eq!(
            restored.get_metric_index("h1", "mem.used").unwrap().step(),
            60
        );
        assert_eq!(restored.get_metrics_by("pod/a"), vec!["cpu.idle"]);

        // reported flag survives; unreported endpoints are queued again
        assert!(restored.get_metric_index_map("h1").unwrap().is_reported());
        let mut queued = restored.new_endpoints().pop_back_batch(10);
        queued.sort();
        assert_eq!(queued, vec!["10.0.0.7", "pod/a"]);
    }

    #[tokio::test]
    async fn test_busy_gate() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = Arc::new(manager(populated(), dir.path()));

        let permit = snapshots.gate.try_acquire().unwrap();
        assert!(matches!(
            snapshots.snapshot(SnapshotMode::Normal).await,
            Err(IndexError::Busy)
        ));
        assert!(matches!(
            snapshots.snapshot(SnapshotMode::Download).await,
            Err(IndexError::Busy)
        ));

        // end waits for the gate instead of failing
        let waiter = {
            let snapshots = Arc::clone(&snapshots);
            tokio::spawn(async move { snapshots.snapshot(SnapshotMode::End).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        let report = waiter.await.unwrap().unwrap();
        assert_eq!(report.mode, SnapshotMode::End);
    }

    #[tokio::test]
    async fn test_download_snapshot_writes_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = manager(populated(), dir.path());

        let report = snapshots.snapshot(SnapshotMode::Download).await.unwrap();
        let bundle = report.archive.unwrap();
        assert_eq!(bundle, dir.path().join(ARCHIVE_FILE));
        assert!(dir.path().join(DB_DIR).join("h1").is_file());
        assert!(!dir.path().join(DOWNLOAD_DIR).exists());

        let out = dir.path().join("unpacked");
        let n = archive::unpack(fs::File::open(&bundle).unwrap(), &out).unwrap();
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn test_rebuild_without_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(EndpointIndexMap::new(100));
        let report = manager(Arc::clone(&index), dir.path())
            .rebuild(&no_peers())
            .await
            .unwrap();

        assert_eq!(report.source, RebuildSource::Empty);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        manager(populated(), dir.path())
            .snapshot(SnapshotMode::Normal)
            .await
            .unwrap();

        let db = dir.path().join(DB_DIR);
        fs::write(db.join("garbage"), b"not json").unwrap();
        fs::write(db.join("future"), br#"{"version":99,"reported":true,"metrics":{}}"#).unwrap();
        fs::create_dir_all(db.join("subdir")).unwrap();

        let index = Arc::new(EndpointIndexMap::new(100));
        let report = manager(Arc::clone(&index), dir.path())
            .rebuild(&no_peers())
            .await
            .unwrap();

        assert_eq!(report.loaded, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(index.len(), 3);
        assert!(index.get_metric_index_map("future").is_none());
    }

    #[test]
    fn test_list_files_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("h1"), b"{}").unwrap();
        fs::write(dir.path().join("h2"), b"{}").unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();

        let mut files = list_files(dir.path()).unwrap();
        files.sort();
        assert_eq!(files, vec![dir.path().join("h1"), dir.path().join("h2")]);

        assert!(list_files(&dir.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn test_rebuild_from_peer() {
        // peer side: produce a bundle and serve it
        let peer_dir = tempfile::tempdir().unwrap();
        let bundle = manager(populated(), peer_dir.path())
            .snapshot(SnapshotMode::Download)
            .await
            .unwrap()
            .archive
            .unwrap();
        let bytes = fs::read(bundle).unwrap();

        // small frames so the body arrives in many chunks
        let app = Router::new().route(
            "/api/index/idxfile",
            get(move || async move {
                Body::from_stream(ReaderStream::with_capacity(io::Cursor::new(bytes), 64))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(EndpointIndexMap::new(100));
        let discovery = StaticDiscovery::new(
            "127.0.0.1:1",
            vec!["127.0.0.1:1".to_string(), addr.to_string()],
            Vec::new(),
        );

        let report = manager(Arc::clone(&index), dir.path())
            .rebuild(&discovery)
            .await
            .unwrap();

        assert_eq!(report.source, RebuildSource::Peer(addr.to_string()));
        assert_eq!(report.loaded, 3);
        assert_eq!(index.get_metrics_by("pod/a"), vec!["cpu.idle"]);
        assert!(!dir.path().join(PEER_BUNDLE_FILE).exists());
    }

    #[tokio::test]
    async fn test_rebuild_falls_back_to_local() {
        let dir = tempfile::tempdir().unwrap();
        manager(populated(), dir.path())
            .snapshot(SnapshotMode::Normal)
            .await
            .unwrap();

        // nothing listens on port 1
        let discovery = StaticDiscovery::new("", vec!["127.0.0.1:1".to_string()], Vec::new());
        let index = Arc::new(EndpointIndexMap::new(100));
        let report = manager(Arc::clone(&index), dir.path())
            .rebuild(&discovery)
            .await
            .unwrap();

        assert_eq!(report.source, RebuildSource::Local);
        assert_eq!(report.loaded, 3);
    }

    #[test]
    fn test_file_names() {
        assert_eq!(file_name("10.0.0.7"), "10.0.0.7");
        assert_eq!(file_name("pod/a"), "pod%2Fa");
        assert_eq!(endpoint_name("pod%2Fa").unwrap(), "pod/a");
        assert_eq!(endpoint_name(&file_name("a b/../c")).unwrap(), "a b/../c");
    }
}
