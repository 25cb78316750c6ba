//! # indexd
//!
//! In-memory inverted index over time-series metric metadata. Answers
//! "which series exist" for the query layer of a monitoring system.
//!
//! ```text
//! endpoint ─► metric ─► TagKV    tag key → value → last seen
//!                    └► Counters "k1=v1,k2=v2" → last seen
//! ```
//!
//! ## Features
//!
//! - **Concurrent index**: four levels of read/write locks, readers never
//!   block each other
//! - **Freshness**: entries not observed within the cache window are swept
//! - **Snapshots**: one file per endpoint, written atomically, bundled as
//!   tar.gz for peers
//! - **Rebuild**: on startup from a random peer's bundle or the local snapshot
//! - **Registration**: newly seen endpoints are announced to a registry
//!
//! ## Modules
//!
//! - [`index`]: The endpoint → metric → tag index
//! - [`persist`]: Snapshot and rebuild
//! - [`report`]: Endpoint registration loop
//! - [`service`]: Background tasks and shutdown
//! - [`api`]: REST API server with Axum
//!
//! ## Quick Start
//!
//! ```rust
//! use indexd::index::{EndpointIndexMap, IndexItem, TagPair};
//!
//! let index = EndpointIndexMap::new(100_000);
//! let now = chrono::Utc::now().timestamp();
//!
//! index.push(&IndexItem::new("host-1", "cpu.idle").tag("core", "0"), now);
//! index.push(&IndexItem::new("host-1", "cpu.idle").tag("core", "1"), now);
//!
//! let counters = index
//!     .get_index_by_clude("host-1", "cpu.idle", &[TagPair::new("core", ["1"])], &[])
//!     .unwrap();
//! assert_eq!(counters, vec!["core=1"]);
//! ```

pub mod api;
pub mod cluster;
pub mod config;
pub mod index;
pub mod persist;
pub mod report;
pub mod service;

// Re-export top-level types for convenience
pub use index::{
    EndpointIndexMap, IndexError, IndexItem, IndexResult, IndexStats, MetricIndex,
    MetricIndexMap, TagPair,
};

pub use persist::{RebuildReport, RebuildSource, SnapshotConfig, SnapshotManager, SnapshotMode};

pub use cluster::{Discovery, StaticDiscovery};

pub use report::{ReportConfig, Reporter};

pub use service::{IndexService, ServiceConfig};

pub use api::{build_router, serve, ApiError, AppState};

pub use config::{ApiConfig as ConfigApiConfig, Config, ConfigError, LoggingConfig};
