//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::cluster::StaticDiscovery;
use crate::persist::SnapshotConfig;
use crate::report::ReportConfig;
use crate::service::ServiceConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Index lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Entries not seen for this long are swept
    #[serde(default = "default_cache_duration")]
    pub cache_duration_secs: u64,

    #[serde(default = "default_clean_interval")]
    pub clean_interval_secs: u64,

    #[serde(default = "default_persist_interval")]
    pub persist_interval_secs: u64,

    #[serde(default = "default_persist_dir")]
    pub persist_dir: String,

    #[serde(default = "default_rebuild_workers")]
    pub rebuild_workers: usize,

    /// Cap on counters produced by one clude expansion
    #[serde(default = "default_max_query_count")]
    pub max_query_count: usize,

    /// Register new endpoints with the registry peers
    #[serde(default = "default_true")]
    pub report_endpoint: bool,
}

fn default_cache_duration() -> u64 {
    90_000 // 25 hours
}

fn default_clean_interval() -> u64 {
    3600
}

fn default_persist_interval() -> u64 {
    900
}

fn default_persist_dir() -> String {
    "./.index".to_string()
}

fn default_rebuild_workers() -> usize {
    20
}

fn default_max_query_count() -> usize {
    100_000
}

fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_duration_secs: default_cache_duration(),
            clean_interval_secs: default_clean_interval(),
            persist_interval_secs: default_persist_interval(),
            persist_dir: default_persist_dir(),
            rebuild_workers: default_rebuild_workers(),
            max_query_count: default_max_query_count(),
            report_endpoint: default_true(),
        }
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8030
}

fn default_max_body_size() -> usize {
    32 * 1024 * 1024 // 32 MB
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// Peer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// This instance's `host:port`, never used as a rebuild source
    #[serde(default)]
    pub identity: String,

    /// Other index instances
    #[serde(default)]
    pub index_peers: Vec<String>,

    /// Registry base URLs
    #[serde(default)]
    pub registry_peers: Vec<String>,

    #[serde(default = "default_registry_token")]
    pub registry_token: String,

    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_report_timeout")]
    pub report_timeout_secs: u64,

    #[serde(default = "default_report_workers")]
    pub report_workers: usize,

    #[serde(default = "default_report_batch_size")]
    pub report_batch_size: usize,
}

fn default_registry_token() -> String {
    "index-builtin-token".to_string()
}

fn default_download_timeout() -> u64 {
    30
}

fn default_report_timeout() -> u64 {
    3
}

fn default_report_workers() -> usize {
    10
}

fn default_report_batch_size() -> usize {
    500
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            index_peers: Vec::new(),
            registry_peers: Vec::new(),
            registry_token: default_registry_token(),
            download_timeout_secs: default_download_timeout(),
            report_timeout_secs: default_report_timeout(),
            report_workers: default_report_workers(),
            report_batch_size: default_report_batch_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("indexd").join("config.toml")),
            Some(PathBuf::from("/etc/indexd/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Cache overrides
        if let Some(dir) = var("INDEXD_PERSIST_DIR") {
            self.cache.persist_dir = dir;
        }
        if let Some(enabled) = var("INDEXD_REPORT_ENDPOINT").and_then(|v| parse_bool(&v)) {
            self.cache.report_endpoint = enabled;
        }

        // API overrides
        if let Some(host) = var("INDEXD_API_HOST") {
            self.api.host = host;
        }
        if let Some(port) = var("INDEXD_API_PORT").and_then(|p| p.parse().ok()) {
            self.api.port = port;
        }

        // Cluster overrides
        if let Some(identity) = var("INDEXD_IDENTITY") {
            self.cluster.identity = identity;
        }
        if let Some(peers) = var("INDEXD_INDEX_PEERS") {
            self.cluster.index_peers = split_list(&peers);
        }
        if let Some(peers) = var("INDEXD_REGISTRY_PEERS") {
            self.cluster.registry_peers = split_list(&peers);
        }
        if let Some(token) = var("INDEXD_REGISTRY_TOKEN") {
            self.cluster.registry_token = token;
        }

        // Logging overrides
        if let Some(level) = var("INDEXD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("INDEXD_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Address the API server binds to
    pub fn addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }

    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            dir: PathBuf::from(&self.cache.persist_dir),
            rebuild_workers: self.cache.rebuild_workers,
            download_timeout: Duration::from_secs(self.cluster.download_timeout_secs),
        }
    }

    pub fn report_config(&self) -> ReportConfig {
        ReportConfig {
            token: self.cluster.registry_token.clone(),
            timeout: Duration::from_secs(self.cluster.report_timeout_secs),
            workers: self.cluster.report_workers,
            batch_size: self.cluster.report_batch_size,
            ..Default::default()
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            cache_duration: Duration::from_secs(self.cache.cache_duration_secs),
            clean_interval: Duration::from_secs(self.cache.clean_interval_secs),
            persist_interval: Duration::from_secs(self.cache.persist_interval_secs),
            report_endpoint: self.cache.report_endpoint,
        }
    }

    pub fn discovery(&self) -> StaticDiscovery {
        StaticDiscovery::new(
            self.cluster.identity.clone(),
            self.cluster.index_peers.clone(),
            self.cluster.registry_peers.clone(),
        )
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# indexd Configuration
#
# Environment variables override these settings:
# - INDEXD_PERSIST_DIR
# - INDEXD_REPORT_ENDPOINT
# - INDEXD_API_HOST
# - INDEXD_API_PORT
# - INDEXD_IDENTITY
# - INDEXD_INDEX_PEERS (comma separated)
# - INDEXD_REGISTRY_PEERS (comma separated)
# - INDEXD_REGISTRY_TOKEN
# - INDEXD_LOG_LEVEL
# - INDEXD_LOG_FORMAT

[cache]
# Entries not seen for this many seconds are swept
cache_duration_secs = 90000

# How often the sweeper runs (seconds)
clean_interval_secs = 3600

# How often the index is written to disk (seconds)
persist_interval_secs = 900

# Snapshot directory
persist_dir = "./.index"

# Parallel file loaders on startup
rebuild_workers = 20

# Maximum counters a single include/exclude query may expand to
max_query_count = 100000

# Register new endpoints with the registry peers
report_endpoint = true

[api]
host = "0.0.0.0"
port = 8030

# Maximum request body (bytes)
max_body_size = 33554432

[cluster]
# This instance's host:port as other peers see it
identity = ""

# Other index instances to rebuild from ("host:port")
index_peers = []

# Registry base URLs receiving new endpoints
registry_peers = []

# Token sent in the X-Srv-Token header
registry_token = "index-builtin-token"

download_timeout_secs = 30
report_timeout_secs = 3
report_workers = 10
report_batch_size = 500

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cache.cache_duration_secs, 90_000);
        assert_eq!(config.cache.clean_interval_secs, 3600);
        assert_eq!(config.cache.persist_interval_secs, 900);
        assert_eq!(config.cache.persist_dir, "./.index");
        assert_eq!(config.cache.rebuild_workers, 20);
        assert_eq!(config.cache.max_query_count, 100_000);
        assert!(config.cache.report_endpoint);
        assert_eq!(config.addr(), "0.0.0.0:8030");
    }

    #[test]
    fn test_default_template_parses_to_defaults() {
        let config = Config::parse(&generate_default_config()).unwrap();
        let defaults = Config::default();

        assert_eq!(config.cache.cache_duration_secs, defaults.cache.cache_duration_secs);
        assert_eq!(config.api.max_body_size, defaults.api.max_body_size);
        assert_eq!(config.cluster.registry_token, defaults.cluster.registry_token);
        assert_eq!(config.cluster.report_batch_size, 500);
    }

    #[test]
    fn test_partial_file() {
        let config = Config::parse(
            r#"
            [cache]
            persist_dir = "/var/lib/indexd"

            [cluster]
            registry_peers = ["http://r1:80"]
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.persist_dir, "/var/lib/indexd");
        assert_eq!(config.cache.rebuild_workers, 20);
        assert_eq!(config.cluster.registry_peers, vec!["http://r1:80"]);
        assert_eq!(config.api.port, 8030);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("INDEXD_PERSIST_DIR", "/tmp/idx"),
            ("INDEXD_API_PORT", "9000"),
            ("INDEXD_INDEX_PEERS", "a:1, b:2,,"),
            ("INDEXD_REPORT_ENDPOINT", "false"),
            ("INDEXD_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.cache.persist_dir, "/tmp/idx");
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.cluster.index_peers, vec!["a:1", "b:2"]);
        assert!(!config.cache.report_endpoint);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_invalid_port_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|name| (name == "INDEXD_API_PORT").then(|| "nope".to_string()));
        assert_eq!(config.api.port, 8030);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_derived_configs() {
        let config = Config::default();
        assert_eq!(config.snapshot_config().download_timeout, Duration::from_secs(30));
        assert_eq!(config.report_config().timeout, Duration::from_secs(3));
        assert_eq!(config.service_config().clean_interval, Duration::from_secs(3600));
    }
}
