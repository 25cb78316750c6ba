//! Peer discovery
//!
//! The index talks to two kinds of peers:
//! - other index instances, which serve snapshot bundles for rebuild
//! - registry instances, which accept newly seen endpoints
//!
//! [`Discovery`] is the seam; [`StaticDiscovery`] serves fixed lists from
//! configuration and never returns this instance's own identity.

use async_trait::async_trait;

/// Source of peer addresses
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Other index instances (`host:port` or base URL)
    async fn index_peers(&self) -> Vec<String>;

    /// Registry base URLs
    async fn registry_peers(&self) -> Vec<String>;
}

/// Peer lists fixed at startup
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    identity: String,
    index_peers: Vec<String>,
    registry_peers: Vec<String>,
}

impl StaticDiscovery {
    pub fn new(
        identity: impl Into<String>,
        index_peers: Vec<String>,
        registry_peers: Vec<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            index_peers,
            registry_peers,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn index_peers(&self) -> Vec<String> {
        self.index_peers
            .iter()
            .filter(|peer| !peer.is_empty() && !is_self(peer, &self.identity))
            .cloned()
            .collect()
    }

    async fn registry_peers(&self) -> Vec<String> {
        self.registry_peers
            .iter()
            .filter(|peer| !peer.is_empty())
            .cloned()
            .collect()
    }
}

fn is_self(peer: &str, identity: &str) -> bool {
    if identity.is_empty() {
        return false;
    }
    let host = peer
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    host == identity
}

/// Prefix a bare `host:port` with `http://`
pub fn base_url(peer: &str) -> String {
    let peer = peer.trim_end_matches('/');
    if peer.starts_with("http://") || peer.starts_with("https://") {
        peer.to_string()
    } else {
        format!("http://{}", peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_discovery_excludes_self() {
        let discovery = StaticDiscovery::new(
            "10.0.0.1:8030",
            vec![
                "10.0.0.1:8030".to_string(),
                "http://10.0.0.1:8030/".to_string(),
                "10.0.0.2:8030".to_string(),
                String::new(),
            ],
            vec!["http://registry:80".to_string()],
        );

        assert_eq!(discovery.index_peers().await, vec!["10.0.0.2:8030"]);
        assert_eq!(discovery.registry_peers().await, vec!["http://registry:80"]);
    }

    #[tokio::test]
    async fn test_empty_identity_keeps_all_peers() {
        let discovery = StaticDiscovery::new("", vec!["a:1".to_string()], Vec::new());
        assert_eq!(discovery.index_peers().await, vec!["a:1"]);
        assert!(discovery.registry_peers().await.is_empty());
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("10.0.0.2:8030"), "http://10.0.0.2:8030");
        assert_eq!(base_url("https://idx.local/"), "https://idx.local");
    }
}
