//! Index error types
//!
//! Errors raised by the in-memory index, the snapshot protocol and the
//! peer-facing background loops.

use thiserror::Error;

/// Errors that can occur in the index layer
#[derive(Error, Debug)]
pub enum IndexError {
    /// Endpoint or metric absent from the index
    #[error("Index not found: endpoint={endpoint} metric={metric}")]
    NotFound { endpoint: String, metric: String },

    /// Cartesian expansion of a clude query exceeds the configured cap
    #[error(
        "Result too large: endpoint={endpoint} metric={metric} include={include} exclude={exclude} would yield {count} counters (limit {limit})"
    )]
    ResultTooLarge {
        endpoint: String,
        metric: String,
        include: String,
        exclude: String,
        count: u128,
        limit: usize,
    },

    /// A snapshot, download or rebuild already holds the gate
    #[error("Snapshot operation is already running")]
    Busy,

    /// Peer unreachable or replied with an error
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for IndexError {
    fn from(err: reqwest::Error) -> Self {
        IndexError::Transport(err.to_string())
    }
}

impl From<tokio::task::JoinError> for IndexError {
    fn from(err: tokio::task::JoinError) -> Self {
        IndexError::Io(std::io::Error::other(err))
    }
}

/// Result type alias for index operations
pub type IndexResult<T> = Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndexError::NotFound {
            endpoint: "h1".to_string(),
            metric: "cpu.idle".to_string(),
        };
        assert_eq!(err.to_string(), "Index not found: endpoint=h1 metric=cpu.idle");

        assert_eq!(
            IndexError::Busy.to_string(),
            "Snapshot operation is already running"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: IndexError = io_err.into();
        assert!(matches!(err, IndexError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: IndexError = json_err.into();
        assert!(matches!(err, IndexError::Serialization(_)));
    }
}
