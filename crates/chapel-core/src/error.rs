//! Error types for chapel-core.
//!
//! Lower layers fail in many ways; the offline core classifies those
//! failures before anything reaches the UI.
//!
//! # Propagation
//!
//! | Error | Raised by | Reaches the UI? |
//! |-------|-----------|-----------------|
//! | [`Error::DataUnavailable`] | interceptor reads with no network and no cache | yes |
//! | [`Error::Http`] | online mutations rejected by the server | yes |
//! | [`Error::Transport`] / [`Error::Timeout`] | replay and fetch attempts | no, folded into queue retries and sync stats |
//! | [`Error::Storage`] | SQLite failures | cache reads/writes swallow it; queue operations propagate |
//! | [`Error::InvalidConfig`] | configuration checks | yes, at startup |
//!
//! Retry exhaustion is deliberately not an error value: a dropped operation
//! is counted in the drain report and in `SyncStats::exhausted_operations`.
//! Missing platform support for background sync is not an error either;
//! those calls return `false`.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the offline core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Neither the network nor the cache could serve the request.
    #[error("Data unavailable for {endpoint}: offline and no cached copy")]
    DataUnavailable { endpoint: String },

    /// A mutation could not be sent or queued while offline.
    #[error("Cannot send {endpoint} while offline: queueing is disabled")]
    Offline { endpoint: String },

    /// The request never produced an HTTP response.
    #[error("Network error for {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {endpoint}")]
    Http { endpoint: String, status: u16 },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Local durable storage failed.
    #[error("Storage error: {0}")]
    Storage(#[from] chapel_store::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn data_unavailable(endpoint: impl Into<String>) -> Self {
        Self::DataUnavailable {
            endpoint: endpoint.into(),
        }
    }

    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn http(endpoint: impl Into<String>, status: u16) -> Self {
        Self::Http {
            endpoint: endpoint.into(),
            status,
        }
    }

    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether the network path itself failed (as opposed to a server answer).
    pub fn is_network_failure(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }
}

/// Result type alias using chapel-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::data_unavailable("/api/users");
        assert!(err.to_string().contains("/api/users"));

        let err = Error::http("/api/tasks/5", 409);
        assert_eq!(err.to_string(), "HTTP 409 from /api/tasks/5");

        let err = Error::timeout("replay op_1", Duration::from_secs(15));
        assert!(err.to_string().contains("15s"));
    }

    #[test]
    fn test_network_failure_classification() {
        assert!(Error::transport("/api", "connection refused").is_network_failure());
        assert!(Error::timeout("x", Duration::from_secs(1)).is_network_failure());
        assert!(!Error::http("/api", 500).is_network_failure());
        assert!(!Error::data_unavailable("/api").is_network_failure());
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: Error = chapel_store::Error::OperationNotFound("op_1".into()).into();
        assert!(matches!(err, Error::Storage(_)));
        assert!(err.to_string().contains("op_1"));
    }
}
