//! Error types for chapel-store.

use std::path::PathBuf;

/// Result type for chapel-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in chapel-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Queued operation not found.
    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be decoded.
    #[error("Corrupt record in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
}
