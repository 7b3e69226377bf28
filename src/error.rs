//! GitQuorum Error Types

use thiserror::Error;

use crate::storage::ObjectId;

/// Result type alias for GitQuorum operations
pub type Result<T> = std::result::Result<T, Error>;

/// GitQuorum error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Object errors
    #[error("Object corrupt: claimed {claimed}, payload hashes to {actual}")]
    ObjectCorrupt { claimed: ObjectId, actual: ObjectId },

    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("Invalid object: {0}")]
    InvalidObject(String),

    // Ref errors
    #[error("Ref conflict on {name}: expected {expected}, found {current}")]
    RefConflict {
        name: String,
        expected: ObjectId,
        current: ObjectId,
    },

    // Replication errors
    #[error("Quorum unreachable: {acks}/{required} acknowledgements")]
    QuorumUnreachable { acks: usize, required: usize },

    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    // Repository errors
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Repository already exists: {0}")]
    RepositoryExists(String),

    #[error("Access denied to repository {0}")]
    AccessDenied(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Unexpected response: {0}")]
    Protocol(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QuorumUnreachable { .. }
                | Error::NodeUnreachable(_)
                | Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
        )
    }

    /// Check if this error means the write could not be replicated
    pub fn is_sync_failure(&self) -> bool {
        matches!(
            self,
            Error::QuorumUnreachable { .. }
                | Error::NodeUnreachable(_)
                | Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
        )
    }
}
