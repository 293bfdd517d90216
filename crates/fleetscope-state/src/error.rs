//! Error types for fleetscope-state

use thiserror::Error;

/// Errors raised while connecting to or initialising a backend.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    /// Filesystem error while preparing a local store
    #[error("Store directory unusable: {0}")]
    Io(#[from] std::io::Error),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the storage traits.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A keyed item does not exist.
    #[error("not found: {key}")]
    NotFound { key: String },

    /// A checkpoint run does not exist.
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// A checkpoint run is not in the state the operation requires.
    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// A fingerprint string is not a 64-char hex digest.
    #[error("invalid fingerprint: {value}")]
    InvalidFingerprint { value: String },

    /// Record could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Underlying backend failed (connection lost, query error, I/O).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
