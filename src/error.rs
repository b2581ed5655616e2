//! Error handling module
//!
//! Provides the unified error type for snapshotting, diffing, generation and
//! migration runs.

use std::path::PathBuf;
use thiserror::Error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Snapshot file {} is {size} bytes, larger than the {limit} byte limit", path.display())]
    SnapshotTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("Unsupported snapshot version: {0}")]
    UnsupportedSnapshotVersion(u32),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Unknown {kind} value: '{value}'")]
    UnknownEnumValue { kind: &'static str, value: String },

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Checksum mismatch for migration '{name}': recorded {expected}, file has {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Unsafe migration: {0}")]
    UnsafeMigration(String),

    #[error("Execution error: {0}")]
    Execution(String),
}

/// Result type alias for engine operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Helper function to create an invalid schema error
pub fn invalid_schema(msg: impl Into<String>) -> MigrateError {
    MigrateError::InvalidSchema(msg.into())
}

/// Helper function to create an unknown enum value error
pub fn unknown_value(kind: &'static str, value: impl Into<String>) -> MigrateError {
    MigrateError::UnknownEnumValue {
        kind,
        value: value.into(),
    }
}
