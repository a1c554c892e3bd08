//! Error types for the history crate

use crate::schema::SchemaVersion;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during history operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored property bag could not be encoded or decoded
    #[error("invalid stored value: {0}")]
    Json(#[from] serde_json::Error),

    /// A write was attempted before the database was opened
    #[error("configuration database is not open")]
    NotOpened,

    /// The database holds no schema yet
    #[error("configuration database is not initialized")]
    Uninitialized,

    /// The on-disk schema is newer than, or unrelated to, what this build knows
    #[error("unsupported configuration database schema version {0}")]
    UnsupportedSchemaVersion(SchemaVersion),

    /// A stored version component is not a valid version number
    #[error("unsupported configuration database schema {name} {value}")]
    InvalidSchemaVersion { name: String, value: i64 },

    /// The operation needs a newer schema than the database has
    #[error("{operation} is not supported by schema version {version}")]
    NotSupported {
        operation: &'static str,
        version: SchemaVersion,
    },

    /// No set with this instance identifier is stored
    #[error("configuration set {0} not found in history")]
    SetNotFound(Uuid),
}

/// Result type for history operations
pub type Result<T> = std::result::Result<T, Error>;
