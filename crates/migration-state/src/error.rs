//! Error types for migration state storage

use crate::models::MigrationId;
use thiserror::Error;

/// Migration state error type
#[derive(Error, Debug)]
pub enum Error {
    /// A context record is missing for an existing migration
    #[error("Migration context not found for migration {0}")]
    ContextNotFound(MigrationId),

    /// Migration record not found
    #[error("Migration not found: {0}")]
    MigrationNotFound(MigrationId),

    /// Stored records violate the single current migration invariant
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Sled storage error
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
