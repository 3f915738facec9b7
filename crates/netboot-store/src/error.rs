//! Repository errors

use thiserror::Error;

/// Errors that can occur when reading or writing netboot entities
#[derive(Debug, Error)]
pub enum StoreError {
    /// Entity does not exist or has been soft-deleted
    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness rule would be violated (lease IP, node IP, kernel name)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Text is not a six-octet MAC address
    #[error("Invalid MAC address: {0}")]
    InvalidMacAddress(String),

    /// Snapshot file could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot file could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
