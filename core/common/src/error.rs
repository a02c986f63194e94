//! Common error types for OfflineKit.

use thiserror::Error;

/// Top-level error type for OfflineKit operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Copying or recreating a database failed partway through a migration.
    #[error("Schema migration error: {0}")]
    SchemaMigration(String),

    /// A read targeted a database or table that does not exist.
    #[error("Database missing: {0}")]
    DatabaseMissing(String),

    /// An atomic multi-table write failed and was rolled back.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A recorded dependency names a service that cannot be resolved.
    #[error("Reconciliation lookup error: {0}")]
    ReconciliationLookup(String),

    /// A database or table handle was used after the database was recreated or deleted.
    #[error("Stale handle: {0}")]
    StaleHandle(String),

    /// Storage engine failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
