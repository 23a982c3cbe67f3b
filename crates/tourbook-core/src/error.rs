//! Error types for tourbook-core

use thiserror::Error;

/// Result type alias using tourbook-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tourbook-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local replica failure that is not a libSQL error (e.g. a failed write-back)
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record or workspace not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A tenant-scoped operation ran without a current workspace
    #[error("No workspace is selected for this session")]
    NoTenant,

    /// A record or scope belongs to a different workspace than the session
    #[error("Workspace mismatch: expected {expected}, found {found}")]
    TenantMismatch { expected: String, found: String },

    /// Entity type is not registered with the engine
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    /// Operation is not valid for the record's sync status
    #[error("Invalid sync state: {0}")]
    InvalidState(String),
}
