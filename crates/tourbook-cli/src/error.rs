use std::io;

use thiserror::Error;
use tourbook_core::remote::RemoteError;
use tourbook_core::ConfigError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tourbook_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Record not found: {0}")]
    RecordNotFound(String),
    #[error("Sync is not configured. Set TOURBOOK_REMOTE_URL (and TOURBOOK_API_TOKEN if required).")]
    SyncNotConfigured,
}
