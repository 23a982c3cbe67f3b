//! Remote store contract and its implementations.
//!
//! The engine only sees [`RemoteStore`]: an upsert with a basis version and a
//! delta query, both scoped to a workspace. The remote side enforces tenant
//! isolation on its own as well.

pub mod authority;
mod http;
mod memory;
pub mod protocol;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{EntityType, RemoteRecord, WorkspaceId};
use protocol::OutgoingRecord;

pub use http::HttpRemoteStore;
pub use memory::{InMemoryRemoteStore, RemoteFault};

/// Result of pushing one record
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// Stored; the remote may have assigned a canonical code
    Accepted {
        canonical_code: Option<String>,
        version: i64,
        server_timestamp: i64,
    },
    /// The remote record changed since the basis version
    Conflict(RemoteRecord),
    /// Permanently refused (validation, tenant mismatch, ...)
    Rejected { reason: String },
}

/// Transport-level failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote store unavailable (HTTP {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Malformed response: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// Failures worth retrying with backoff
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network(_) | Self::Unavailable { .. }
        )
    }

    /// Failures that retrying the same request can never fix
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Multi-tenant store reachable over an unreliable network
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create or update `record` in `workspace`, based on `basis_version`
    async fn upsert(
        &self,
        entity_type: &EntityType,
        workspace: &WorkspaceId,
        record: &OutgoingRecord,
        basis_version: i64,
    ) -> Result<UpsertOutcome, RemoteError>;

    /// Records of `entity_type` in `workspace` updated strictly after `since`
    async fn query_updated_since(
        &self,
        entity_type: &EntityType,
        workspace: &WorkspaceId,
        since: Option<i64>,
    ) -> Result<Vec<RemoteRecord>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(RemoteError::Timeout.is_transient());
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(RemoteError::Unavailable {
            status: 503,
            message: "maintenance".into()
        }
        .is_transient());
        assert!(!RemoteError::Unauthorized("expired".into()).is_transient());
        assert!(RemoteError::Rejected("bad".into()).is_permanent());
        assert!(!RemoteError::Protocol("eof".into()).is_permanent());
    }
}
