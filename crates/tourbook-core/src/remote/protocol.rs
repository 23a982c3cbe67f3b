//! JSON bodies exchanged with the remote store.
//!
//! These are the domain records plus sync metadata; there is no other framing.

use serde::{Deserialize, Serialize};

use crate::models::{RecordId, RemoteRecord, SyncableRecord, WorkspaceId};

/// Header carrying the tenant of every request
pub const WORKSPACE_HEADER: &str = "X-Workspace-Id";

/// A local record as sent to the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingRecord {
    pub id: RecordId,
    pub workspace_id: WorkspaceId,
    pub payload: serde_json::Value,
    /// Placeholder code the remote should replace with a canonical one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisional_code: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl OutgoingRecord {
    pub fn from_local(record: &SyncableRecord) -> Self {
        Self {
            id: record.id,
            workspace_id: record.workspace_id.clone(),
            payload: record.payload.clone(),
            provisional_code: record.provisional_id.clone(),
            deleted: record.is_deleted,
        }
    }
}

/// Body of `POST /v1/records/{entity_type}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertRequest {
    #[serde(flatten)]
    pub record: OutgoingRecord,
    /// Remote version the local edit is based on
    pub basis_version: i64,
}

/// Body of a successful upsert (HTTP 200)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertAccepted {
    pub version: i64,
    pub server_timestamp: i64,
    #[serde(default)]
    pub canonical_code: Option<String>,
}

/// Body of a version conflict (HTTP 409)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictBody {
    pub error: String,
    pub remote: RemoteRecord,
}

/// Body of `GET /v1/records/{entity_type}?since=<ms>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaResponse {
    pub records: Vec<RemoteRecord>,
}

/// Error body of every non-2xx response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
