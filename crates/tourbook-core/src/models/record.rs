//! Syncable record model

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use uuid::Uuid;

use super::WorkspaceId;
use crate::error::{Error, Result};

static ENTITY_TYPE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("Invalid regex"));

/// Name of a table/collection, e.g. `tours` or `orders`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityType(String);

impl EntityType {
    /// Validate and wrap an entity type name
    ///
    /// Names must match `^[a-z][a-z0-9_]*$`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if ENTITY_TYPE_PATTERN.is_match(&name) {
            Ok(Self(name))
        } else {
            Err(Error::InvalidInput(format!(
                "entity type '{name}' must match [a-z][a-z0-9_]*"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for EntityType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.0
    }
}

/// Stable record identifier, assigned client-side using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Synchronization state of a local record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local write not yet confirmed by the remote store
    Pending,
    /// Local copy matches what the remote store accepted
    Synced,
    /// Remote version diverged from the local write's basis version
    Conflict,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            other => Err(Error::InvalidInput(format!("unknown sync status '{other}'"))),
        }
    }
}

/// A record as the remote store currently holds it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub entity_type: EntityType,
    pub id: RecordId,
    pub workspace_id: WorkspaceId,
    pub payload: serde_json::Value,
    /// Monotonic per-record version assigned by the remote store
    pub version: i64,
    /// Server timestamp of the last accepted write (Unix ms)
    pub updated_at: i64,
    #[serde(default)]
    pub canonical_code: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

/// Retry bookkeeping for a pending record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Consecutive failed push attempts
    pub attempt_count: u32,
    pub last_attempt_at: Option<i64>,
    /// Earliest time (Unix ms) the next push may be attempted
    pub next_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    /// Permanently rejected by the remote store; excluded from automatic drains
    pub rejected: bool,
}

/// The unit of synchronization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    pub entity_type: EntityType,
    pub id: RecordId,
    /// Owning workspace, fixed at creation
    pub workspace_id: WorkspaceId,
    /// Domain fields, opaque to the engine
    pub payload: serde_json::Value,
    pub sync_status: SyncStatus,
    /// Remote version the local edit is based on (0 = never synced)
    pub version: i64,
    /// Temporary user-facing code issued before the remote assigns one
    pub provisional_id: Option<String>,
    /// Code assigned by the remote store
    pub canonical_code: Option<String>,
    /// Last local modification (Unix ms)
    pub local_updated_at: i64,
    /// Bumped on every local write; lets write-backs detect interleaved edits
    pub local_revision: i64,
    /// Server timestamp of the last confirmed sync (Unix ms)
    pub remote_updated_at: Option<i64>,
    /// Tombstone awaiting remote confirmation
    pub is_deleted: bool,
    /// Last-known remote version, kept while in conflict
    pub remote_snapshot: Option<RemoteRecord>,
    pub retry: RetryState,
}

impl SyncableRecord {
    /// Create a new pending record owned by `workspace_id`
    #[must_use]
    pub fn new(
        entity_type: EntityType,
        workspace_id: WorkspaceId,
        payload: serde_json::Value,
    ) -> Self {
        Self::with_id(entity_type, RecordId::new(), workspace_id, payload)
    }

    /// Create a new pending record with a caller-chosen id
    #[must_use]
    pub fn with_id(
        entity_type: EntityType,
        id: RecordId,
        workspace_id: WorkspaceId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            entity_type,
            id,
            workspace_id,
            payload,
            sync_status: SyncStatus::Pending,
            version: 0,
            provisional_id: None,
            canonical_code: None,
            local_updated_at: chrono::Utc::now().timestamp_millis(),
            local_revision: 0,
            remote_updated_at: None,
            is_deleted: false,
            remote_snapshot: None,
            retry: RetryState::default(),
        }
    }

    /// Build a synced local copy from a remote record
    #[must_use]
    pub fn from_remote(remote: RemoteRecord) -> Self {
        Self {
            entity_type: remote.entity_type,
            id: remote.id,
            workspace_id: remote.workspace_id,
            payload: remote.payload,
            sync_status: SyncStatus::Synced,
            version: remote.version,
            provisional_id: None,
            canonical_code: remote.canonical_code,
            local_updated_at: remote.updated_at,
            local_revision: 0,
            remote_updated_at: Some(remote.updated_at),
            is_deleted: false,
            remote_snapshot: None,
            retry: RetryState::default(),
        }
    }

    /// User-facing code: canonical when known, provisional otherwise
    pub fn display_code(&self) -> Option<&str> {
        self.canonical_code
            .as_deref()
            .or(self.provisional_id.as_deref())
    }

    pub fn is_pending(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }

    pub fn is_conflict(&self) -> bool {
        self.sync_status == SyncStatus::Conflict
    }
}

/// Replace every JSON string equal to `from` with `to`, returning the number of replacements
pub fn rewrite_references(value: &mut serde_json::Value, from: &str, to: &str) -> usize {
    match value {
        serde_json::Value::String(text) if text == from => {
            *text = to.to_string();
            1
        }
        serde_json::Value::Array(items) => items
            .iter_mut()
            .map(|item| rewrite_references(item, from, to))
            .sum(),
        serde_json::Value::Object(map) => map
            .values_mut()
            .map(|item| rewrite_references(item, from, to))
            .sum(),
        _ => 0,
    }
}
