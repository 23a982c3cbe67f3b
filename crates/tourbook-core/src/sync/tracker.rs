//! Read-only sync status projection over the local replica.
//!
//! Counts are recomputed from the replica on every call instead of being
//! pushed as events: the replica has no change notification of its own, and a
//! status indicator polling `snapshot()` is cheap.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use super::Connectivity;
use crate::db::RecordFilter;
use crate::error::Result;
use crate::models::{EntityType, RecordId, SyncStatus, WorkspaceId};
use crate::services::ReplicaStore;
use crate::tenant::TenantContext;

/// Why an entry landed in `errors[]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// The remote store permanently refused a record
    Rejected,
    /// Transient failures reached the retry ceiling
    RetriesExhausted,
    /// A delta query or authentication failed
    Remote,
}

/// One user-visible sync problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncErrorEntry {
    pub kind: SyncErrorKind,
    pub entity_type: Option<EntityType>,
    pub record_id: Option<RecordId>,
    pub message: String,
    /// Unix ms
    pub at: i64,
}

/// Coarse status for indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

/// Aggregate status of the current workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSnapshot {
    pub pending_count: usize,
    pub conflict_count: usize,
    /// Pending records excluded from automatic drains
    pub rejected_count: usize,
    pub is_syncing: bool,
    pub is_online: bool,
    pub errors: Vec<SyncErrorEntry>,
    /// Unix ms of the last cycle that completed without cancellation
    pub last_synced_at: Option<i64>,
}

impl SyncSnapshot {
    pub fn state(&self) -> SyncState {
        if !self.is_online {
            SyncState::Offline
        } else if self.is_syncing {
            SyncState::Syncing
        } else if !self.errors.is_empty() || self.conflict_count > 0 {
            SyncState::Error
        } else {
            SyncState::Synced
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    syncing: HashSet<WorkspaceId>,
    errors: HashMap<WorkspaceId, VecDeque<SyncErrorEntry>>,
    last_synced_at: HashMap<WorkspaceId, i64>,
}

/// Status projection for the current workspace
#[derive(Clone)]
pub struct SyncStateTracker {
    store: ReplicaStore,
    tenant: TenantContext,
    connectivity: Connectivity,
    max_errors: usize,
    state: Arc<Mutex<TrackerState>>,
}

impl SyncStateTracker {
    pub fn new(
        store: ReplicaStore,
        tenant: TenantContext,
        connectivity: Connectivity,
        max_errors: usize,
    ) -> Self {
        Self {
            store,
            tenant,
            connectivity,
            max_errors,
            state: Arc::new(Mutex::new(TrackerState::default())),
        }
    }

    /// Pending records of one type, or of every type when `None`
    pub async fn pending_count(&self, entity_type: Option<&EntityType>) -> Result<usize> {
        let scope = self.tenant.scope()?;
        self.store
            .count(
                scope.workspace_id(),
                entity_type,
                RecordFilter::Status(SyncStatus::Pending),
            )
            .await
    }

    /// Records in conflict of one type, or of every type when `None`
    pub async fn conflict_count(&self, entity_type: Option<&EntityType>) -> Result<usize> {
        let scope = self.tenant.scope()?;
        self.store
            .count(
                scope.workspace_id(),
                entity_type,
                RecordFilter::Status(SyncStatus::Conflict),
            )
            .await
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Whether a cycle is running for the current workspace
    pub fn is_syncing(&self) -> bool {
        self.tenant
            .current()
            .is_some_and(|workspace| self.lock().syncing.contains(&workspace))
    }

    pub async fn snapshot(&self) -> Result<SyncSnapshot> {
        let scope = self.tenant.scope()?;
        let workspace = scope.workspace_id();
        let pending_count = self
            .store
            .count(workspace, None, RecordFilter::Status(SyncStatus::Pending))
            .await?;
        let conflict_count = self
            .store
            .count(workspace, None, RecordFilter::Status(SyncStatus::Conflict))
            .await?;
        let rejected_count = self
            .store
            .count(workspace, None, RecordFilter::Rejected)
            .await?;

        let state = self.lock();
        Ok(SyncSnapshot {
            pending_count,
            conflict_count,
            rejected_count,
            is_syncing: state.syncing.contains(workspace),
            is_online: self.connectivity.is_online(),
            errors: state
                .errors
                .get(workspace)
                .map(|errors| errors.iter().cloned().collect())
                .unwrap_or_default(),
            last_synced_at: state.last_synced_at.get(workspace).copied(),
        })
    }

    pub(crate) fn begin_cycle(&self, workspace: &WorkspaceId) {
        self.lock().syncing.insert(workspace.clone());
    }

    pub(crate) fn end_cycle(&self, workspace: &WorkspaceId) {
        self.lock().syncing.remove(workspace);
    }

    pub(crate) fn mark_synced(&self, workspace: &WorkspaceId, at: i64) {
        self.lock().last_synced_at.insert(workspace.clone(), at);
    }

    /// Record a problem; a newer entry for the same record and kind replaces the older one
    pub(crate) fn report(&self, workspace: &WorkspaceId, entry: SyncErrorEntry) {
        let mut state = self.lock();
        let errors = state.errors.entry(workspace.clone()).or_default();
        if entry.record_id.is_some() {
            errors.retain(|existing| {
                existing.record_id != entry.record_id || existing.kind != entry.kind
            });
        }
        errors.push_back(entry);
        while errors.len() > self.max_errors {
            errors.pop_front();
        }
    }

    /// Forget errors of a record that has since synced or been resolved
    pub(crate) fn clear_record(&self, workspace: &WorkspaceId, record_id: &RecordId) {
        if let Some(errors) = self.lock().errors.get_mut(workspace) {
            errors.retain(|entry| entry.record_id.as_ref() != Some(record_id));
        }
    }

    /// Forget record-less errors once the remote is reachable again
    pub(crate) fn clear_remote_errors(&self, workspace: &WorkspaceId) {
        if let Some(errors) = self.lock().errors.get_mut(workspace) {
            errors.retain(|entry| entry.kind != SyncErrorKind::Remote);
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
