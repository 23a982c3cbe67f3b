//! Tenant (workspace) context for a session.
//!
//! `TenantContext` is a cheap, cloneable handle passed explicitly to the
//! store and the reconciliation engine. Every tenant-scoped operation first
//! takes a [`TenantScope`], which pins the workspace id together with the
//! context's epoch. Switching or clearing the workspace bumps the epoch, so
//! work started under an older scope can detect that its results are stale.

use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::models::{Workspace, WorkspaceId};
use crate::services::ReplicaStore;

#[derive(Debug, Default)]
struct TenantState {
    workspace: Option<Workspace>,
    epoch: u64,
}

/// Shared handle to the session's current workspace
#[derive(Debug, Clone, Default)]
pub struct TenantContext {
    state: Arc<RwLock<TenantState>>,
}

/// A workspace id pinned to the context epoch it was taken at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantScope {
    workspace_id: WorkspaceId,
    epoch: u64,
}

impl TenantScope {
    pub const fn workspace_id(&self) -> &WorkspaceId {
        &self.workspace_id
    }

    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Fail unless `workspace_id` is the workspace of this scope
    pub fn ensure_owns(&self, workspace_id: &WorkspaceId) -> Result<()> {
        if &self.workspace_id == workspace_id {
            Ok(())
        } else {
            Err(Error::TenantMismatch {
                expected: self.workspace_id.to_string(),
                found: workspace_id.to_string(),
            })
        }
    }
}

impl TenantContext {
    /// Context with no workspace selected
    pub fn new() -> Self {
        Self::default()
    }

    /// Context with `workspace` already selected
    pub fn with_workspace(workspace: Workspace) -> Self {
        let context = Self::new();
        context.switch(workspace);
        context
    }

    /// Context with the workspace the replica last had selected, if any
    pub async fn restore(store: &ReplicaStore) -> Result<Self> {
        Ok(store
            .current_workspace()
            .await?
            .map_or_else(Self::new, Self::with_workspace))
    }

    /// Current workspace id, if any
    pub fn current(&self) -> Option<WorkspaceId> {
        self.read(|state| state.workspace.as_ref().map(|ws| ws.id.clone()))
    }

    /// Current workspace, if any
    pub fn workspace(&self) -> Option<Workspace> {
        self.read(|state| state.workspace.clone())
    }

    pub fn epoch(&self) -> u64 {
        self.read(|state| state.epoch)
    }

    /// Pin the current workspace for a scoped operation
    ///
    /// Fails with [`Error::NoTenant`] when no workspace is selected, so that
    /// nothing ever runs tenant-less.
    pub fn scope(&self) -> Result<TenantScope> {
        self.read(|state| {
            state
                .workspace
                .as_ref()
                .map(|ws| TenantScope {
                    workspace_id: ws.id.clone(),
                    epoch: state.epoch,
                })
                .ok_or(Error::NoTenant)
        })
    }

    /// Whether `scope` still describes the current workspace selection
    pub fn is_current(&self, scope: &TenantScope) -> bool {
        self.read(|state| {
            state.epoch == scope.epoch
                && state
                    .workspace
                    .as_ref()
                    .is_some_and(|ws| ws.id == scope.workspace_id)
        })
    }

    /// Select `workspace`, invalidating every scope taken before
    pub fn switch(&self, workspace: Workspace) -> TenantScope {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.epoch = state.epoch.wrapping_add(1);
        let scope = TenantScope {
            workspace_id: workspace.id.clone(),
            epoch: state.epoch,
        };
        tracing::info!(workspace = %workspace.id, epoch = state.epoch, "Switched workspace");
        state.workspace = Some(workspace);
        scope
    }

    /// Drop the workspace selection (session end)
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.epoch = state.epoch.wrapping_add(1);
        state.workspace = None;
    }

    fn read<T>(&self, f: impl FnOnce(&TenantState) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(id: &str) -> Workspace {
        Workspace::new(WorkspaceId::new(id).unwrap(), id.to_uppercase())
    }

    #[test]
    fn test_scope_requires_workspace() {
        let context = TenantContext::new();
        assert!(context.current().is_none());
        assert!(matches!(context.scope(), Err(Error::NoTenant)));
    }

    #[test]
    fn test_switch_invalidates_old_scopes() {
        let context = TenantContext::with_workspace(workspace("a"));
        let scope_a = context.scope().unwrap();
        assert!(context.is_current(&scope_a));

        context.switch(workspace("b"));
        assert!(!context.is_current(&scope_a));
        assert_eq!(context.current().unwrap().as_str(), "b");
    }

    #[test]
    fn test_switch_back_to_same_workspace_still_invalidates() {
        let context = TenantContext::with_workspace(workspace("a"));
        let scope = context.scope().unwrap();
        context.switch(workspace("b"));
        context.switch(workspace("a"));
        assert!(!context.is_current(&scope));
    }

    #[test]
    fn test_clear_removes_workspace() {
        let context = TenantContext::with_workspace(workspace("a"));
        let scope = context.scope().unwrap();
        context.clear();
        assert!(!context.is_current(&scope));
        assert!(context.scope().is_err());
    }

    #[test]
    fn test_clones_share_state() {
        let context = TenantContext::new();
        let handle = context.clone();
        context.switch(workspace("a"));
        assert_eq!(handle.current().unwrap().as_str(), "a");
    }

    #[test]
    fn test_ensure_owns() {
        let context = TenantContext::with_workspace(workspace("a"));
        let scope = context.scope().unwrap();
        assert!(scope.ensure_owns(&WorkspaceId::new("a").unwrap()).is_ok());
        assert!(matches!(
            scope.ensure_owns(&WorkspaceId::new("b").unwrap()),
            Err(Error::TenantMismatch { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restore_reloads_current_workspace() {
        let store = ReplicaStore::open_in_memory().await.unwrap();
        assert!(TenantContext::restore(&store).await.unwrap().current().is_none());

        let selected = workspace("a");
        store.save_workspace(&selected).await.unwrap();
        store.set_current_workspace(&selected.id).await.unwrap();

        let context = TenantContext::restore(&store).await.unwrap();
        assert_eq!(context.current(), Some(selected.id));
    }
}
