//! Shared local replica service used by the UI layer and the reconciliation engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::db::{
    Database, LibSqlReplicaRepository, LibSqlWorkspaceRepository, PushAccepted, PutOrigin,
    RecordFilter, RemoteApply, ReplicaRepository, WorkspaceRepository,
};
use crate::models::{
    EntityType, RecordId, RemoteRecord, RetryState, SyncStatus, SyncableRecord, Workspace,
    WorkspaceId,
};
use crate::Result;

/// Thread-safe handle to the durable local replica (L2).
///
/// Every call holds the connection lock for one repository operation, so a
/// single `put` is atomic with respect to concurrent UI writes and engine
/// write-backs.
#[derive(Clone)]
pub struct ReplicaStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl ReplicaStore {
    /// Open the replica at the given filesystem path.
    ///
    /// A file that is not a database is quarantined and replaced once.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = match Database::open(&db_path).await {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local replica at {} is unreadable: {}. Quarantining and starting fresh.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_files(&db_path)?;
                Database::open(&db_path).await?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory replica (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Filesystem location, `None` for in-memory replicas.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn is_corrupted_db_error(error: &crate::Error) -> bool {
        let message = error.to_string().to_ascii_lowercase();
        message.contains("file is not a database")
            || message.contains("database disk image is malformed")
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        if db_path.exists() {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let base_name = db_path
                .file_name()
                .map_or_else(|| "replica.db".into(), |name| name.to_string_lossy());
            let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local replica from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }

        let Some(parent) = db_path.parent() else {
            return Ok(());
        };
        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };
        // WAL/SHM sidecars of the quarantined file
        let sidecar_prefix = format!("{base_name}-");
        let dir = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            if file_name.to_string_lossy().starts_with(&sidecar_prefix) {
                let path = entry.path();
                std::fs::remove_file(&path)?;
                tracing::warn!("Removed stale local replica file {}", path.display());
            }
        }

        Ok(())
    }

    // Records

    /// List visible records of a type.
    pub async fn get_all(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
    ) -> Result<Vec<SyncableRecord>> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .get_all(workspace, entity_type)
            .await
    }

    /// Fetch a record by id (tombstones included).
    pub async fn get_by_id(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        id: &RecordId,
    ) -> Result<Option<SyncableRecord>> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .get_by_id(workspace, entity_type, id)
            .await
    }

    /// Persist a record.
    pub async fn put(
        &self,
        workspace: &WorkspaceId,
        record: &SyncableRecord,
        origin: PutOrigin,
    ) -> Result<SyncableRecord> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .put(workspace, record, origin)
            .await
    }

    /// Physically remove a record.
    pub async fn delete(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        id: &RecordId,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .delete(workspace, entity_type, id)
            .await
    }

    /// Count records matching `filter`.
    pub async fn count(
        &self,
        workspace: &WorkspaceId,
        entity_type: Option<&EntityType>,
        filter: RecordFilter,
    ) -> Result<usize> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .count(workspace, entity_type, filter)
            .await
    }

    pub async fn list_due_for_push(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        now: i64,
    ) -> Result<Vec<SyncableRecord>> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .list_due_for_push(workspace, entity_type, now)
            .await
    }

    pub async fn next_retry_at(&self, workspace: &WorkspaceId) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .next_retry_at(workspace)
            .await
    }

    pub async fn list_by_status(
        &self,
        workspace: &WorkspaceId,
        entity_type: Option<&EntityType>,
        status: SyncStatus,
    ) -> Result<Vec<SyncableRecord>> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .list_by_status(workspace, entity_type, status)
            .await
    }

    pub async fn list_mentioning(
        &self,
        workspace: &WorkspaceId,
        code: &str,
    ) -> Result<Vec<SyncableRecord>> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .list_mentioning(workspace, code)
            .await
    }

    // Engine write-backs

    pub async fn mark_accepted(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
        accepted: &PushAccepted,
    ) -> Result<Option<SyncableRecord>> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .mark_accepted(workspace, pushed, accepted)
            .await
    }

    pub async fn mark_conflict(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
        snapshot: &RemoteRecord,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .mark_conflict(workspace, pushed, snapshot)
            .await
    }

    pub async fn record_retry(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
        retry: &RetryState,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .record_retry(workspace, pushed, retry)
            .await
    }

    pub async fn mark_rejected(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
        reason: &str,
        at: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .mark_rejected(workspace, pushed, reason, at)
            .await
    }

    pub async fn purge_tombstone(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .purge_tombstone(workspace, pushed)
            .await
    }

    pub async fn rewrite_payload(
        &self,
        workspace: &WorkspaceId,
        record: &SyncableRecord,
        payload: &Value,
        requeue_if_synced: bool,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .rewrite_payload(workspace, record, payload, requeue_if_synced)
            .await
    }

    pub async fn apply_remote(
        &self,
        workspace: &WorkspaceId,
        remote: &RemoteRecord,
    ) -> Result<RemoteApply> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .apply_remote(workspace, remote)
            .await
    }

    pub async fn cursor(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
    ) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .cursor(workspace, entity_type)
            .await
    }

    pub async fn advance_cursor(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        remote_updated_at: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .advance_cursor(workspace, entity_type, remote_updated_at)
            .await
    }

    pub async fn next_provisional_sequence(
        &self,
        workspace: &WorkspaceId,
        prefix: &str,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        LibSqlReplicaRepository::new(db.connection())
            .next_provisional_sequence(workspace, prefix)
            .await
    }

    // Workspaces

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let db = self.db.lock().await;
        LibSqlWorkspaceRepository::new(db.connection()).list().await
    }

    pub async fn get_workspace(&self, id: &WorkspaceId) -> Result<Option<Workspace>> {
        let db = self.db.lock().await;
        LibSqlWorkspaceRepository::new(db.connection()).get(id).await
    }

    pub async fn save_workspace(&self, workspace: &Workspace) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlWorkspaceRepository::new(db.connection())
            .save(workspace)
            .await
    }

    pub async fn current_workspace(&self) -> Result<Option<Workspace>> {
        let db = self.db.lock().await;
        LibSqlWorkspaceRepository::new(db.connection())
            .current()
            .await
    }

    pub async fn set_current_workspace(&self, id: &WorkspaceId) -> Result<()> {
        let db = self.db.lock().await;
        LibSqlWorkspaceRepository::new(db.connection())
            .set_current(id)
            .await
    }
}
