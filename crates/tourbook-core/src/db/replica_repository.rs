//! Replica repository: durable per-entity-type record collections

use crate::error::{Error, Result};
use crate::models::{
    EntityType, RecordId, RemoteRecord, RetryState, SyncStatus, SyncableRecord, WorkspaceId,
};
use libsql::Connection;

const RECORD_COLUMNS: &str = "workspace_id, entity_type, id, payload, sync_status, version,
    provisional_id, canonical_code, local_updated_at, local_revision, remote_updated_at,
    is_deleted, remote_snapshot, attempt_count, last_attempt_at, next_attempt_at, last_error,
    rejected";

const NEXT_PENDING_SEQ: &str = "(SELECT COALESCE(MAX(pending_seq), 0) + 1 FROM records)";

/// Who is writing a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOrigin {
    /// A UI/domain write: forces `pending`, stamps `local_updated_at = now`
    Local,
    /// The reconciliation engine or an explicit resolution: stored as given
    Reconciled,
}

/// Predicate for [`ReplicaRepository::count`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFilter {
    /// Every visible (non-tombstoned) record
    Live,
    /// Records in the given sync status, tombstones included
    Status(SyncStatus),
    /// Pending records the remote store permanently rejected
    Rejected,
}

/// Remote acceptance of a pushed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushAccepted {
    pub version: i64,
    pub server_timestamp: i64,
    pub canonical_code: Option<String>,
}

/// Outcome of merging one pulled remote record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// Local copy was absent or synced and now mirrors the remote
    Applied,
    /// Remote tombstone removed a synced local copy
    Purged,
    /// Local copy has unsynchronized writes; left untouched
    SkippedPending,
    /// Local copy is in conflict; left untouched
    SkippedConflict,
    /// Remote version is older than the local synced copy
    Stale,
    /// Remote tombstone for a record that is not stored locally
    Absent,
}

/// Trait for local replica storage operations (async)
///
/// Every method takes the owning workspace explicitly; no query ever runs
/// across workspaces.
#[allow(async_fn_in_trait)]
pub trait ReplicaRepository {
    /// All visible records of a type, most recently modified first
    async fn get_all(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
    ) -> Result<Vec<SyncableRecord>>;

    /// A record by id, tombstones included
    async fn get_by_id(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        id: &RecordId,
    ) -> Result<Option<SyncableRecord>>;

    /// Insert or update a record
    async fn put(
        &self,
        workspace: &WorkspaceId,
        record: &SyncableRecord,
        origin: PutOrigin,
    ) -> Result<SyncableRecord>;

    /// Physically remove a record
    async fn delete(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        id: &RecordId,
    ) -> Result<bool>;

    /// Count records of a type (or of every type when `None`) matching `filter`
    async fn count(
        &self,
        workspace: &WorkspaceId,
        entity_type: Option<&EntityType>,
        filter: RecordFilter,
    ) -> Result<usize>;

    /// Pending, non-rejected records due for a push at `now`, oldest pending first
    async fn list_due_for_push(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        now: i64,
    ) -> Result<Vec<SyncableRecord>>;

    /// Earliest scheduled retry among pending, non-rejected records of every type
    async fn next_retry_at(&self, workspace: &WorkspaceId) -> Result<Option<i64>>;

    /// Records in `status`, optionally restricted to one type
    async fn list_by_status(
        &self,
        workspace: &WorkspaceId,
        entity_type: Option<&EntityType>,
        status: SyncStatus,
    ) -> Result<Vec<SyncableRecord>>;

    /// Records whose payload contains `code` as a JSON string
    async fn list_mentioning(
        &self,
        workspace: &WorkspaceId,
        code: &str,
    ) -> Result<Vec<SyncableRecord>>;

    /// Apply a remote acceptance; only marks `synced` if no local write
    /// happened since `pushed` was read
    async fn mark_accepted(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
        accepted: &PushAccepted,
    ) -> Result<Option<SyncableRecord>>;

    /// Move a pending record into `conflict`, keeping its payload
    async fn mark_conflict(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
        snapshot: &RemoteRecord,
    ) -> Result<bool>;

    /// Store retry bookkeeping after a transient failure
    async fn record_retry(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
        retry: &RetryState,
    ) -> Result<bool>;

    /// Flag a pending record as permanently rejected
    async fn mark_rejected(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
        reason: &str,
        at: i64,
    ) -> Result<bool>;

    /// Remove a confirmed tombstone unless it was rewritten meanwhile
    async fn purge_tombstone(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
    ) -> Result<bool>;

    /// Replace a payload outside of a UI write, optionally re-queuing synced records
    async fn rewrite_payload(
        &self,
        workspace: &WorkspaceId,
        record: &SyncableRecord,
        payload: &serde_json::Value,
        requeue_if_synced: bool,
    ) -> Result<bool>;

    /// Merge one pulled remote record without clobbering local writes
    async fn apply_remote(
        &self,
        workspace: &WorkspaceId,
        remote: &RemoteRecord,
    ) -> Result<RemoteApply>;

    /// Last observed remote timestamp for a type
    async fn cursor(&self, workspace: &WorkspaceId, entity_type: &EntityType)
        -> Result<Option<i64>>;

    /// Advance the pull cursor (never moves backwards)
    async fn advance_cursor(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        remote_updated_at: i64,
    ) -> Result<()>;

    /// Next provisional code sequence for a code prefix
    ///
    /// Kinds sharing a prefix share the counter, so a provisional code is
    /// unique within the workspace.
    async fn next_provisional_sequence(&self, workspace: &WorkspaceId, prefix: &str)
        -> Result<i64>;
}

/// libSQL implementation of `ReplicaRepository`
pub struct LibSqlReplicaRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlReplicaRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn query_records(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<SyncableRecord>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_record(&row)?);
        }
        Ok(records)
    }

    async fn status_of(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        id: &RecordId,
    ) -> Result<Option<SyncStatus>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sync_status FROM records
                 WHERE workspace_id = ? AND entity_type = ? AND id = ?",
                libsql::params![workspace.as_str(), entity_type.as_str(), id.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<String>(0)?.parse()?)),
            None => Ok(None),
        }
    }

    /// Parse a record from a row selected with `RECORD_COLUMNS`
    fn parse_record(row: &libsql::Row) -> Result<SyncableRecord> {
        let workspace_id = WorkspaceId::new(row.get::<String>(0)?)?;
        let entity_type = EntityType::new(row.get::<String>(1)?)?;
        let id_text: String = row.get(2)?;
        let id = id_text
            .parse()
            .map_err(|_| Error::Database(format!("invalid record id '{id_text}'")))?;
        let payload = serde_json::from_str(&row.get::<String>(3)?)?;
        let remote_snapshot = row
            .get::<Option<String>>(12)?
            .map(|snapshot| serde_json::from_str::<RemoteRecord>(&snapshot))
            .transpose()?;

        Ok(SyncableRecord {
            entity_type,
            id,
            workspace_id,
            payload,
            sync_status: row.get::<String>(4)?.parse()?,
            version: row.get(5)?,
            provisional_id: row.get(6)?,
            canonical_code: row.get(7)?,
            local_updated_at: row.get(8)?,
            local_revision: row.get(9)?,
            remote_updated_at: row.get(10)?,
            is_deleted: row.get::<i64>(11)? != 0,
            remote_snapshot,
            retry: RetryState {
                attempt_count: u32::try_from(row.get::<i64>(13)?).unwrap_or(u32::MAX),
                last_attempt_at: row.get(14)?,
                next_attempt_at: row.get(15)?,
                last_error: row.get(16)?,
                rejected: row.get::<i64>(17)? != 0,
            },
        })
    }
}

impl ReplicaRepository for LibSqlReplicaRepository<'_> {
    async fn get_all(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
    ) -> Result<Vec<SyncableRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM records
                 WHERE workspace_id = ? AND entity_type = ? AND is_deleted = 0
                 ORDER BY local_updated_at DESC, id DESC"
            ),
            libsql::params![workspace.as_str(), entity_type.as_str()],
        )
        .await
    }

    async fn get_by_id(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        id: &RecordId,
    ) -> Result<Option<SyncableRecord>> {
        let mut records = self
            .query_records(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     WHERE workspace_id = ? AND entity_type = ? AND id = ?"
                ),
                libsql::params![workspace.as_str(), entity_type.as_str(), id.as_str()],
            )
            .await?;
        Ok(records.pop())
    }

    async fn put(
        &self,
        workspace: &WorkspaceId,
        record: &SyncableRecord,
        origin: PutOrigin,
    ) -> Result<SyncableRecord> {
        if &record.workspace_id != workspace {
            return Err(Error::TenantMismatch {
                expected: workspace.to_string(),
                found: record.workspace_id.to_string(),
            });
        }

        let payload = serde_json::to_string(&record.payload)?;
        match origin {
            PutOrigin::Local => {
                let now = chrono::Utc::now().timestamp_millis();
                self.conn
                    .execute(
                        &format!(
                            "INSERT INTO records (
                                workspace_id, entity_type, id, payload, sync_status, version,
                                provisional_id, local_updated_at, local_revision, is_deleted,
                                pending_seq
                            ) VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, 1, ?, {NEXT_PENDING_SEQ})
                            ON CONFLICT (workspace_id, entity_type, id) DO UPDATE SET
                                payload = excluded.payload,
                                is_deleted = excluded.is_deleted,
                                local_updated_at = excluded.local_updated_at,
                                local_revision = records.local_revision + 1,
                                sync_status = CASE
                                    WHEN records.sync_status = 'conflict' THEN 'conflict'
                                    ELSE 'pending'
                                END,
                                pending_seq = CASE
                                    WHEN records.sync_status = 'pending'
                                        AND records.pending_seq IS NOT NULL
                                        THEN records.pending_seq
                                    ELSE excluded.pending_seq
                                END,
                                attempt_count = 0,
                                last_attempt_at = NULL,
                                next_attempt_at = NULL,
                                last_error = NULL,
                                rejected = 0"
                        ),
                        libsql::params![
                            workspace.as_str(),
                            record.entity_type.as_str(),
                            record.id.as_str(),
                            payload,
                            record.provisional_id.clone(),
                            now,
                            i64::from(record.is_deleted)
                        ],
                    )
                    .await?;
            }
            PutOrigin::Reconciled => {
                let snapshot = record
                    .remote_snapshot
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                self.conn
                    .execute(
                        &format!(
                            "INSERT INTO records (
                                workspace_id, entity_type, id, payload, sync_status, version,
                                provisional_id, canonical_code, local_updated_at, local_revision,
                                remote_updated_at, is_deleted, remote_snapshot, attempt_count,
                                last_attempt_at, next_attempt_at, last_error, rejected, pending_seq
                            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                                CASE WHEN ? = 'pending' THEN {NEXT_PENDING_SEQ} END)
                            ON CONFLICT (workspace_id, entity_type, id) DO UPDATE SET
                                payload = excluded.payload,
                                sync_status = excluded.sync_status,
                                version = excluded.version,
                                provisional_id = excluded.provisional_id,
                                canonical_code = excluded.canonical_code,
                                local_updated_at = excluded.local_updated_at,
                                local_revision = records.local_revision + 1,
                                remote_updated_at = excluded.remote_updated_at,
                                is_deleted = excluded.is_deleted,
                                remote_snapshot = excluded.remote_snapshot,
                                attempt_count = excluded.attempt_count,
                                last_attempt_at = excluded.last_attempt_at,
                                next_attempt_at = excluded.next_attempt_at,
                                last_error = excluded.last_error,
                                rejected = excluded.rejected,
                                pending_seq = CASE
                                    WHEN excluded.sync_status != 'pending' THEN NULL
                                    WHEN records.sync_status = 'pending'
                                        AND records.pending_seq IS NOT NULL
                                        THEN records.pending_seq
                                    ELSE excluded.pending_seq
                                END"
                        ),
                        libsql::params![
                            workspace.as_str(),
                            record.entity_type.as_str(),
                            record.id.as_str(),
                            payload,
                            record.sync_status.as_str(),
                            record.version,
                            record.provisional_id.clone(),
                            record.canonical_code.clone(),
                            record.local_updated_at,
                            record.local_revision,
                            record.remote_updated_at,
                            i64::from(record.is_deleted),
                            snapshot,
                            i64::from(record.retry.attempt_count),
                            record.retry.last_attempt_at,
                            record.retry.next_attempt_at,
                            record.retry.last_error.clone(),
                            i64::from(record.retry.rejected),
                            record.sync_status.as_str()
                        ],
                    )
                    .await?;
            }
        }

        self.get_by_id(workspace, &record.entity_type, &record.id)
            .await?
            .ok_or_else(|| {
                Error::Database(format!(
                    "record {}:{} was not persisted",
                    record.entity_type, record.id
                ))
            })
    }

    async fn delete(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        id: &RecordId,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM records WHERE workspace_id = ? AND entity_type = ? AND id = ?",
                libsql::params![workspace.as_str(), entity_type.as_str(), id.as_str()],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn count(
        &self,
        workspace: &WorkspaceId,
        entity_type: Option<&EntityType>,
        filter: RecordFilter,
    ) -> Result<usize> {
        let condition = match filter {
            RecordFilter::Live => "is_deleted = 0",
            RecordFilter::Status(SyncStatus::Pending) => "sync_status = 'pending'",
            RecordFilter::Status(SyncStatus::Synced) => "sync_status = 'synced'",
            RecordFilter::Status(SyncStatus::Conflict) => "sync_status = 'conflict'",
            RecordFilter::Rejected => "sync_status = 'pending' AND rejected = 1",
        };
        // An absent type matches every type via `? IS NULL`
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT COUNT(*) FROM records
                     WHERE workspace_id = ? AND (? IS NULL OR entity_type = ?) AND {condition}"
                ),
                libsql::params![
                    workspace.as_str(),
                    entity_type.map(ToString::to_string),
                    entity_type.map(ToString::to_string)
                ],
            )
            .await?;

        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn list_due_for_push(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        now: i64,
    ) -> Result<Vec<SyncableRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM records
                 WHERE workspace_id = ? AND entity_type = ?
                   AND sync_status = 'pending' AND rejected = 0
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
                 ORDER BY pending_seq ASC, local_updated_at ASC"
            ),
            libsql::params![workspace.as_str(), entity_type.as_str(), now],
        )
        .await
    }

    async fn next_retry_at(&self, workspace: &WorkspaceId) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT MIN(next_attempt_at) FROM records
                 WHERE workspace_id = ? AND sync_status = 'pending' AND rejected = 0",
                libsql::params![workspace.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<Option<i64>>(0)?),
            None => Ok(None),
        }
    }

    async fn list_by_status(
        &self,
        workspace: &WorkspaceId,
        entity_type: Option<&EntityType>,
        status: SyncStatus,
    ) -> Result<Vec<SyncableRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM records
                 WHERE workspace_id = ? AND (? IS NULL OR entity_type = ?) AND sync_status = ?
                 ORDER BY entity_type ASC, local_updated_at DESC"
            ),
            libsql::params![
                workspace.as_str(),
                entity_type.map(ToString::to_string),
                entity_type.map(ToString::to_string),
                status.as_str()
            ],
        )
        .await
    }

    async fn list_mentioning(
        &self,
        workspace: &WorkspaceId,
        code: &str,
    ) -> Result<Vec<SyncableRecord>> {
        let needle = serde_json::to_string(code)?;
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM records
                 WHERE workspace_id = ? AND instr(payload, ?) > 0"
            ),
            libsql::params![workspace.as_str(), needle],
        )
        .await
    }

    async fn mark_accepted(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
        accepted: &PushAccepted,
    ) -> Result<Option<SyncableRecord>> {
        self.conn
            .execute(
                "UPDATE records SET
                    version = ?,
                    remote_updated_at = ?,
                    canonical_code = COALESCE(?, canonical_code),
                    provisional_id = CASE WHEN ? IS NULL THEN provisional_id ELSE NULL END,
                    sync_status = CASE WHEN local_revision = ? THEN 'synced' ELSE sync_status END,
                    pending_seq = CASE WHEN local_revision = ? THEN NULL ELSE pending_seq END,
                    attempt_count = 0,
                    last_attempt_at = NULL,
                    next_attempt_at = NULL,
                    last_error = NULL,
                    rejected = 0
                 WHERE workspace_id = ? AND entity_type = ? AND id = ? AND sync_status = 'pending'",
                libsql::params![
                    accepted.version,
                    accepted.server_timestamp,
                    accepted.canonical_code.clone(),
                    accepted.canonical_code.clone(),
                    pushed.local_revision,
                    pushed.local_revision,
                    workspace.as_str(),
                    pushed.entity_type.as_str(),
                    pushed.id.as_str()
                ],
            )
            .await?;

        self.get_by_id(workspace, &pushed.entity_type, &pushed.id)
            .await
    }

    async fn mark_conflict(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
        snapshot: &RemoteRecord,
    ) -> Result<bool> {
        let snapshot = serde_json::to_string(snapshot)?;
        let rows = self
            .conn
            .execute(
                "UPDATE records SET
                    sync_status = 'conflict',
                    remote_snapshot = ?,
                    pending_seq = NULL,
                    attempt_count = 0,
                    last_attempt_at = NULL,
                    next_attempt_at = NULL,
                    last_error = NULL
                 WHERE workspace_id = ? AND entity_type = ? AND id = ? AND sync_status = 'pending'",
                libsql::params![
                    snapshot,
                    workspace.as_str(),
                    pushed.entity_type.as_str(),
                    pushed.id.as_str()
                ],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn record_retry(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
        retry: &RetryState,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE records SET
                    attempt_count = ?,
                    last_attempt_at = ?,
                    next_attempt_at = ?,
                    last_error = ?
                 WHERE workspace_id = ? AND entity_type = ? AND id = ?
                   AND sync_status = 'pending' AND local_revision = ?",
                libsql::params![
                    i64::from(retry.attempt_count),
                    retry.last_attempt_at,
                    retry.next_attempt_at,
                    retry.last_error.clone(),
                    workspace.as_str(),
                    pushed.entity_type.as_str(),
                    pushed.id.as_str(),
                    pushed.local_revision
                ],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn mark_rejected(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
        reason: &str,
        at: i64,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE records SET rejected = 1, last_error = ?, last_attempt_at = ?
                 WHERE workspace_id = ? AND entity_type = ? AND id = ?
                   AND sync_status = 'pending' AND local_revision = ?",
                libsql::params![
                    reason,
                    at,
                    workspace.as_str(),
                    pushed.entity_type.as_str(),
                    pushed.id.as_str(),
                    pushed.local_revision
                ],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn purge_tombstone(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
    ) -> Result<bool> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM records
                 WHERE workspace_id = ? AND entity_type = ? AND id = ?
                   AND is_deleted = 1 AND local_revision = ?",
                libsql::params![
                    workspace.as_str(),
                    pushed.entity_type.as_str(),
                    pushed.id.as_str(),
                    pushed.local_revision
                ],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn rewrite_payload(
        &self,
        workspace: &WorkspaceId,
        record: &SyncableRecord,
        payload: &serde_json::Value,
        requeue_if_synced: bool,
    ) -> Result<bool> {
        let payload = serde_json::to_string(payload)?;
        let requeue = i64::from(requeue_if_synced);
        // SET expressions all see the pre-update row
        let rows = self
            .conn
            .execute(
                &format!(
                    "UPDATE records SET
                        payload = ?,
                        local_revision = local_revision + 1,
                        sync_status = CASE
                            WHEN ? = 1 AND sync_status = 'synced' THEN 'pending'
                            ELSE sync_status
                        END,
                        pending_seq = CASE
                            WHEN ? = 1 AND sync_status = 'synced' THEN {NEXT_PENDING_SEQ}
                            ELSE pending_seq
                        END
                     WHERE workspace_id = ? AND entity_type = ? AND id = ?"
                ),
                libsql::params![
                    payload,
                    requeue,
                    requeue,
                    workspace.as_str(),
                    record.entity_type.as_str(),
                    record.id.as_str()
                ],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn apply_remote(
        &self,
        workspace: &WorkspaceId,
        remote: &RemoteRecord,
    ) -> Result<RemoteApply> {
        if &remote.workspace_id != workspace {
            return Err(Error::TenantMismatch {
                expected: workspace.to_string(),
                found: remote.workspace_id.to_string(),
            });
        }

        let rows = if remote.deleted {
            self.conn
                .execute(
                    "DELETE FROM records
                     WHERE workspace_id = ? AND entity_type = ? AND id = ?
                       AND sync_status = 'synced'",
                    libsql::params![
                        workspace.as_str(),
                        remote.entity_type.as_str(),
                        remote.id.as_str()
                    ],
                )
                .await?
        } else {
            let payload = serde_json::to_string(&remote.payload)?;
            self.conn
                .execute(
                    "INSERT INTO records (
                        workspace_id, entity_type, id, payload, sync_status, version,
                        canonical_code, local_updated_at, local_revision, remote_updated_at,
                        is_deleted
                    ) VALUES (?, ?, ?, ?, 'synced', ?, ?, ?, 0, ?, 0)
                    ON CONFLICT (workspace_id, entity_type, id) DO UPDATE SET
                        payload = excluded.payload,
                        version = excluded.version,
                        canonical_code = excluded.canonical_code,
                        local_updated_at = excluded.local_updated_at,
                        local_revision = records.local_revision + 1,
                        remote_updated_at = excluded.remote_updated_at
                    WHERE records.sync_status = 'synced' AND records.version <= excluded.version",
                    libsql::params![
                        workspace.as_str(),
                        remote.entity_type.as_str(),
                        remote.id.as_str(),
                        payload,
                        remote.version,
                        remote.canonical_code.clone(),
                        remote.updated_at,
                        remote.updated_at
                    ],
                )
                .await?
        };

        if rows > 0 {
            return Ok(if remote.deleted {
                RemoteApply::Purged
            } else {
                RemoteApply::Applied
            });
        }

        Ok(
            match self
                .status_of(workspace, &remote.entity_type, &remote.id)
                .await?
            {
                Some(SyncStatus::Pending) => RemoteApply::SkippedPending,
                Some(SyncStatus::Conflict) => RemoteApply::SkippedConflict,
                Some(SyncStatus::Synced) => RemoteApply::Stale,
                None => RemoteApply::Absent,
            },
        )
    }

    async fn cursor(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
    ) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_remote_updated_at FROM sync_cursors
                 WHERE workspace_id = ? AND entity_type = ?",
                libsql::params![workspace.as_str(), entity_type.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn advance_cursor(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        remote_updated_at: i64,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_cursors (workspace_id, entity_type, last_remote_updated_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT (workspace_id, entity_type) DO UPDATE SET
                    last_remote_updated_at = MAX(
                        sync_cursors.last_remote_updated_at,
                        excluded.last_remote_updated_at
                    )",
                libsql::params![workspace.as_str(), entity_type.as_str(), remote_updated_at],
            )
            .await?;
        Ok(())
    }

    async fn next_provisional_sequence(
        &self,
        workspace: &WorkspaceId,
        prefix: &str,
    ) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "INSERT INTO provisional_counters (workspace_id, prefix, last_value)
                 VALUES (?, ?, 1)
                 ON CONFLICT (workspace_id, prefix) DO UPDATE SET
                    last_value = provisional_counters.last_value + 1
                 RETURNING last_value",
                libsql::params![workspace.as_str(), prefix],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Err(Error::Database(
                "provisional counter did not return a value".to_string(),
            )),
        }
    }
}
