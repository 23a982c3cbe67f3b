//! Durable record storage for every tenant, in one libSQL file

use chrono::Utc;
use libsql::{params, Builder, Connection, Database};
use tokio::sync::Mutex;
use tourbook_core::models::{EntityType, RecordId, RemoteRecord, WorkspaceId};
use tourbook_core::remote::authority::{canonicalize_payload, decide_upsert, UpsertDecision};
use tourbook_core::remote::protocol::{UpsertAccepted, UpsertRequest};

use crate::error::AppError;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS remote_records (
    workspace_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    id TEXT NOT NULL,
    payload TEXT NOT NULL,
    version INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    canonical_code TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (workspace_id, entity_type, id)
);
CREATE INDEX IF NOT EXISTS idx_remote_records_delta
    ON remote_records(workspace_id, entity_type, updated_at);
CREATE TABLE IF NOT EXISTS code_counters (
    workspace_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    last_value INTEGER NOT NULL,
    PRIMARY KEY (workspace_id, entity_type)
);
";

const SELECT_COLUMNS: &str =
    "entity_type, id, workspace_id, payload, version, updated_at, canonical_code, deleted";

pub struct RecordStore {
    _db: Database,
    conn: Connection,
    /// Last issued server timestamp; held for the whole upsert so writes serialize
    clock: Mutex<i64>,
}

impl RecordStore {
    pub async fn open(path: &str) -> Result<Self, AppError> {
        let db = Builder::new_local(path).build().await?;
        let store = Self::from_database(db).await?;
        tracing::info!(path, "Opened record store");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, AppError> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::from_database(db).await
    }

    async fn from_database(db: Database) -> Result<Self, AppError> {
        let conn = db.connect()?;
        conn.execute("PRAGMA journal_mode = WAL;", ()).await.ok();
        conn.execute_batch(SCHEMA).await?;

        let mut rows = conn
            .query("SELECT COALESCE(MAX(updated_at), 0) FROM remote_records", ())
            .await?;
        let clock: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };

        Ok(Self {
            _db: db,
            conn,
            clock: Mutex::new(clock),
        })
    }

    pub async fn get(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        id: &RecordId,
    ) -> Result<Option<RemoteRecord>, AppError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM remote_records
                     WHERE workspace_id = ? AND entity_type = ? AND id = ?"
                ),
                params![workspace.as_str(), entity_type.as_str(), id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Apply an upsert scoped to `workspace`; conflicts and rejections come back as errors
    pub async fn upsert(
        &self,
        entity_type: &EntityType,
        workspace: &WorkspaceId,
        request: &UpsertRequest,
    ) -> Result<UpsertAccepted, AppError> {
        let record = &request.record;
        let mut clock = self.clock.lock().await;
        let existing = self.get(workspace, entity_type, &record.id).await?;

        match decide_upsert(existing.as_ref(), record, request.basis_version) {
            UpsertDecision::Write { version } => {
                let mut canonical_code = existing.and_then(|stored| stored.canonical_code);
                if canonical_code.is_none() && record.provisional_code.is_some() {
                    canonical_code = Some(self.next_code(workspace, entity_type).await?);
                }
                *clock = Utc::now().timestamp_millis().max(*clock + 1);
                let server_timestamp = *clock;
                let payload = canonicalize_payload(record, canonical_code.as_deref());

                self.conn
                    .execute(
                        "INSERT INTO remote_records
                            (workspace_id, entity_type, id, payload, version, updated_at, canonical_code, deleted)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                         ON CONFLICT(workspace_id, entity_type, id) DO UPDATE SET
                            payload = excluded.payload,
                            version = excluded.version,
                            updated_at = excluded.updated_at,
                            canonical_code = excluded.canonical_code,
                            deleted = excluded.deleted",
                        params![
                            workspace.as_str(),
                            entity_type.as_str(),
                            record.id.to_string(),
                            serde_json::to_string(&payload)?,
                            version,
                            server_timestamp,
                            canonical_code.clone(),
                            i64::from(record.deleted)
                        ],
                    )
                    .await?;

                Ok(UpsertAccepted {
                    version,
                    server_timestamp,
                    canonical_code,
                })
            }
            UpsertDecision::Replay => {
                let stored = existing.ok_or_else(|| AppError::unprocessable("nothing to replay"))?;
                Ok(UpsertAccepted {
                    version: stored.version,
                    server_timestamp: stored.updated_at,
                    canonical_code: stored.canonical_code,
                })
            }
            UpsertDecision::Conflict => match existing {
                Some(stored) => Err(AppError::Conflict(Box::new(stored))),
                None => Err(AppError::unprocessable("conflict without a stored record")),
            },
            UpsertDecision::Reject(reason) => Err(AppError::unprocessable(reason)),
        }
    }

    /// Records of one type changed strictly after `since`, oldest first
    pub async fn updated_since(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
        since: Option<i64>,
    ) -> Result<Vec<RemoteRecord>, AppError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM remote_records
                     WHERE workspace_id = ? AND entity_type = ? AND updated_at > ?
                     ORDER BY updated_at ASC"
                ),
                params![
                    workspace.as_str(),
                    entity_type.as_str(),
                    since.unwrap_or(i64::MIN)
                ],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn next_code(
        &self,
        workspace: &WorkspaceId,
        entity_type: &EntityType,
    ) -> Result<String, AppError> {
        let mut rows = self
            .conn
            .query(
                "INSERT INTO code_counters (workspace_id, entity_type, last_value)
                 VALUES (?, ?, 1)
                 ON CONFLICT(workspace_id, entity_type) DO UPDATE SET last_value = last_value + 1
                 RETURNING last_value",
                params![workspace.as_str(), entity_type.as_str()],
            )
            .await?;
        let value: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => return Err(AppError::internal("code counter returned no row")),
        };
        Ok(format!("{}-{value}", code_prefix(entity_type)))
    }
}

/// `orders` -> `ORD`
pub fn code_prefix(entity_type: &EntityType) -> String {
    entity_type
        .as_str()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(3)
        .collect::<String>()
        .to_ascii_uppercase()
}

fn row_to_record(row: &libsql::Row) -> Result<RemoteRecord, AppError> {
    let id_text: String = row.get(1)?;
    Ok(RemoteRecord {
        entity_type: EntityType::new(row.get::<String>(0)?)?,
        id: id_text
            .parse()
            .map_err(|_| AppError::internal(format!("stored record id '{id_text}' is invalid")))?,
        workspace_id: WorkspaceId::new(row.get::<String>(2)?)?,
        payload: serde_json::from_str(&row.get::<String>(3)?)?,
        version: row.get(4)?,
        updated_at: row.get(5)?,
        canonical_code: row.get(6)?,
        deleted: row.get::<i64>(7)? != 0,
    })
}
