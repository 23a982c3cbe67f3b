//! Database migrations for the local replica

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Execute `statements` atomically
async fn apply(conn: &Connection, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    Ok(())
}

/// Migration to version 1: workspaces, replica records, pull cursors
async fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            "CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_current INTEGER NOT NULL DEFAULT 0
            )",
            // One logical collection per entity type, partitioned by workspace
            "CREATE TABLE IF NOT EXISTS records (
                workspace_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                id TEXT NOT NULL,
                payload TEXT NOT NULL,
                sync_status TEXT NOT NULL CHECK (sync_status IN ('pending', 'synced', 'conflict')),
                version INTEGER NOT NULL DEFAULT 0,
                provisional_id TEXT,
                canonical_code TEXT,
                local_updated_at INTEGER NOT NULL,
                local_revision INTEGER NOT NULL DEFAULT 0,
                remote_updated_at INTEGER,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                remote_snapshot TEXT,
                pending_seq INTEGER,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                next_attempt_at INTEGER,
                last_error TEXT,
                rejected INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (workspace_id, entity_type, id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_records_status
                ON records(workspace_id, entity_type, sync_status, pending_seq)",
            "CREATE INDEX IF NOT EXISTS idx_records_updated
                ON records(workspace_id, entity_type, local_updated_at DESC)",
            "CREATE TABLE IF NOT EXISTS sync_cursors (
                workspace_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                last_remote_updated_at INTEGER NOT NULL,
                PRIMARY KEY (workspace_id, entity_type)
            )",
            "INSERT INTO schema_version (version) VALUES (1)",
        ],
    )
    .await?;

    tracing::info!("Migrated local replica to version 1");
    Ok(())
}

/// Migration to version 2: provisional code counters
async fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        &[
            "CREATE TABLE IF NOT EXISTS provisional_counters (
                workspace_id TEXT NOT NULL,
                prefix TEXT NOT NULL,
                last_value INTEGER NOT NULL,
                PRIMARY KEY (workspace_id, prefix)
            )",
            "CREATE INDEX IF NOT EXISTS idx_records_provisional
                ON records(workspace_id, provisional_id)",
            "INSERT INTO schema_version (version) VALUES (2)",
        ],
    )
    .await?;

    tracing::info!("Migrated local replica to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = ?
                )",
                [name],
            )
            .await
            .unwrap();

        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i32>(0).unwrap() != 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap(); // Should not fail

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_create_sync_tables() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        for table in ["workspaces", "records", "sync_cursors", "provisional_counters"] {
            assert!(table_exists(&conn, table).await, "missing table {table}");
        }
    }
}
