//! Workspace repository implementation

use crate::error::{Error, Result};
use crate::models::{Workspace, WorkspaceId};
use libsql::Connection;

/// Trait for workspace storage operations (async)
#[allow(async_fn_in_trait)]
pub trait WorkspaceRepository {
    /// List known workspaces, ordered by code
    async fn list(&self) -> Result<Vec<Workspace>>;

    /// Get a workspace by id
    async fn get(&self, id: &WorkspaceId) -> Result<Option<Workspace>>;

    /// Insert or update a workspace
    async fn save(&self, workspace: &Workspace) -> Result<()>;

    /// The workspace persisted as current, if any
    async fn current(&self) -> Result<Option<Workspace>>;

    /// Persist `id` as the only current workspace
    async fn set_current(&self, id: &WorkspaceId) -> Result<()>;
}

/// libSQL implementation of `WorkspaceRepository`
pub struct LibSqlWorkspaceRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlWorkspaceRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_workspace(row: &libsql::Row) -> Result<Workspace> {
        Ok(Workspace {
            id: WorkspaceId::new(row.get::<String>(0)?)?,
            code: row.get(1)?,
            is_active: row.get::<i64>(2)? != 0,
        })
    }

    async fn query_workspaces(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Workspace>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut workspaces = Vec::new();
        while let Some(row) = rows.next().await? {
            workspaces.push(Self::parse_workspace(&row)?);
        }
        Ok(workspaces)
    }
}

impl WorkspaceRepository for LibSqlWorkspaceRepository<'_> {
    async fn list(&self) -> Result<Vec<Workspace>> {
        self.query_workspaces(
            "SELECT id, code, is_active FROM workspaces ORDER BY code ASC, id ASC",
            (),
        )
        .await
    }

    async fn get(&self, id: &WorkspaceId) -> Result<Option<Workspace>> {
        Ok(self
            .query_workspaces(
                "SELECT id, code, is_active FROM workspaces WHERE id = ?",
                [id.as_str()],
            )
            .await?
            .pop())
    }

    async fn save(&self, workspace: &Workspace) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO workspaces (id, code, is_active) VALUES (?, ?, ?)
                 ON CONFLICT (id) DO UPDATE SET
                    code = excluded.code,
                    is_active = excluded.is_active",
                libsql::params![
                    workspace.id.as_str(),
                    workspace.code.as_str(),
                    i64::from(workspace.is_active)
                ],
            )
            .await?;
        Ok(())
    }

    async fn current(&self) -> Result<Option<Workspace>> {
        Ok(self
            .query_workspaces(
                "SELECT id, code, is_active FROM workspaces WHERE is_current = 1 LIMIT 1",
                (),
            )
            .await?
            .pop())
    }

    async fn set_current(&self, id: &WorkspaceId) -> Result<()> {
        let Some(workspace) = self.get(id).await? else {
            return Err(Error::NotFound(format!("workspace {id}")));
        };
        if !workspace.is_active {
            return Err(Error::InvalidInput(format!("workspace {id} is inactive")));
        }

        // Single statement keeps "exactly one current" atomic
        self.conn
            .execute(
                "UPDATE workspaces SET is_current = CASE WHEN id = ? THEN 1 ELSE 0 END",
                [id.as_str()],
            )
            .await?;
        Ok(())
    }
}
