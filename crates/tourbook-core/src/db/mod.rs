//! Local replica (L2) persistence layer

mod connection;
mod migrations;
mod replica_repository;
mod workspace_repository;

pub use connection::Database;
pub use replica_repository::{
    LibSqlReplicaRepository, PushAccepted, PutOrigin, RecordFilter, RemoteApply,
    ReplicaRepository,
};
pub use workspace_repository::{LibSqlWorkspaceRepository, WorkspaceRepository};
