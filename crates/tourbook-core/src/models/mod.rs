//! Data models for Tourbook

mod entity;
mod record;
mod workspace;

pub use entity::{EntityKind, EntityRegistry, ProvisionalCodes, CODE_FIELD};
pub use record::{
    rewrite_references, EntityType, RecordId, RemoteRecord, RetryState, SyncStatus,
    SyncableRecord,
};
pub use workspace::{Workspace, WorkspaceId};
