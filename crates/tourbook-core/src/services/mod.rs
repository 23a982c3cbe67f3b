//! Shared services used by clients: the replica handle and the sync facade

mod replica_store;
mod sync_service;

pub use replica_store::ReplicaStore;
pub use sync_service::{Resolution, SyncService};
