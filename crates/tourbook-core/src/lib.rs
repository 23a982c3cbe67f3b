//! tourbook-core - offline-first sync engine for Tourbook
//!
//! Records live in a durable local replica (libSQL) and are read through a
//! short-lived in-memory cache. The reconciliation engine pushes pending
//! local writes to a multi-tenant remote store and pulls remote deltas back,
//! never letting a pull clobber an unsynchronized local write.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod services;
pub mod sync;
pub mod tenant;

pub use config::{ConfigError, EngineConfig, RemoteConfig};
pub use error::{Error, Result};
pub use models::{EntityType, RecordId, SyncStatus, SyncableRecord, Workspace, WorkspaceId};
pub use services::{ReplicaStore, Resolution, SyncService};
pub use sync::{SyncOutcome, SyncSnapshot, SyncTrigger};
pub use tenant::{TenantContext, TenantScope};
