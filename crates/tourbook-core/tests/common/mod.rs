#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tourbook_core::models::{EntityType, Workspace, WorkspaceId};
use tourbook_core::remote::{InMemoryRemoteStore, RemoteStore};
use tourbook_core::{EngineConfig, ReplicaStore, SyncService, TenantContext};

pub fn entity(name: &str) -> EntityType {
    EntityType::new(name).unwrap()
}

pub fn workspace(id: &str) -> Workspace {
    Workspace::new(WorkspaceId::new(id).unwrap(), id.to_uppercase())
}

/// Engine config with millisecond-scale retry delays
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::new().unwrap();
    config.backoff.base_delay = Duration::from_millis(10);
    config.backoff.max_delay = Duration::from_millis(1_000);
    config.request_timeout = Duration::from_secs(2);
    config.sync_interval = None;
    config
}

/// A session on an in-memory replica, selected into `workspace_id`
pub async fn session_with(
    remote: Arc<dyn RemoteStore>,
    workspace_id: &str,
    config: &EngineConfig,
) -> SyncService {
    let store = ReplicaStore::open_in_memory().await.unwrap();
    let selected = workspace(workspace_id);
    store.save_workspace(&selected).await.unwrap();
    store.set_current_workspace(&selected.id).await.unwrap();
    let tenant = TenantContext::with_workspace(selected);
    SyncService::new(store, remote, tenant, config)
}

pub async fn session(workspace_id: &str) -> (SyncService, Arc<InMemoryRemoteStore>) {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let service = session_with(remote.clone(), workspace_id, &fast_config()).await;
    (service, remote)
}
