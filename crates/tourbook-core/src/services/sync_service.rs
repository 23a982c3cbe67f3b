//! UI/domain-facing facade over the replica, the cache and the engine.
//!
//! Reads go cache-then-store, writes are always local-first and never wait on
//! the network. Everything is scoped through the shared [`TenantContext`].

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info};

use super::ReplicaStore;
use crate::cache::{CacheKey, CacheStats, MemoryCache, RecordCache};
use crate::config::EngineConfig;
use crate::db::PutOrigin;
use crate::error::{Error, Result};
use crate::models::{
    EntityRegistry, EntityType, RecordId, RetryState, SyncStatus, SyncableRecord, Workspace,
    CODE_FIELD,
};
use crate::remote::RemoteStore;
use crate::sync::{
    Connectivity, ReconciliationEngine, SyncOutcome, SyncScheduler, SyncSnapshot,
    SyncStateTracker, SyncTrigger,
};
use crate::tenant::{TenantContext, TenantScope};

/// How to leave the `conflict` state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Re-base the local payload onto the remote version and push it again
    KeepLocal,
    /// Take the remote snapshot as the new local state
    KeepRemote,
}

/// Offline-first record service for one session
#[derive(Clone)]
pub struct SyncService {
    store: ReplicaStore,
    cache: RecordCache,
    tenant: TenantContext,
    registry: Arc<EntityRegistry>,
    tracker: SyncStateTracker,
    engine: ReconciliationEngine,
    connectivity: Connectivity,
    sync_interval: Option<std::time::Duration>,
}

impl SyncService {
    pub fn new(
        store: ReplicaStore,
        remote: Arc<dyn RemoteStore>,
        tenant: TenantContext,
        config: &EngineConfig,
    ) -> Self {
        let cache = MemoryCache::new(config.cache);
        let connectivity = Connectivity::default();
        let tracker = SyncStateTracker::new(
            store.clone(),
            tenant.clone(),
            connectivity.clone(),
            config.max_reported_errors,
        );
        let engine = ReconciliationEngine::new(
            store.clone(),
            cache.clone(),
            tenant.clone(),
            remote,
            tracker.clone(),
            connectivity.clone(),
            config,
        );
        Self {
            store,
            cache,
            tenant,
            registry: Arc::new(config.registry.clone()),
            tracker,
            engine,
            connectivity,
            sync_interval: config.sync_interval,
        }
    }

    /// Open the replica at `db_path` and restore the last selected workspace
    pub async fn open(
        db_path: impl Into<PathBuf>,
        remote: Arc<dyn RemoteStore>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let store = ReplicaStore::open_path(db_path).await?;
        let tenant = TenantContext::restore(&store).await?;
        Ok(Self::new(store, remote, tenant, config))
    }

    pub const fn tenant(&self) -> &TenantContext {
        &self.tenant
    }

    pub const fn store(&self) -> &ReplicaStore {
        &self.store
    }

    pub const fn tracker(&self) -> &SyncStateTracker {
        &self.tracker
    }

    pub const fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Read a visible record, cache first
    pub async fn read(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
    ) -> Result<Option<SyncableRecord>> {
        let scope = self.tenant.scope()?;
        let key = CacheKey::record(entity_type, id);
        if let Some(cached) = self.cache.get(&key) {
            if &cached.workspace_id == scope.workspace_id() {
                return Ok(Some(cached));
            }
            self.cache.invalidate(&key);
        }

        let generation = self.cache.generation();
        let record = self
            .store
            .get_by_id(scope.workspace_id(), entity_type, id)
            .await?
            .filter(|record| !record.is_deleted);
        if let Some(record) = &record {
            if self.tenant.is_current(&scope) {
                self.cache.fill(key, record.clone(), generation);
            }
        }
        Ok(record)
    }

    /// Visible records of a type, most recently modified first
    pub async fn list(&self, entity_type: &EntityType) -> Result<Vec<SyncableRecord>> {
        let scope = self.tenant.scope()?;
        self.store.get_all(scope.workspace_id(), entity_type).await
    }

    /// Write a record locally and queue it for the next push
    ///
    /// `id = None` creates a new record. New records of code-issuing kinds get
    /// a provisional code in their `code` field unless the payload already
    /// carries one.
    pub async fn write(
        &self,
        entity_type: &EntityType,
        mut payload: Value,
        id: Option<RecordId>,
    ) -> Result<SyncableRecord> {
        let scope = self.tenant.scope()?;
        let workspace = scope.workspace_id();
        let kind = self.registry.require(entity_type)?;

        let existing = match id {
            Some(id) => self.store.get_by_id(workspace, entity_type, &id).await?,
            None => None,
        };

        let record = if let Some(mut record) = existing {
            if let (Value::Object(fields), Some(code)) = (&mut payload, record.display_code()) {
                fields
                    .entry(CODE_FIELD)
                    .or_insert_with(|| Value::String(code.to_string()));
            }
            record.payload = payload;
            record.is_deleted = false;
            record
        } else {
            let mut record = SyncableRecord::with_id(
                entity_type.clone(),
                id.unwrap_or_default(),
                workspace.clone(),
                payload,
            );
            if let Some(codes) = &kind.provisional_codes {
                if let Value::Object(fields) = &mut record.payload {
                    if !fields.contains_key(CODE_FIELD) {
                        let sequence = self
                            .store
                            .next_provisional_sequence(workspace, codes.prefix())
                            .await?;
                        let code = codes.format(sequence);
                        fields.insert(CODE_FIELD.to_string(), Value::String(code.clone()));
                        record.provisional_id = Some(code);
                    }
                }
            }
            record
        };

        let saved = self.put_local(&scope, &record).await?;
        debug!(
            entity_type = %entity_type,
            record_id = %saved.id,
            code = saved.display_code(),
            "Record written locally"
        );
        Ok(saved)
    }

    /// Tombstone a record; the delete reaches the remote store on the next push
    pub async fn remove(&self, entity_type: &EntityType, id: &RecordId) -> Result<bool> {
        let scope = self.tenant.scope()?;
        let Some(mut record) = self
            .store
            .get_by_id(scope.workspace_id(), entity_type, id)
            .await?
        else {
            return Ok(false);
        };
        if record.is_deleted {
            return Ok(false);
        }
        record.is_deleted = true;
        self.put_local(&scope, &record).await?;
        Ok(true)
    }

    async fn put_local(
        &self,
        scope: &TenantScope,
        record: &SyncableRecord,
    ) -> Result<SyncableRecord> {
        let saved = match self
            .store
            .put(scope.workspace_id(), record, PutOrigin::Local)
            .await
        {
            Ok(saved) => saved,
            Err(err) => {
                error!(
                    entity_type = %record.entity_type,
                    record_id = %record.id,
                    error = %err,
                    "Local write failed"
                );
                return Err(err);
            }
        };
        self.cache
            .invalidate(&CacheKey::record(&record.entity_type, &record.id));
        Ok(saved)
    }

    /// Records in conflict, optionally restricted to one type
    pub async fn conflicts(
        &self,
        entity_type: Option<&EntityType>,
    ) -> Result<Vec<SyncableRecord>> {
        let scope = self.tenant.scope()?;
        self.store
            .list_by_status(scope.workspace_id(), entity_type, SyncStatus::Conflict)
            .await
    }

    /// Leave the `conflict` state; returns the resulting record, if any remains
    pub async fn resolve_conflict(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
        resolution: Resolution,
    ) -> Result<Option<SyncableRecord>> {
        let scope = self.tenant.scope()?;
        let workspace = scope.workspace_id();
        let record = self
            .store
            .get_by_id(workspace, entity_type, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{entity_type}:{id}")))?;
        if !record.is_conflict() {
            return Err(Error::InvalidState(format!(
                "{entity_type}:{id} is not in conflict"
            )));
        }
        let snapshot = record.remote_snapshot.clone().ok_or_else(|| {
            Error::InvalidState(format!("{entity_type}:{id} has no remote snapshot"))
        })?;

        let resolved = match resolution {
            Resolution::KeepLocal => {
                let mut rebased = record;
                rebased.sync_status = SyncStatus::Pending;
                rebased.version = snapshot.version;
                rebased.remote_snapshot = None;
                rebased.retry = RetryState::default();
                rebased.local_updated_at = chrono::Utc::now().timestamp_millis();
                Some(
                    self.store
                        .put(workspace, &rebased, PutOrigin::Reconciled)
                        .await?,
                )
            }
            Resolution::KeepRemote if snapshot.deleted => {
                self.store.delete(workspace, entity_type, id).await?;
                None
            }
            Resolution::KeepRemote => {
                let adopted = SyncableRecord::from_remote(snapshot);
                Some(
                    self.store
                        .put(workspace, &adopted, PutOrigin::Reconciled)
                        .await?,
                )
            }
        };

        self.cache.invalidate(&CacheKey::record(entity_type, id));
        self.tracker.clear_record(workspace, id);
        info!(
            workspace = %workspace,
            entity_type = %entity_type,
            record_id = %id,
            ?resolution,
            "Conflict resolved"
        );
        Ok(resolved)
    }

    pub async fn sync_status_snapshot(&self) -> Result<SyncSnapshot> {
        self.tracker.snapshot().await
    }

    /// "Sync now": runs even while the connectivity hint says offline
    pub async fn trigger_sync(&self) -> Result<SyncOutcome> {
        self.engine.run(SyncTrigger::Manual).await
    }

    /// Select `workspace`, drop every cached entry and pull its data
    pub async fn switch_workspace(&self, workspace: Workspace) -> Result<SyncOutcome> {
        self.store.save_workspace(&workspace).await?;
        self.store.set_current_workspace(&workspace.id).await?;
        self.tenant.switch(workspace);
        self.cache.clear();
        self.engine.run(SyncTrigger::TenantSwitch).await
    }

    pub async fn workspaces(&self) -> Result<Vec<Workspace>> {
        self.store.list_workspaces().await
    }

    pub fn current_workspace(&self) -> Option<Workspace> {
        self.tenant.workspace()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Feed the platform's reachability signal; returns whether it changed
    pub fn set_online(&self, online: bool) -> bool {
        self.connectivity.set_online(online)
    }

    /// Start timer and reconnect driven syncing
    pub fn start_scheduler(&self) -> SyncScheduler {
        SyncScheduler::spawn(self.engine.clone(), self.sync_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkspaceId;
    use crate::remote::InMemoryRemoteStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn service() -> SyncService {
        let store = ReplicaStore::open_in_memory().await.unwrap();
        let tenant = TenantContext::with_workspace(Workspace::new(
            WorkspaceId::new("ws-a").unwrap(),
            "A",
        ));
        let config = EngineConfig::new().unwrap();
        SyncService::new(store, Arc::new(InMemoryRemoteStore::new()), tenant, &config)
    }

    fn entity(name: &str) -> EntityType {
        EntityType::new(name).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_issues_unique_provisional_codes() {
        let service = service().await;
        let first = service
            .write(&entity("orders"), json!({"total": 10}), None)
            .await
            .unwrap();
        let second = service
            .write(&entity("orders"), json!({"total": 20}), None)
            .await
            .unwrap();
        let quote = service
            .write(&entity("quotes"), json!({"total": 30}), None)
            .await
            .unwrap();
        let tour = service
            .write(&entity("tours"), json!({"name": "Porto"}), None)
            .await
            .unwrap();

        assert_eq!(first.provisional_id.as_deref(), Some("TBC-1"));
        assert_eq!(first.payload["code"], json!("TBC-1"));
        assert_eq!(second.provisional_id.as_deref(), Some("TBC-2"));
        // Same prefix, same counter
        assert_eq!(quote.provisional_id.as_deref(), Some("TBC-3"));
        assert_eq!(tour.provisional_id, None);
        assert!(tour.payload.get("code").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_keeps_code_when_payload_omits_it() {
        let service = service().await;
        let order = service
            .write(&entity("orders"), json!({"total": 10}), None)
            .await
            .unwrap();
        let updated = service
            .write(&entity("orders"), json!({"total": 15}), Some(order.id))
            .await
            .unwrap();
        assert_eq!(updated.payload, json!({"total": 15, "code": "TBC-1"}));
        assert_eq!(updated.provisional_id.as_deref(), Some("TBC-1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_entity_type_is_refused() {
        let service = service().await;
        let err = service
            .write(&entity("invoices"), json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownEntityType(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removed_records_are_hidden() {
        let service = service().await;
        let tours = entity("tours");
        let tour = service.write(&tours, json!({}), None).await.unwrap();
        service.read(&tours, &tour.id).await.unwrap();

        assert!(service.remove(&tours, &tour.id).await.unwrap());
        assert!(service.read(&tours, &tour.id).await.unwrap().is_none());
        assert!(service.list(&tours).await.unwrap().is_empty());
        assert!(!service.remove(&tours, &tour.id).await.unwrap());
        assert_eq!(service.tracker().pending_count(None).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolving_a_record_outside_conflict_fails() {
        let service = service().await;
        let tours = entity("tours");
        let tour = service.write(&tours, json!({}), None).await.unwrap();
        let err = service
            .resolve_conflict(&tours, &tour.id, Resolution::KeepLocal)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reads_hit_the_cache() {
        let service = service().await;
        let tours = entity("tours");
        let tour = service.write(&tours, json!({}), None).await.unwrap();

        service.read(&tours, &tour.id).await.unwrap();
        service.read(&tours, &tour.id).await.unwrap();
        let stats = service.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn load_that_raced_a_write_is_not_cached() {
        let service = service().await;
        let tours = entity("tours");
        let tour = service
            .write(&tours, json!({"name": "v1"}), None)
            .await
            .unwrap();
        let workspace = service.tenant.scope().unwrap().workspace_id().clone();

        // A reader loads v1, then a write lands before the reader fills the cache
        let generation = service.cache.generation();
        let loaded = service
            .store
            .get_by_id(&workspace, &tours, &tour.id)
            .await
            .unwrap()
            .unwrap();
        service
            .write(&tours, json!({"name": "v2"}), Some(tour.id))
            .await
            .unwrap();
        assert!(!service
            .cache
            .fill(CacheKey::record(&tours, &tour.id), loaded, generation));

        let read = service.read(&tours, &tour.id).await.unwrap().unwrap();
        assert_eq!(read.payload["name"], json!("v2"));
        let cached = service.read(&tours, &tour.id).await.unwrap().unwrap();
        assert_eq!(cached.payload["name"], json!("v2"));
        assert_eq!(service.cache_stats().hits, 1);
    }
}
