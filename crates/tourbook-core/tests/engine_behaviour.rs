mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{entity, fast_config, session, session_with, workspace};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::tempdir;
use tourbook_core::models::{EntityType, RecordId, RemoteRecord, WorkspaceId};
use tourbook_core::remote::protocol::OutgoingRecord;
use tourbook_core::remote::{
    InMemoryRemoteStore, RemoteError, RemoteFault, RemoteStore, UpsertOutcome,
};
use tourbook_core::sync::{SyncErrorKind, SyncState};
use tourbook_core::{Error, Resolution, SyncOutcome, SyncService, SyncStatus, TenantContext};

#[tokio::test(flavor = "multi_thread")]
async fn triggers_during_a_cycle_coalesce_into_one_follow_up() {
    let (service, remote) = session("ws-a").await;
    service
        .write(&entity("tours"), json!({"name": "slow"}), None)
        .await
        .unwrap();
    remote.fail_next_upserts(RemoteFault::Delay(Duration::from_millis(500)), 1);

    let running = {
        let service = service.clone();
        tokio::spawn(async move { service.trigger_sync().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(service.tracker().is_syncing());

    assert_eq!(service.trigger_sync().await.unwrap(), SyncOutcome::Coalesced);
    assert_eq!(service.trigger_sync().await.unwrap(), SyncOutcome::Coalesced);

    let outcome = running.await.unwrap().unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(report.cycles, 2);
    assert_eq!(report.pushed, 1);
    assert!(!service.tracker().is_syncing());
}

#[tokio::test(flavor = "multi_thread")]
async fn workspace_switch_discards_in_flight_results() {
    let (service, remote) = session("ws-a").await;
    let tours = entity("tours");
    let ws_a = WorkspaceId::new("ws-a").unwrap();
    let tour = service
        .write(&tours, json!({"name": "in flight"}), None)
        .await
        .unwrap();
    remote.fail_next_upserts(RemoteFault::Delay(Duration::from_millis(400)), 1);

    let running = {
        let service = service.clone();
        tokio::spawn(async move { service.trigger_sync().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.switch_workspace(workspace("ws-b")).await.unwrap();

    let outcome = running.await.unwrap().unwrap();
    let report = outcome.report().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.pushed, 0);

    // The remote stored the write, but A's replica never saw the response
    assert!(remote.get(&tours, &ws_a, tour.id).is_some());
    let local = service
        .store()
        .get_by_id(&ws_a, &tours, &tour.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.sync_status, SyncStatus::Pending);

    // Pushing the same write again is answered as a replay
    service.switch_workspace(workspace("ws-a")).await.unwrap();
    let local = service.read(&tours, &tour.id).await.unwrap().unwrap();
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert_eq!(local.version, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reselected_workspace_gets_its_follow_up_cycle() {
    let (service, remote) = session("ws-a").await;
    let tours = entity("tours");
    let tour = service
        .write(&tours, json!({"name": "round trip"}), None)
        .await
        .unwrap();
    remote.fail_next_upserts(RemoteFault::Delay(Duration::from_millis(400)), 1);

    let running = {
        let service = service.clone();
        tokio::spawn(async move { service.trigger_sync().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.switch_workspace(workspace("ws-b")).await.unwrap();
    assert_eq!(
        service.switch_workspace(workspace("ws-a")).await.unwrap(),
        SyncOutcome::Coalesced
    );

    // The first cycle is cancelled, the follow-up runs against the re-selected workspace
    let outcome = running.await.unwrap().unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(report.cycles, 2);
    assert!(!report.cancelled);
    assert!(!service.tracker().is_syncing());

    let local = service.read(&tours, &tour.id).await.unwrap().unwrap();
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert_eq!(local.version, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_request_coalesced_into_timer_cycle_ignores_schedule() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let mut config = fast_config();
    config.backoff.base_delay = Duration::from_secs(60);
    config.backoff.max_delay = Duration::from_secs(60);
    let service = session_with(remote.clone(), "ws-a", &config).await;
    let tours = entity("tours");
    let waiting = service.write(&tours, json!({"n": 1}), None).await.unwrap();
    remote.fail_record(waiting.id, RemoteFault::Network, 1);
    service.trigger_sync().await.unwrap();

    let slow = service.write(&tours, json!({"n": 2}), None).await.unwrap();
    remote.fail_next_upserts(RemoteFault::Delay(Duration::from_millis(400)), 1);
    let running = {
        let engine = service.engine().clone();
        tokio::spawn(async move { engine.run(tourbook_core::SyncTrigger::Timer).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.trigger_sync().await.unwrap(), SyncOutcome::Coalesced);

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.report().unwrap().cycles, 2);
    for id in [waiting.id, slow.id] {
        let record = service.read(&tours, &id).await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_record_waits_for_a_new_write() {
    let (service, remote) = session("ws-a").await;
    let orders = entity("orders");
    let order = service
        .write(&orders, json!({"total": -5}), None)
        .await
        .unwrap();
    remote.fail_record(
        order.id,
        RemoteFault::Rejected("total must be positive".to_string()),
        1,
    );

    let outcome = service.trigger_sync().await.unwrap();
    assert_eq!(outcome.report().unwrap().rejected, 1);

    let snapshot = service.sync_status_snapshot().await.unwrap();
    assert_eq!(snapshot.pending_count, 1);
    assert_eq!(snapshot.rejected_count, 1);
    assert_eq!(snapshot.errors.len(), 1);
    assert_eq!(snapshot.errors[0].kind, SyncErrorKind::Rejected);
    assert_eq!(snapshot.errors[0].record_id, Some(order.id));
    assert_eq!(snapshot.errors[0].message, "total must be positive");
    assert_eq!(snapshot.state(), SyncState::Error);

    let calls = remote.upsert_calls();
    service.trigger_sync().await.unwrap();
    assert_eq!(remote.upsert_calls(), calls);

    service
        .write(&orders, json!({"total": 5}), Some(order.id))
        .await
        .unwrap();
    let outcome = service.trigger_sync().await.unwrap();
    assert_eq!(outcome.report().unwrap().pushed, 1);

    let snapshot = service.sync_status_snapshot().await.unwrap();
    assert_eq!(snapshot.pending_count, 0);
    assert_eq!(snapshot.rejected_count, 0);
    assert!(snapshot.errors.is_empty());
    assert_eq!(snapshot.state(), SyncState::Synced);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_are_reported_and_keep_retrying() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let mut config = fast_config();
    config.backoff.max_attempts = 2;
    let service = session_with(remote.clone(), "ws-a", &config).await;
    let tour = service
        .write(&entity("tours"), json!({}), None)
        .await
        .unwrap();
    remote.fail_record(tour.id, RemoteFault::Unavailable, 2);

    service.trigger_sync().await.unwrap();
    assert!(service
        .sync_status_snapshot()
        .await
        .unwrap()
        .errors
        .is_empty());

    service.trigger_sync().await.unwrap();
    let errors = service.sync_status_snapshot().await.unwrap().errors;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, SyncErrorKind::RetriesExhausted);

    let outcome = service.trigger_sync().await.unwrap();
    assert_eq!(outcome.report().unwrap().pushed, 1);
    assert!(service
        .sync_status_snapshot()
        .await
        .unwrap()
        .errors
        .is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn background_cycles_honour_retry_schedule() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let mut config = fast_config();
    config.backoff.base_delay = Duration::from_secs(60);
    config.backoff.max_delay = Duration::from_secs(60);
    let service = session_with(remote.clone(), "ws-a", &config).await;
    let tour = service
        .write(&entity("tours"), json!({}), None)
        .await
        .unwrap();
    remote.fail_record(tour.id, RemoteFault::Network, 1);

    service.trigger_sync().await.unwrap();
    let calls = remote.upsert_calls();

    let outcome = service
        .engine()
        .run(tourbook_core::SyncTrigger::Timer)
        .await
        .unwrap();
    assert_eq!(outcome.report().unwrap().pushed, 0);
    assert_eq!(remote.upsert_calls(), calls);

    // Manual sync ignores the schedule
    let outcome = service.trigger_sync().await.unwrap();
    assert_eq!(outcome.report().unwrap().pushed, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn deletes_travel_as_tombstones() {
    let (service, remote) = session("ws-a").await;
    let tours = entity("tours");
    let ws_a = WorkspaceId::new("ws-a").unwrap();
    let mine = service.write(&tours, json!({"n": 1}), None).await.unwrap();
    let theirs = service.write(&tours, json!({"n": 2}), None).await.unwrap();
    service.trigger_sync().await.unwrap();

    assert!(service.remove(&tours, &mine.id).await.unwrap());
    assert_eq!(service.tracker().pending_count(None).await.unwrap(), 1);
    let outcome = service.trigger_sync().await.unwrap();
    assert_eq!(outcome.report().unwrap().pushed, 1);
    assert!(remote.get(&tours, &ws_a, mine.id).unwrap().deleted);
    assert!(service
        .store()
        .get_by_id(&ws_a, &tours, &mine.id)
        .await
        .unwrap()
        .is_none());

    remote.delete_as_other_client(&tours, &ws_a, theirs.id).unwrap();
    service.trigger_sync().await.unwrap();
    assert!(service.read(&tours, &theirs.id).await.unwrap().is_none());
    assert!(service
        .store()
        .get_by_id(&ws_a, &tours, &theirs.id)
        .await
        .unwrap()
        .is_none());
    assert_eq!(remote.record_count(&ws_a), 0);
}

async fn conflicted(
    service: &SyncService,
    remote: &InMemoryRemoteStore,
    theirs: serde_json::Value,
) -> (EntityType, RecordId) {
    let tours = entity("tours");
    let tour = service.write(&tours, json!({"n": 0}), None).await.unwrap();
    service.trigger_sync().await.unwrap();
    remote.write_as_other_client(&tours, &tour.workspace_id, tour.id, theirs);
    service
        .write(&tours, json!({"n": "mine"}), Some(tour.id))
        .await
        .unwrap();
    service.trigger_sync().await.unwrap();
    assert_eq!(service.conflicts(None).await.unwrap().len(), 1);
    (tours, tour.id)
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_local_rebases_and_pushes_again() {
    let (service, remote) = session("ws-a").await;
    let (tours, id) = conflicted(&service, &remote, json!({"n": "theirs"})).await;

    let resolved = service
        .resolve_conflict(&tours, &id, Resolution::KeepLocal)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.sync_status, SyncStatus::Pending);
    assert_eq!(resolved.version, 2);
    assert!(resolved.remote_snapshot.is_none());

    let outcome = service.trigger_sync().await.unwrap();
    assert_eq!(outcome.report().unwrap().pushed, 1);
    let stored = remote
        .get(&tours, &WorkspaceId::new("ws-a").unwrap(), id)
        .unwrap();
    assert_eq!(stored.payload, json!({"n": "mine"}));
    assert_eq!(stored.version, 3);
    assert_eq!(service.tracker().conflict_count(None).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_remote_adopts_snapshot() {
    let (service, remote) = session("ws-a").await;
    let (tours, id) = conflicted(&service, &remote, json!({"n": "theirs"})).await;

    let resolved = service
        .resolve_conflict(&tours, &id, Resolution::KeepRemote)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.sync_status, SyncStatus::Synced);
    assert_eq!(resolved.payload, json!({"n": "theirs"}));
    assert_eq!(
        service.read(&tours, &id).await.unwrap().unwrap().payload,
        json!({"n": "theirs"})
    );

    let snapshot = service.sync_status_snapshot().await.unwrap();
    assert_eq!(snapshot.pending_count, 0);
    assert_eq!(snapshot.conflict_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_remote_of_a_remote_delete_removes_the_record() {
    let (service, remote) = session("ws-a").await;
    let tours = entity("tours");
    let ws_a = WorkspaceId::new("ws-a").unwrap();
    let tour = service.write(&tours, json!({"n": 0}), None).await.unwrap();
    service.trigger_sync().await.unwrap();
    remote.delete_as_other_client(&tours, &ws_a, tour.id).unwrap();
    service
        .write(&tours, json!({"n": "mine"}), Some(tour.id))
        .await
        .unwrap();
    service.trigger_sync().await.unwrap();

    let resolved = service
        .resolve_conflict(&tours, &tour.id, Resolution::KeepRemote)
        .await
        .unwrap();
    assert!(resolved.is_none());
    assert!(service.read(&tours, &tour.id).await.unwrap().is_none());
}

/// Remote store that answers every delta query with an extra record from another tenant
struct LeakyRemote {
    inner: InMemoryRemoteStore,
    leaked: RemoteRecord,
}

#[async_trait]
impl RemoteStore for LeakyRemote {
    async fn upsert(
        &self,
        entity_type: &EntityType,
        workspace: &WorkspaceId,
        record: &OutgoingRecord,
        basis_version: i64,
    ) -> Result<UpsertOutcome, RemoteError> {
        self.inner
            .upsert(entity_type, workspace, record, basis_version)
            .await
    }

    async fn query_updated_since(
        &self,
        entity_type: &EntityType,
        workspace: &WorkspaceId,
        since: Option<i64>,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let mut records = self
            .inner
            .query_updated_since(entity_type, workspace, since)
            .await?;
        if entity_type == &self.leaked.entity_type {
            records.push(self.leaked.clone());
        }
        Ok(records)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn pulled_records_of_another_tenant_are_dropped() {
    let tours = entity("tours");
    let ws_a = WorkspaceId::new("ws-a").unwrap();
    let ws_b = WorkspaceId::new("ws-b").unwrap();
    let leaked = RemoteRecord {
        entity_type: tours.clone(),
        id: RecordId::new(),
        workspace_id: ws_a.clone(),
        payload: json!({"secret": true}),
        version: 1,
        updated_at: 1,
        canonical_code: None,
        deleted: false,
    };
    let remote = Arc::new(LeakyRemote {
        inner: InMemoryRemoteStore::new(),
        leaked: leaked.clone(),
    });
    let service = session_with(remote, "ws-b", &fast_config()).await;

    let outcome = service.trigger_sync().await.unwrap();
    assert_eq!(outcome.report().unwrap().pulled, 0);
    assert!(service.read(&tours, &leaked.id).await.unwrap().is_none());
    for ws in [&ws_a, &ws_b] {
        assert!(service
            .store()
            .get_by_id(ws, &tours, &leaked.id)
            .await
            .unwrap()
            .is_none());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_delta_query_is_reported_until_recovery() {
    let (service, remote) = session("ws-a").await;
    remote.fail_next_queries(RemoteFault::Rejected("forbidden".to_string()), 1);

    let outcome = service.trigger_sync().await.unwrap();
    assert_eq!(outcome.report().unwrap().pull_failures, 1);
    let snapshot = service.sync_status_snapshot().await.unwrap();
    assert_eq!(snapshot.last_synced_at, None);
    assert_eq!(snapshot.errors.len(), 1);
    assert_eq!(snapshot.errors[0].kind, SyncErrorKind::Remote);

    service.trigger_sync().await.unwrap();
    let snapshot = service.sync_status_snapshot().await.unwrap();
    assert!(snapshot.last_synced_at.is_some());
    assert!(snapshot.errors.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn scoped_operations_fail_without_a_workspace() {
    let store = tourbook_core::ReplicaStore::open_in_memory().await.unwrap();
    let service = SyncService::new(
        store,
        Arc::new(InMemoryRemoteStore::new()),
        TenantContext::new(),
        &fast_config(),
    );

    let err = service
        .write(&entity("tours"), json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoTenant));
    assert!(matches!(
        service.trigger_sync().await.unwrap_err(),
        Error::NoTenant
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn session_restart_keeps_workspace_and_pending_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("replica.db");
    let remote = Arc::new(InMemoryRemoteStore::new());
    remote.set_offline(true);
    let config = fast_config();
    let tours = entity("tours");

    let id = {
        let service = SyncService::open(path.clone(), remote.clone(), &config)
            .await
            .unwrap();
        assert!(service.current_workspace().is_none());
        service.switch_workspace(workspace("ws-a")).await.unwrap();
        service
            .write(&tours, json!({"name": "kept"}), None)
            .await
            .unwrap()
            .id
    };

    let service = SyncService::open(path, remote, &config).await.unwrap();
    assert_eq!(
        service.current_workspace().map(|ws| ws.id),
        Some(WorkspaceId::new("ws-a").unwrap())
    );
    let record = service.read(&tours, &id).await.unwrap().unwrap();
    assert_eq!(record.payload, json!({"name": "kept"}));
    assert_eq!(record.sync_status, SyncStatus::Pending);
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_syncs_on_timer() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let mut config = fast_config();
    config.sync_interval = Some(Duration::from_millis(50));
    let service = session_with(remote.clone(), "ws-a", &config).await;
    let tours = entity("tours");
    let tour = service.write(&tours, json!({}), None).await.unwrap();

    let scheduler = service.start_scheduler();
    let mut synced = false;
    for _ in 0..40 {
        if remote.get(&tours, &tour.workspace_id, tour.id).is_some() {
            synced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    scheduler.shutdown().await;
    assert!(synced, "timer never pushed the pending record");
}
