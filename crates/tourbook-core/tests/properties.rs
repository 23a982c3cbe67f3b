mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{entity, fast_config, session, session_with, workspace};
use pretty_assertions::assert_eq;
use serde_json::json;
use tourbook_core::remote::{InMemoryRemoteStore, RemoteFault};
use tourbook_core::models::RetryState;
use tourbook_core::{SyncOutcome, SyncStatus, SyncTrigger};

#[tokio::test(flavor = "multi_thread")]
async fn local_write_is_readable_without_network() {
    let (service, remote) = session("ws-a").await;
    let tours = entity("tours");
    service.set_online(false);
    remote.set_offline(true);

    let written = service
        .write(&tours, json!({"name": "Douro valley"}), None)
        .await
        .unwrap();
    let read = service.read(&tours, &written.id).await.unwrap().unwrap();

    assert_eq!(read.payload, json!({"name": "Douro valley"}));
    assert_eq!(read.sync_status, SyncStatus::Pending);
    assert_eq!(remote.upsert_calls(), 0);
    assert_eq!(remote.query_calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn pull_never_clobbers_pending_write() {
    let (service, remote) = session("ws-a").await;
    let tours = entity("tours");
    let tour = service
        .write(&tours, json!({"name": "v1"}), None)
        .await
        .unwrap();
    service.trigger_sync().await.unwrap();

    service
        .write(&tours, json!({"name": "local edit"}), Some(tour.id))
        .await
        .unwrap();
    remote.write_as_other_client(&tours, &tour.workspace_id, tour.id, json!({"name": "remote"}));
    // Keep the edit pending through the drain so the pull sees it
    remote.fail_record(tour.id, RemoteFault::Timeout, 1);

    let outcome = service.trigger_sync().await.unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(report.skipped_pending, 1);

    let local = service.read(&tours, &tour.id).await.unwrap().unwrap();
    assert_eq!(local.payload, json!({"name": "local edit"}));
    assert_eq!(local.sync_status, SyncStatus::Pending);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_drain_after_success_makes_no_calls() {
    let (service, remote) = session("ws-a").await;
    for name in ["a", "b", "c"] {
        service
            .write(&entity("customers"), json!({"name": name}), None)
            .await
            .unwrap();
    }

    let first = service.trigger_sync().await.unwrap();
    assert_eq!(first.report().unwrap().pushed, 3);
    let calls = remote.upsert_calls();

    let second = service.trigger_sync().await.unwrap();
    assert_eq!(second.report().unwrap().pushed, 0);
    assert_eq!(remote.upsert_calls(), calls);
    assert_eq!(service.tracker().pending_count(None).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn conflict_is_sticky() {
    let (service, remote) = session("ws-a").await;
    let tours = entity("tours");
    let tour = service.write(&tours, json!({"n": 1}), None).await.unwrap();
    service.trigger_sync().await.unwrap();

    remote.write_as_other_client(&tours, &tour.workspace_id, tour.id, json!({"n": "theirs"}));
    service
        .write(&tours, json!({"n": "mine"}), Some(tour.id))
        .await
        .unwrap();
    service.trigger_sync().await.unwrap();
    assert!(service.read(&tours, &tour.id).await.unwrap().unwrap().is_conflict());

    // Further remote changes, local edits and cycles leave it in conflict
    remote.write_as_other_client(&tours, &tour.workspace_id, tour.id, json!({"n": "theirs again"}));
    service.trigger_sync().await.unwrap();
    service
        .write(&tours, json!({"n": "mine again"}), Some(tour.id))
        .await
        .unwrap();
    service.trigger_sync().await.unwrap();
    service.engine().run(SyncTrigger::Timer).await.unwrap();

    let local = service.read(&tours, &tour.id).await.unwrap().unwrap();
    assert_eq!(local.sync_status, SyncStatus::Conflict);
    assert_eq!(local.payload, json!({"n": "mine again"}));
    assert_eq!(service.tracker().conflict_count(None).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn switching_workspace_hides_previous_tenant() {
    let (service, _remote) = session("ws-a").await;
    let tours = entity("tours");
    let tour = service
        .write(&tours, json!({"name": "A only"}), None)
        .await
        .unwrap();
    // Warm the cache with A's record
    service.read(&tours, &tour.id).await.unwrap().unwrap();

    service.switch_workspace(workspace("ws-b")).await.unwrap();

    assert!(service.read(&tours, &tour.id).await.unwrap().is_none());
    assert!(service.list(&tours).await.unwrap().is_empty());
    assert_eq!(service.tracker().pending_count(None).await.unwrap(), 0);
    assert_eq!(service.cache_stats().size, 0);

    service.switch_workspace(workspace("ws-a")).await.unwrap();
    assert!(service.read(&tours, &tour.id).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn provisional_code_is_replaced_after_reconnect() {
    let (service, remote) = session("ws-a").await;
    let orders = entity("orders");
    let payments = entity("payments");
    remote.assign_codes(orders.clone(), "R", 42);
    service.set_online(false);
    remote.set_offline(true);

    let order = service
        .write(&orders, json!({"total": 120}), None)
        .await
        .unwrap();
    let payment = service
        .write(&payments, json!({"order": "TBC-1", "amount": 120}), None)
        .await
        .unwrap();
    assert_eq!(order.provisional_id.as_deref(), Some("TBC-1"));
    assert!(service.read(&orders, &order.id).await.unwrap().is_some());
    assert_eq!(service.tracker().pending_count(Some(&orders)).await.unwrap(), 1);

    let skipped = service.engine().run(SyncTrigger::Timer).await.unwrap();
    assert_eq!(skipped, SyncOutcome::SkippedOffline);

    remote.set_offline(false);
    service.set_online(true);
    service.trigger_sync().await.unwrap();

    let order = service.read(&orders, &order.id).await.unwrap().unwrap();
    assert_eq!(order.sync_status, SyncStatus::Synced);
    assert_eq!(order.canonical_code.as_deref(), Some("R-42"));
    assert_eq!(order.provisional_id, None);
    assert_eq!(order.display_code(), Some("R-42"));
    assert_eq!(order.payload["code"], json!("R-42"));

    let payment = service.read(&payments, &payment.id).await.unwrap().unwrap();
    assert_eq!(payment.payload["order"], json!("R-42"));
    assert_eq!(payment.sync_status, SyncStatus::Synced);
    let remote_payment = remote
        .get(&payments, &payment.workspace_id, payment.id)
        .unwrap();
    assert_eq!(remote_payment.payload["order"], json!("R-42"));

    assert_eq!(service.tracker().pending_count(None).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_session_lands_in_conflict() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let config = fast_config();
    let session_a = session_with(remote.clone(), "ws-a", &config).await;
    let session_b = session_with(remote.clone(), "ws-a", &config).await;
    let tours = entity("tours");

    let tour = session_a
        .write(&tours, json!({"name": "original"}), None)
        .await
        .unwrap();
    session_a.trigger_sync().await.unwrap();
    session_b.trigger_sync().await.unwrap();
    assert_eq!(
        session_b.read(&tours, &tour.id).await.unwrap().unwrap().version,
        1
    );

    session_a
        .write(&tours, json!({"name": "edited by a"}), Some(tour.id))
        .await
        .unwrap();
    session_b
        .write(&tours, json!({"name": "edited by b"}), Some(tour.id))
        .await
        .unwrap();

    let a = session_a.trigger_sync().await.unwrap();
    assert_eq!(a.report().unwrap().pushed, 1);
    let b = session_b.trigger_sync().await.unwrap();
    assert_eq!(b.report().unwrap().conflicts, 1);

    let local_b = session_b.read(&tours, &tour.id).await.unwrap().unwrap();
    assert_eq!(local_b.sync_status, SyncStatus::Conflict);
    assert_eq!(local_b.payload, json!({"name": "edited by b"}));
    let snapshot = local_b.remote_snapshot.unwrap();
    assert_eq!(snapshot.payload, json!({"name": "edited by a"}));
    assert_eq!(snapshot.version, 2);

    assert_eq!(session_b.tracker().pending_count(None).await.unwrap(), 0);
    assert_eq!(session_b.tracker().conflict_count(None).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn timeouts_back_off_then_succeed() {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let mut config = fast_config();
    config.backoff.base_delay = Duration::from_millis(100);
    config.backoff.max_delay = Duration::from_secs(1);
    assert!(config.sync_interval.is_none());
    let service = session_with(remote.clone(), "ws-a", &config).await;
    let tours = entity("tours");
    let tour = service.write(&tours, json!({"name": "Y"}), None).await.unwrap();
    remote.fail_record(tour.id, RemoteFault::Timeout, 3);

    // First attempt by hand, the rest come from the retry schedule alone
    let outcome = service.trigger_sync().await.unwrap();
    assert_eq!(outcome.report().unwrap().retried, 1);
    let scheduler = service.start_scheduler();

    let mut attempts: BTreeMap<u32, RetryState> = BTreeMap::new();
    let mut synced = None;
    for _ in 0..300 {
        let record = service
            .store()
            .get_by_id(&tour.workspace_id, &tours, &tour.id)
            .await
            .unwrap()
            .unwrap();
        if record.sync_status == SyncStatus::Synced {
            synced = Some(record);
            break;
        }
        attempts
            .entry(record.retry.attempt_count)
            .or_insert(record.retry);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    scheduler.shutdown().await;

    let record = synced.expect("scheduled retries never pushed the record");
    assert_eq!(record.retry.attempt_count, 0);
    assert_eq!(remote.upsert_calls(), 4);

    let failed: Vec<&RetryState> = (1..=3).map(|attempt| &attempts[&attempt]).collect();
    let delays: Vec<i64> = failed
        .iter()
        .map(|retry| retry.next_attempt_at.unwrap() - retry.last_attempt_at.unwrap())
        .collect();
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]), "{delays:?}");
    assert_eq!(delays, vec![100, 200, 400]);
    // No retry ran before its slot
    for pair in failed.windows(2) {
        assert!(pair[1].last_attempt_at.unwrap() >= pair[0].next_attempt_at.unwrap());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn local_write_invalidates_cached_read() {
    let (service, _remote) = session("ws-a").await;
    let tours = entity("tours");
    let tour = service.write(&tours, json!({"v": 1}), None).await.unwrap();
    assert_eq!(
        service.read(&tours, &tour.id).await.unwrap().unwrap().payload,
        json!({"v": 1})
    );

    service
        .write(&tours, json!({"v": 2}), Some(tour.id))
        .await
        .unwrap();
    assert_eq!(
        service.read(&tours, &tour.id).await.unwrap().unwrap().payload,
        json!({"v": 2})
    );
}
