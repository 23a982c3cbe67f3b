//! Reconciliation engine.
//!
//! One cycle drains the outbound queue (pending records, FIFO per entity type,
//! types in registry order) and then pulls remote deltas per entity type.
//! Every write-back re-checks the tenant scope first: a cycle that outlives a
//! workspace switch stops and discards its in-flight results.
//!
//! Cycles are single-flight per workspace. A trigger that arrives while a
//! cycle is running is coalesced into exactly one follow-up cycle.

use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{
    BackoffPolicy, Connectivity, CycleReport, SyncErrorEntry, SyncErrorKind, SyncOutcome,
    SyncPhase, SyncStateTracker, SyncTrigger,
};
use crate::cache::{CacheKey, RecordCache};
use crate::config::EngineConfig;
use crate::db::{PushAccepted, RemoteApply};
use crate::error::Result;
use crate::models::{
    rewrite_references, EntityRegistry, EntityType, RemoteRecord, RetryState, SyncableRecord,
    WorkspaceId,
};
use crate::remote::protocol::OutgoingRecord;
use crate::remote::{RemoteError, RemoteStore, UpsertOutcome};
use crate::services::ReplicaStore;
use crate::tenant::{TenantContext, TenantScope};

#[derive(Debug, Default)]
struct Flight {
    phase: SyncPhase,
    /// Strongest trigger coalesced while this flight was running
    follow_up: Option<SyncTrigger>,
}

type Flights = Arc<Mutex<HashMap<WorkspaceId, Flight>>>;

/// Drives push and pull between the local replica and a [`RemoteStore`]
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: ReplicaStore,
    cache: RecordCache,
    tenant: TenantContext,
    remote: Arc<dyn RemoteStore>,
    registry: Arc<EntityRegistry>,
    tracker: SyncStateTracker,
    connectivity: Connectivity,
    backoff: BackoffPolicy,
    request_timeout: Duration,
    flights: Flights,
    /// Signalled whenever a flight ends, since retries may have been rescheduled
    schedule_changed: Arc<Notify>,
}

impl ReconciliationEngine {
    pub fn new(
        store: ReplicaStore,
        cache: RecordCache,
        tenant: TenantContext,
        remote: Arc<dyn RemoteStore>,
        tracker: SyncStateTracker,
        connectivity: Connectivity,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            cache,
            tenant,
            remote,
            registry: Arc::new(config.registry.clone()),
            tracker,
            connectivity,
            backoff: config.backoff,
            request_timeout: config.request_timeout,
            flights: Arc::new(Mutex::new(HashMap::new())),
            schedule_changed: Arc::new(Notify::new()),
        }
    }

    pub const fn tracker(&self) -> &SyncStateTracker {
        &self.tracker
    }

    pub const fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// When the earliest scheduled push retry of the current workspace comes due
    pub async fn next_retry_at(&self) -> Result<Option<i64>> {
        let scope = self.tenant.scope()?;
        self.store.next_retry_at(scope.workspace_id()).await
    }

    pub(crate) fn schedule_changed(&self) -> Arc<Notify> {
        Arc::clone(&self.schedule_changed)
    }

    /// Phase of the cycle running for `workspace`
    pub fn phase(&self, workspace: &WorkspaceId) -> SyncPhase {
        self.lock_flights()
            .get(workspace)
            .map_or(SyncPhase::Idle, |flight| flight.phase)
    }

    /// Run a sync cycle for the current workspace
    ///
    /// Returns [`SyncOutcome::Coalesced`] when a cycle is already running for
    /// the workspace; that flight runs once more before it finishes, even if
    /// the running cycle gets cancelled, as long as the workspace is selected
    /// again by then. Background triggers are skipped while the connectivity
    /// hint says offline.
    pub async fn run(&self, trigger: SyncTrigger) -> Result<SyncOutcome> {
        let scope = self.tenant.scope()?;
        if trigger.is_background() && !self.connectivity.is_online() {
            debug!(%trigger, "Skipping sync while offline");
            return Ok(SyncOutcome::SkippedOffline);
        }

        let workspace = scope.workspace_id().clone();
        {
            let mut flights = self.lock_flights();
            if let Some(flight) = flights.get_mut(&workspace) {
                flight.follow_up = Some(
                    flight
                        .follow_up
                        .map_or(trigger, |queued| queued.strongest(trigger)),
                );
                debug!(workspace = %workspace, %trigger, "Sync already running; coalesced");
                return Ok(SyncOutcome::Coalesced);
            }
            flights.insert(workspace.clone(), Flight::default());
        }
        self.tracker.begin_cycle(&workspace);
        let mut guard = FlightGuard {
            flights: &self.flights,
            tracker: &self.tracker,
            schedule_changed: &self.schedule_changed,
            workspace,
            active: true,
        };

        let mut report = self.run_cycle(&scope, trigger).await?;
        while let Some(next_trigger) = guard.take_follow_up_or_release() {
            // Take a fresh scope: the workspace may have been left and re-selected
            let Some(next_scope) = self.follow_up_scope(&guard.workspace, next_trigger) else {
                continue;
            };
            let next = self.run_cycle(&next_scope, next_trigger).await?;
            report.absorb(&next);
        }
        Ok(SyncOutcome::Completed(report))
    }

    fn follow_up_scope(
        &self,
        workspace: &WorkspaceId,
        trigger: SyncTrigger,
    ) -> Option<TenantScope> {
        let scope = self.tenant.scope().ok()?;
        if scope.workspace_id() != workspace {
            debug!(
                workspace = %workspace,
                %trigger,
                "Workspace no longer selected; follow-up dropped"
            );
            return None;
        }
        if trigger.is_background() && !self.connectivity.is_online() {
            debug!(workspace = %workspace, %trigger, "Skipping follow-up while offline");
            return None;
        }
        Some(scope)
    }

    async fn run_cycle(&self, scope: &TenantScope, trigger: SyncTrigger) -> Result<CycleReport> {
        let workspace = scope.workspace_id();
        let mut report = CycleReport::new(trigger);
        // Manual syncs ignore the retry schedule
        let due_at = if trigger.is_background() {
            now_ms()
        } else {
            i64::MAX
        };

        self.set_phase(workspace, SyncPhase::Draining);
        for kind in self.registry.kinds() {
            let flow = self
                .drain_entity_type(scope, &kind.entity_type, due_at, &mut report)
                .await?;
            if flow.is_break() {
                report.cancelled = true;
                break;
            }
        }

        if !report.cancelled {
            self.set_phase(workspace, SyncPhase::Pulling);
            for kind in self.registry.kinds() {
                let flow = self
                    .pull_entity_type(scope, &kind.entity_type, &mut report)
                    .await?;
                if flow.is_break() {
                    report.cancelled = true;
                    break;
                }
            }
        }
        self.set_phase(workspace, SyncPhase::Idle);

        if report.cancelled {
            warn!(workspace = %workspace, %trigger, "Sync cycle cancelled by workspace change");
            return Ok(report);
        }
        if report.pull_failures == 0 {
            self.tracker.mark_synced(workspace, now_ms());
            self.tracker.clear_remote_errors(workspace);
        }
        info!(
            workspace = %workspace,
            %trigger,
            pushed = report.pushed,
            conflicts = report.conflicts,
            retried = report.retried,
            rejected = report.rejected,
            pulled = report.pulled,
            skipped_pending = report.skipped_pending,
            pull_failures = report.pull_failures,
            "Sync cycle finished"
        );
        Ok(report)
    }

    async fn drain_entity_type(
        &self,
        scope: &TenantScope,
        entity_type: &EntityType,
        due_at: i64,
        report: &mut CycleReport,
    ) -> Result<ControlFlow<()>> {
        let workspace = scope.workspace_id();
        let queued = self
            .store
            .list_due_for_push(workspace, entity_type, due_at)
            .await?;
        if !queued.is_empty() {
            debug!(workspace = %workspace, entity_type = %entity_type, count = queued.len(), "Draining");
        }

        for candidate in queued {
            if !self.tenant.is_current(scope) {
                return Ok(ControlFlow::Break(()));
            }
            // Re-read: the record may have been edited or resolved since it was queued
            let Some(record) = self
                .store
                .get_by_id(workspace, entity_type, &candidate.id)
                .await?
            else {
                continue;
            };
            if !record.is_pending() || record.retry.rejected {
                continue;
            }

            let outgoing = OutgoingRecord::from_local(&record);
            let result = self
                .call_remote(
                    self.remote
                        .upsert(entity_type, workspace, &outgoing, record.version),
                )
                .await;

            if !self.tenant.is_current(scope) {
                warn!(
                    workspace = %workspace,
                    record_id = %record.id,
                    "Discarding push result after workspace change"
                );
                return Ok(ControlFlow::Break(()));
            }

            match result {
                Ok(UpsertOutcome::Accepted {
                    canonical_code,
                    version,
                    server_timestamp,
                }) => {
                    let accepted = PushAccepted {
                        version,
                        server_timestamp,
                        canonical_code,
                    };
                    self.apply_accepted(workspace, &record, &accepted, report)
                        .await?;
                }
                Ok(UpsertOutcome::Conflict(snapshot)) => {
                    self.apply_conflict(workspace, &record, &snapshot, report)
                        .await?;
                }
                Ok(UpsertOutcome::Rejected { reason }) => {
                    self.apply_rejected(workspace, &record, &reason, report)
                        .await?;
                }
                Err(error) if error.is_permanent() => {
                    self.apply_rejected(workspace, &record, &error.to_string(), report)
                        .await?;
                }
                Err(error) => {
                    self.schedule_retry(workspace, &record, &error, report)
                        .await?;
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn apply_accepted(
        &self,
        workspace: &WorkspaceId,
        record: &SyncableRecord,
        accepted: &PushAccepted,
        report: &mut CycleReport,
    ) -> Result<()> {
        let purged = record.is_deleted && self.store.purge_tombstone(workspace, record).await?;
        if !purged {
            self.store.mark_accepted(workspace, record, accepted).await?;
        }
        self.cache
            .invalidate(&CacheKey::record(&record.entity_type, &record.id));
        self.tracker.clear_record(workspace, &record.id);
        report.pushed += 1;
        debug!(
            entity_type = %record.entity_type,
            record_id = %record.id,
            version = accepted.version,
            purged,
            "Push accepted"
        );

        if let (Some(provisional), Some(canonical)) =
            (&record.provisional_id, &accepted.canonical_code)
        {
            if provisional != canonical {
                self.rewrite_provisional(workspace, record, provisional, canonical)
                    .await?;
            }
        }
        Ok(())
    }

    /// Replace a provisional code with its canonical form everywhere in the workspace
    async fn rewrite_provisional(
        &self,
        workspace: &WorkspaceId,
        pushed: &SyncableRecord,
        provisional: &str,
        canonical: &str,
    ) -> Result<()> {
        let mentioning = self.store.list_mentioning(workspace, provisional).await?;
        let mut rewritten = 0_usize;
        for candidate in mentioning {
            let mut payload = candidate.payload.clone();
            if rewrite_references(&mut payload, provisional, canonical) == 0 {
                continue;
            }
            let is_pushed =
                candidate.id == pushed.id && candidate.entity_type == pushed.entity_type;
            if self
                .store
                .rewrite_payload(workspace, &candidate, &payload, !is_pushed)
                .await?
            {
                self.cache
                    .invalidate(&CacheKey::record(&candidate.entity_type, &candidate.id));
                rewritten += 1;
            }
        }
        info!(
            workspace = %workspace,
            provisional,
            canonical,
            rewritten,
            "Provisional code replaced"
        );
        Ok(())
    }

    async fn apply_conflict(
        &self,
        workspace: &WorkspaceId,
        record: &SyncableRecord,
        snapshot: &RemoteRecord,
        report: &mut CycleReport,
    ) -> Result<()> {
        if snapshot.workspace_id != *workspace || snapshot.id != record.id {
            let error = RemoteError::Protocol(format!(
                "conflict snapshot for {}:{} does not match the pushed record",
                snapshot.workspace_id, snapshot.id
            ));
            return self.schedule_retry(workspace, record, &error, report).await;
        }

        if self.store.mark_conflict(workspace, record, snapshot).await? {
            self.cache
                .invalidate(&CacheKey::record(&record.entity_type, &record.id));
            self.tracker.clear_record(workspace, &record.id);
            report.conflicts += 1;
            warn!(
                workspace = %workspace,
                entity_type = %record.entity_type,
                record_id = %record.id,
                basis_version = record.version,
                remote_version = snapshot.version,
                "Record moved to conflict"
            );
        }
        Ok(())
    }

    async fn apply_rejected(
        &self,
        workspace: &WorkspaceId,
        record: &SyncableRecord,
        reason: &str,
        report: &mut CycleReport,
    ) -> Result<()> {
        let now = now_ms();
        if self
            .store
            .mark_rejected(workspace, record, reason, now)
            .await?
        {
            report.rejected += 1;
            warn!(
                workspace = %workspace,
                entity_type = %record.entity_type,
                record_id = %record.id,
                reason,
                "Record rejected by remote store"
            );
            self.tracker.report(
                workspace,
                SyncErrorEntry {
                    kind: SyncErrorKind::Rejected,
                    entity_type: Some(record.entity_type.clone()),
                    record_id: Some(record.id),
                    message: reason.to_string(),
                    at: now,
                },
            );
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        workspace: &WorkspaceId,
        record: &SyncableRecord,
        error: &RemoteError,
        report: &mut CycleReport,
    ) -> Result<()> {
        let now = now_ms();
        let attempt = record.retry.attempt_count.saturating_add(1);
        let delay = self.backoff.delay_for(attempt);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let retry = RetryState {
            attempt_count: attempt,
            last_attempt_at: Some(now),
            next_attempt_at: Some(now.saturating_add(delay_ms)),
            last_error: Some(error.to_string()),
            rejected: false,
        };
        if !self.store.record_retry(workspace, record, &retry).await? {
            return Ok(());
        }

        report.retried += 1;
        warn!(
            workspace = %workspace,
            entity_type = %record.entity_type,
            record_id = %record.id,
            attempt,
            delay_ms,
            error = %error,
            "Push failed; retry scheduled"
        );

        let kind = if self.backoff.is_exhausted(attempt) {
            Some(SyncErrorKind::RetriesExhausted)
        } else if error.is_transient() {
            None
        } else {
            Some(SyncErrorKind::Remote)
        };
        if let Some(kind) = kind {
            self.tracker.report(
                workspace,
                SyncErrorEntry {
                    kind,
                    entity_type: Some(record.entity_type.clone()),
                    record_id: Some(record.id),
                    message: error.to_string(),
                    at: now,
                },
            );
        }
        Ok(())
    }

    async fn pull_entity_type(
        &self,
        scope: &TenantScope,
        entity_type: &EntityType,
        report: &mut CycleReport,
    ) -> Result<ControlFlow<()>> {
        let workspace = scope.workspace_id();
        let cursor = self.store.cursor(workspace, entity_type).await?;
        let result = self
            .call_remote(
                self.remote
                    .query_updated_since(entity_type, workspace, cursor),
            )
            .await;

        if !self.tenant.is_current(scope) {
            warn!(workspace = %workspace, entity_type = %entity_type, "Discarding pull after workspace change");
            return Ok(ControlFlow::Break(()));
        }

        let records = match result {
            Ok(records) => records,
            Err(error) => {
                report.pull_failures += 1;
                warn!(workspace = %workspace, entity_type = %entity_type, error = %error, "Delta query failed");
                if !error.is_transient() {
                    self.tracker.report(
                        workspace,
                        SyncErrorEntry {
                            kind: SyncErrorKind::Remote,
                            entity_type: Some(entity_type.clone()),
                            record_id: None,
                            message: error.to_string(),
                            at: now_ms(),
                        },
                    );
                }
                return Ok(ControlFlow::Continue(()));
            }
        };

        let mut newest = cursor;
        for remote in records {
            if remote.workspace_id != *workspace {
                warn!(
                    workspace = %workspace,
                    found = %remote.workspace_id,
                    record_id = %remote.id,
                    "Dropping remote record from another workspace"
                );
                continue;
            }
            if remote.entity_type != *entity_type {
                warn!(
                    expected = %entity_type,
                    found = %remote.entity_type,
                    record_id = %remote.id,
                    "Dropping remote record of another entity type"
                );
                continue;
            }
            if cursor.is_some_and(|cursor| remote.updated_at <= cursor) {
                continue;
            }
            if !self.tenant.is_current(scope) {
                return Ok(ControlFlow::Break(()));
            }

            match self.store.apply_remote(workspace, &remote).await? {
                RemoteApply::Applied | RemoteApply::Purged => {
                    self.cache
                        .invalidate(&CacheKey::record(&remote.entity_type, &remote.id));
                    report.pulled += 1;
                }
                RemoteApply::SkippedPending | RemoteApply::SkippedConflict => {
                    debug!(record_id = %remote.id, "Remote change held back by local state");
                    report.skipped_pending += 1;
                }
                RemoteApply::Stale | RemoteApply::Absent => {}
            }
            newest = Some(newest.map_or(remote.updated_at, |newest| newest.max(remote.updated_at)));
        }

        if let Some(newest) = newest.filter(|newest| Some(*newest) != cursor) {
            self.store
                .advance_cursor(workspace, entity_type, newest)
                .await?;
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Bound a remote call by the request timeout
    async fn call_remote<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, RemoteError>>,
    ) -> std::result::Result<T, RemoteError> {
        tokio::time::timeout(self.request_timeout, call)
            .await
            .unwrap_or(Err(RemoteError::Timeout))
    }

    fn set_phase(&self, workspace: &WorkspaceId, phase: SyncPhase) {
        if let Some(flight) = self.lock_flights().get_mut(workspace) {
            flight.phase = phase;
        }
    }

    fn lock_flights(&self) -> MutexGuard<'_, HashMap<WorkspaceId, Flight>> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a workspace's flight when the cycle ends, including on error
struct FlightGuard<'a> {
    flights: &'a Mutex<HashMap<WorkspaceId, Flight>>,
    tracker: &'a SyncStateTracker,
    schedule_changed: &'a Notify,
    workspace: WorkspaceId,
    active: bool,
}

impl FlightGuard<'_> {
    /// Consume a pending follow-up request, or release the flight if there is none
    fn take_follow_up_or_release(&mut self) -> Option<SyncTrigger> {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        let follow_up = flights
            .get_mut(&self.workspace)
            .and_then(|flight| flight.follow_up.take());
        if follow_up.is_none() {
            flights.remove(&self.workspace);
            self.tracker.end_cycle(&self.workspace);
            self.schedule_changed.notify_one();
            self.active = false;
        }
        follow_up
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.flights
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.workspace);
            self.tracker.end_cycle(&self.workspace);
            self.schedule_changed.notify_one();
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
