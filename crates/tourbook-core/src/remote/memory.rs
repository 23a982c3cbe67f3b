//! In-process remote store with fault injection, for tests and offline demos

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::authority::{canonicalize_payload, decide_upsert, UpsertDecision};
use super::protocol::OutgoingRecord;
use super::{RemoteError, RemoteStore, UpsertOutcome};
use crate::models::{EntityType, RecordId, RemoteRecord, WorkspaceId};

/// A failure to inject into the next matching call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFault {
    /// Fail with [`RemoteError::Timeout`]
    Timeout,
    /// Fail with [`RemoteError::Network`]
    Network,
    /// Fail with a 503 [`RemoteError::Unavailable`]
    Unavailable,
    /// Answer with [`UpsertOutcome::Rejected`]
    Rejected(String),
    /// Process normally after sleeping, so caller-side timeouts can fire
    Delay(Duration),
}

type RecordKey = (WorkspaceId, EntityType, RecordId);

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<RecordKey, RemoteRecord>,
    clock: i64,
    code_prefixes: HashMap<EntityType, (String, i64)>,
    code_counters: HashMap<(WorkspaceId, EntityType), i64>,
    upsert_faults: VecDeque<RemoteFault>,
    record_faults: HashMap<RecordId, VecDeque<RemoteFault>>,
    query_faults: VecDeque<RemoteFault>,
    offline: bool,
    upsert_calls: usize,
    query_calls: usize,
}

impl MemoryState {
    /// Strictly increasing server clock (Unix ms)
    fn next_timestamp(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.clock = now.max(self.clock + 1);
        self.clock
    }

    fn next_code(&mut self, workspace: &WorkspaceId, entity_type: &EntityType) -> Option<String> {
        let (prefix, first) = self.code_prefixes.get(entity_type)?.clone();
        let counter = self
            .code_counters
            .entry((workspace.clone(), entity_type.clone()))
            .or_insert(first - 1);
        *counter += 1;
        Some(format!("{prefix}-{counter}"))
    }
}

/// Remote store kept entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    state: Mutex<MemoryState>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign canonical codes `<prefix>-<n>` to `entity_type`, starting at `first`
    pub fn assign_codes(&self, entity_type: EntityType, prefix: impl Into<String>, first: i64) {
        self.lock()
            .code_prefixes
            .insert(entity_type, (prefix.into(), first));
    }

    /// Make every call fail with a network error until set back online
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Inject `fault` into the next `times` upserts
    pub fn fail_next_upserts(&self, fault: RemoteFault, times: usize) {
        self.lock()
            .upsert_faults
            .extend(std::iter::repeat_n(fault, times));
    }

    /// Inject `fault` into the next `times` upserts of one record
    pub fn fail_record(&self, id: RecordId, fault: RemoteFault, times: usize) {
        self.lock()
            .record_faults
            .entry(id)
            .or_default()
            .extend(std::iter::repeat_n(fault, times));
    }

    /// Inject `fault` into the next `times` delta queries
    pub fn fail_next_queries(&self, fault: RemoteFault, times: usize) {
        self.lock()
            .query_faults
            .extend(std::iter::repeat_n(fault, times));
    }

    /// Simulate a write by another session, bypassing version checks
    pub fn write_as_other_client(
        &self,
        entity_type: &EntityType,
        workspace: &WorkspaceId,
        id: RecordId,
        payload: serde_json::Value,
    ) -> RemoteRecord {
        let mut state = self.lock();
        let updated_at = state.next_timestamp();
        let key = (workspace.clone(), entity_type.clone(), id);
        let previous = state.records.get(&key);
        let record = RemoteRecord {
            entity_type: entity_type.clone(),
            id,
            workspace_id: workspace.clone(),
            payload,
            version: previous.map_or(1, |record| record.version + 1),
            updated_at,
            canonical_code: previous.and_then(|record| record.canonical_code.clone()),
            deleted: false,
        };
        state.records.insert(key, record.clone());
        record
    }

    /// Simulate a deletion by another session
    pub fn delete_as_other_client(
        &self,
        entity_type: &EntityType,
        workspace: &WorkspaceId,
        id: RecordId,
    ) -> Option<RemoteRecord> {
        let mut state = self.lock();
        let updated_at = state.next_timestamp();
        let record = state
            .records
            .get_mut(&(workspace.clone(), entity_type.clone(), id))?;
        record.deleted = true;
        record.version += 1;
        record.updated_at = updated_at;
        Some(record.clone())
    }

    pub fn get(
        &self,
        entity_type: &EntityType,
        workspace: &WorkspaceId,
        id: RecordId,
    ) -> Option<RemoteRecord> {
        self.lock()
            .records
            .get(&(workspace.clone(), entity_type.clone(), id))
            .cloned()
    }

    /// Number of live records stored for `workspace`
    pub fn record_count(&self, workspace: &WorkspaceId) -> usize {
        self.lock()
            .records
            .iter()
            .filter(|((ws, _, _), record)| ws == workspace && !record.deleted)
            .count()
    }

    pub fn upsert_calls(&self) -> usize {
        self.lock().upsert_calls
    }

    pub fn query_calls(&self) -> usize {
        self.lock().query_calls
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call and pop the fault it should suffer, if any
    fn begin_upsert(&self, id: RecordId) -> Result<Option<RemoteFault>, RemoteError> {
        let mut state = self.lock();
        state.upsert_calls += 1;
        if state.offline {
            return Err(RemoteError::Network("remote store unreachable".to_string()));
        }
        let record_fault = state
            .record_faults
            .get_mut(&id)
            .and_then(VecDeque::pop_front);
        Ok(record_fault.or_else(|| state.upsert_faults.pop_front()))
    }

    fn begin_query(&self) -> Result<Option<RemoteFault>, RemoteError> {
        let mut state = self.lock();
        state.query_calls += 1;
        if state.offline {
            return Err(RemoteError::Network("remote store unreachable".to_string()));
        }
        Ok(state.query_faults.pop_front())
    }

    fn apply_upsert(
        &self,
        entity_type: &EntityType,
        workspace: &WorkspaceId,
        record: &OutgoingRecord,
        basis_version: i64,
    ) -> UpsertOutcome {
        let mut state = self.lock();
        let key = (workspace.clone(), entity_type.clone(), record.id);
        let existing = state.records.get(&key).cloned();

        match decide_upsert(existing.as_ref(), record, basis_version) {
            UpsertDecision::Write { version } => {
                let mut canonical_code = existing.and_then(|stored| stored.canonical_code);
                if canonical_code.is_none() && record.provisional_code.is_some() {
                    canonical_code = state.next_code(workspace, entity_type);
                }
                let server_timestamp = state.next_timestamp();
                let stored = RemoteRecord {
                    entity_type: entity_type.clone(),
                    id: record.id,
                    workspace_id: workspace.clone(),
                    payload: canonicalize_payload(record, canonical_code.as_deref()),
                    version,
                    updated_at: server_timestamp,
                    canonical_code: canonical_code.clone(),
                    deleted: record.deleted,
                };
                state.records.insert(key, stored);
                UpsertOutcome::Accepted {
                    canonical_code,
                    version,
                    server_timestamp,
                }
            }
            UpsertDecision::Replay => match existing {
                Some(stored) => UpsertOutcome::Accepted {
                    canonical_code: stored.canonical_code,
                    version: stored.version,
                    server_timestamp: stored.updated_at,
                },
                None => UpsertOutcome::Rejected {
                    reason: "nothing to replay".to_string(),
                },
            },
            UpsertDecision::Conflict => match existing {
                Some(stored) => UpsertOutcome::Conflict(stored),
                None => UpsertOutcome::Rejected {
                    reason: "conflict without a stored record".to_string(),
                },
            },
            UpsertDecision::Reject(reason) => UpsertOutcome::Rejected { reason },
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn upsert(
        &self,
        entity_type: &EntityType,
        workspace: &WorkspaceId,
        record: &OutgoingRecord,
        basis_version: i64,
    ) -> Result<UpsertOutcome, RemoteError> {
        match self.begin_upsert(record.id)? {
            Some(RemoteFault::Timeout) => return Err(RemoteError::Timeout),
            Some(RemoteFault::Network) => {
                return Err(RemoteError::Network("connection reset".to_string()))
            }
            Some(RemoteFault::Unavailable) => {
                return Err(RemoteError::Unavailable {
                    status: 503,
                    message: "service unavailable".to_string(),
                })
            }
            Some(RemoteFault::Rejected(reason)) => return Ok(UpsertOutcome::Rejected { reason }),
            Some(RemoteFault::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        if &record.workspace_id != workspace {
            return Ok(UpsertOutcome::Rejected {
                reason: format!(
                    "record belongs to workspace {}, request scoped to {workspace}",
                    record.workspace_id
                ),
            });
        }

        Ok(self.apply_upsert(entity_type, workspace, record, basis_version))
    }

    async fn query_updated_since(
        &self,
        entity_type: &EntityType,
        workspace: &WorkspaceId,
        since: Option<i64>,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        match self.begin_query()? {
            Some(RemoteFault::Timeout) => return Err(RemoteError::Timeout),
            Some(RemoteFault::Network) => {
                return Err(RemoteError::Network("connection reset".to_string()))
            }
            Some(RemoteFault::Unavailable) => {
                return Err(RemoteError::Unavailable {
                    status: 503,
                    message: "service unavailable".to_string(),
                })
            }
            Some(RemoteFault::Rejected(reason)) => return Err(RemoteError::Rejected(reason)),
            Some(RemoteFault::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        let since = since.unwrap_or(i64::MIN);
        let mut records: Vec<RemoteRecord> = self
            .lock()
            .records
            .iter()
            .filter(|((ws, et, _), record)| {
                ws == workspace && et == entity_type && record.updated_at > since
            })
            .map(|(_, record)| record.clone())
            .collect();
        records.sort_by_key(|record| record.updated_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn orders() -> EntityType {
        EntityType::new("orders").unwrap()
    }

    fn ws(id: &str) -> WorkspaceId {
        WorkspaceId::new(id).unwrap()
    }

    fn outgoing(workspace: &str, payload: serde_json::Value) -> OutgoingRecord {
        OutgoingRecord {
            id: RecordId::new(),
            workspace_id: ws(workspace),
            payload,
            provisional_code: None,
            deleted: false,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upsert_assigns_canonical_code() {
        let remote = InMemoryRemoteStore::new();
        remote.assign_codes(orders(), "R", 42);
        let mut record = outgoing("a", json!({"code": "TBC-1"}));
        record.provisional_code = Some("TBC-1".to_string());

        let outcome = remote.upsert(&orders(), &ws("a"), &record, 0).await.unwrap();
        let UpsertOutcome::Accepted {
            canonical_code,
            version,
            ..
        } = outcome
        else {
            panic!("expected acceptance, got {outcome:?}");
        };
        assert_eq!(canonical_code.as_deref(), Some("R-42"));
        assert_eq!(version, 1);
        let stored = remote.get(&orders(), &ws("a"), record.id).unwrap();
        assert_eq!(stored.payload, json!({"code": "R-42"}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upsert_rejects_cross_tenant_record() {
        let remote = InMemoryRemoteStore::new();
        let record = outgoing("a", json!({}));
        let outcome = remote.upsert(&orders(), &ws("b"), &record, 0).await.unwrap();
        assert!(matches!(outcome, UpsertOutcome::Rejected { .. }));
        assert_eq!(remote.record_count(&ws("b")), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_basis_returns_snapshot() {
        let remote = InMemoryRemoteStore::new();
        let record = outgoing("a", json!({"v": 1}));
        remote.upsert(&orders(), &ws("a"), &record, 0).await.unwrap();
        remote.write_as_other_client(&orders(), &ws("a"), record.id, json!({"v": "other"}));

        let outcome = remote.upsert(&orders(), &ws("a"), &record, 1).await.unwrap();
        let UpsertOutcome::Conflict(snapshot) = outcome else {
            panic!("expected conflict, got {outcome:?}");
        };
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.payload, json!({"v": "other"}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn faults_are_consumed_in_order() {
        let remote = InMemoryRemoteStore::new();
        let record = outgoing("a", json!({}));
        remote.fail_record(record.id, RemoteFault::Timeout, 2);

        for _ in 0..2 {
            let err = remote
                .upsert(&orders(), &ws("a"), &record, 0)
                .await
                .unwrap_err();
            assert_eq!(err, RemoteError::Timeout);
        }
        assert!(remote.upsert(&orders(), &ws("a"), &record, 0).await.is_ok());
        assert_eq!(remote.upsert_calls(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn query_is_scoped_and_strictly_newer() {
        let remote = InMemoryRemoteStore::new();
        let first = remote.write_as_other_client(&orders(), &ws("a"), RecordId::new(), json!({}));
        let second = remote.write_as_other_client(&orders(), &ws("a"), RecordId::new(), json!({}));
        remote.write_as_other_client(&orders(), &ws("b"), RecordId::new(), json!({}));

        let all = remote
            .query_updated_since(&orders(), &ws("a"), None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(first.updated_at < second.updated_at);

        let newer = remote
            .query_updated_since(&orders(), &ws("a"), Some(first.updated_at))
            .await
            .unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].id, second.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_fails_every_call() {
        let remote = InMemoryRemoteStore::new();
        remote.set_offline(true);
        let record = outgoing("a", json!({}));
        let err = remote
            .upsert(&orders(), &ws("a"), &record, 0)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(remote
            .query_updated_since(&orders(), &ws("a"), None)
            .await
            .is_err());
    }
}
