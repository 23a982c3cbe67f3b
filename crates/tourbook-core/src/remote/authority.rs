//! Server-side upsert rules shared by every remote store implementation

use crate::models::{rewrite_references, RemoteRecord};

use super::protocol::OutgoingRecord;

/// What the authoritative side should do with an upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertDecision {
    /// Store the record under `version`
    Write { version: i64 },
    /// Same write arrived again after its response was lost; answer with the stored state
    Replay,
    /// Basis version is stale
    Conflict,
    /// Can never succeed
    Reject(String),
}

/// Decide an upsert of `record` against the currently stored `existing`
pub fn decide_upsert(
    existing: Option<&RemoteRecord>,
    record: &OutgoingRecord,
    basis_version: i64,
) -> UpsertDecision {
    if basis_version < 0 {
        return UpsertDecision::Reject("basis_version must not be negative".to_string());
    }

    let Some(existing) = existing else {
        return if basis_version == 0 || record.deleted {
            UpsertDecision::Write { version: 1 }
        } else {
            UpsertDecision::Reject(format!(
                "record {} does not exist at version {basis_version}",
                record.id
            ))
        };
    };

    if basis_version == existing.version {
        return UpsertDecision::Write {
            version: existing.version + 1,
        };
    }

    if basis_version + 1 == existing.version && is_same_write(existing, record) {
        return UpsertDecision::Replay;
    }

    UpsertDecision::Conflict
}

/// Payload as it will be stored once `canonical` replaces the provisional code
pub fn canonicalize_payload(
    record: &OutgoingRecord,
    canonical: Option<&str>,
) -> serde_json::Value {
    let mut payload = record.payload.clone();
    if let (Some(provisional), Some(canonical)) = (record.provisional_code.as_deref(), canonical) {
        rewrite_references(&mut payload, provisional, canonical);
    }
    payload
}

fn is_same_write(existing: &RemoteRecord, record: &OutgoingRecord) -> bool {
    existing.deleted == record.deleted
        && canonicalize_payload(record, existing.canonical_code.as_deref()) == existing.payload
}
