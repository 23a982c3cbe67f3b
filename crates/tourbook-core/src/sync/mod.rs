//! Synchronization: retry policy, connectivity hint, the reconciliation
//! engine, its background scheduler and the status tracker.

mod backoff;
mod connectivity;
mod engine;
mod report;
mod scheduler;
mod tracker;

pub use backoff::BackoffPolicy;
pub use connectivity::Connectivity;
pub use engine::ReconciliationEngine;
pub use report::{CycleReport, SyncOutcome, SyncPhase, SyncTrigger};
pub use scheduler::SyncScheduler;
pub use tracker::{SyncErrorEntry, SyncErrorKind, SyncSnapshot, SyncState, SyncStateTracker};
