//! Sync cycle triggers and outcomes

use std::fmt;

use serde::Serialize;

/// What started a sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Timer,
    Reconnect,
    /// A scheduled push retry came due
    Retry,
    /// Explicit "sync now"; runs even while the connectivity hint says offline
    Manual,
    TenantSwitch,
}

impl SyncTrigger {
    /// Background triggers respect the offline hint and the retry schedule
    pub const fn is_background(self) -> bool {
        !matches!(self, Self::Manual)
    }

    /// Trigger for one cycle standing in for both `self` and `later`
    ///
    /// A manual request is never downgraded to a background one; otherwise
    /// the later trigger wins.
    #[must_use]
    pub const fn strongest(self, later: Self) -> Self {
        if matches!(self, Self::Manual) {
            self
        } else {
            later
        }
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Timer => "timer",
            Self::Reconnect => "reconnect",
            Self::Retry => "retry",
            Self::Manual => "manual",
            Self::TenantSwitch => "tenant_switch",
        })
    }
}

/// Phase of the cycle currently running for a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Draining,
    Pulling,
}

/// Per-cycle counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub trigger: SyncTrigger,
    /// Cycles folded into this report (1 + coalesced follow-ups)
    pub cycles: u32,
    /// Records accepted by the remote store
    pub pushed: usize,
    /// Records moved into conflict
    pub conflicts: usize,
    /// Records scheduled for retry after a transient failure
    pub retried: usize,
    /// Records permanently rejected
    pub rejected: usize,
    /// Remote records applied locally (including purges)
    pub pulled: usize,
    /// Remote records not applied because the local copy was pending or in conflict
    pub skipped_pending: usize,
    /// Delta queries that failed
    pub pull_failures: usize,
    /// The workspace changed mid-cycle and results were discarded
    pub cancelled: bool,
}

impl CycleReport {
    pub const fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            cycles: 1,
            pushed: 0,
            conflicts: 0,
            retried: 0,
            rejected: 0,
            pulled: 0,
            skipped_pending: 0,
            pull_failures: 0,
            cancelled: false,
        }
    }

    /// Fold a follow-up cycle into this report; `cancelled` follows the last cycle
    pub fn absorb(&mut self, other: &Self) {
        self.cycles += other.cycles;
        self.pushed += other.pushed;
        self.conflicts += other.conflicts;
        self.retried += other.retried;
        self.rejected += other.rejected;
        self.pulled += other.pulled;
        self.skipped_pending += other.skipped_pending;
        self.pull_failures += other.pull_failures;
        self.cancelled = other.cancelled;
    }
}

/// Result of asking the engine to sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed(CycleReport),
    /// A cycle was already running; it will run once more when it finishes
    Coalesced,
    /// Background trigger while the connectivity hint says offline
    SkippedOffline,
}

impl SyncOutcome {
    pub const fn report(&self) -> Option<&CycleReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Coalesced | Self::SkippedOffline => None,
        }
    }
}
