use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use tourbook_core::sync::{SyncErrorEntry, SyncState};
use tourbook_core::SyncSnapshot;

use crate::commands::common::{format_relative_time, open_session};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusItem {
    pub workspace: String,
    pub state: SyncState,
    #[serde(flatten)]
    pub snapshot: SyncSnapshot,
}

pub async fn run_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let service = open_session(db_path).await?;
    let snapshot = service.sync_status_snapshot().await?;
    let workspace = service
        .current_workspace()
        .map(|workspace| workspace.id.to_string())
        .unwrap_or_default();

    if as_json {
        let item = StatusItem {
            workspace,
            state: snapshot.state(),
            snapshot,
        };
        println!("{}", serde_json::to_string_pretty(&item)?);
        return Ok(());
    }

    println!("Workspace: {workspace}");
    for line in format_status_lines(&snapshot, Utc::now().timestamp_millis()) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_status_lines(snapshot: &SyncSnapshot, now_ms: i64) -> Vec<String> {
    let state = match snapshot.state() {
        SyncState::Offline => "offline",
        SyncState::Syncing => "syncing",
        SyncState::Synced => "synced",
        SyncState::Error => "needs attention",
    };
    let mut lines = vec![
        format!("State: {state}"),
        format!("Pending: {}", snapshot.pending_count),
        format!("Conflicts: {}", snapshot.conflict_count),
    ];
    if snapshot.rejected_count > 0 {
        lines.push(format!(
            "Rejected: {} (edit the record to retry)",
            snapshot.rejected_count
        ));
    }
    if let Some(at) = snapshot.last_synced_at {
        lines.push(format!("Last synced: {}", format_relative_time(at, now_ms)));
    }
    lines.extend(snapshot.errors.iter().map(format_error_line));
    lines
}

pub fn format_error_line(entry: &SyncErrorEntry) -> String {
    match (&entry.entity_type, &entry.record_id) {
        (Some(entity_type), Some(id)) => format!("  ! {entity_type}:{id}: {}", entry.message),
        (Some(entity_type), None) => format!("  ! {entity_type}: {}", entry.message),
        _ => format!("  ! {}", entry.message),
    }
}
