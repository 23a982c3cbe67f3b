use std::path::Path;

use tourbook_core::sync::CycleReport;
use tourbook_core::SyncOutcome;

use crate::commands::common::open_sync_session;
use crate::commands::status::format_error_line;
use crate::error::CliError;

pub async fn run_sync(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let service = open_sync_session(db_path).await?;
    let outcome = service.trigger_sync().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    match &outcome {
        SyncOutcome::Completed(report) => println!("{}", format_report(report)),
        SyncOutcome::Coalesced => println!("A sync is already running"),
        SyncOutcome::SkippedOffline => println!("Offline; nothing synced"),
    }

    let snapshot = service.sync_status_snapshot().await?;
    for entry in &snapshot.errors {
        eprintln!("{}", format_error_line(entry));
    }
    if snapshot.conflict_count > 0 {
        println!(
            "{} record(s) in conflict. Run `tourbook conflicts` to review.",
            snapshot.conflict_count
        );
    }
    Ok(())
}

pub fn format_report(report: &CycleReport) -> String {
    if report.cancelled {
        return "Sync cancelled: the workspace changed".to_string();
    }
    let mut summary = format!("Sync completed: pushed {}, pulled {}", report.pushed, report.pulled);
    for (count, label) in [
        (report.conflicts, "conflicts"),
        (report.retried, "retrying"),
        (report.rejected, "rejected"),
        (report.skipped_pending, "kept local"),
        (report.pull_failures, "pull failures"),
    ] {
        if count > 0 {
            summary.push_str(&format!(", {label} {count}"));
        }
    }
    summary
}
