use std::path::Path;

use tourbook_core::{SyncOutcome, Workspace, WorkspaceId};

use crate::commands::common::open_session;
use crate::error::CliError;

pub async fn run_workspace_use(
    id: &str,
    code: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let id = WorkspaceId::new(id)?;
    let service = open_session(db_path).await?;

    let known = service
        .workspaces()
        .await?
        .into_iter()
        .find(|workspace| workspace.id == id);
    let workspace = match (known, code) {
        (Some(mut known), Some(code)) => {
            code.trim().clone_into(&mut known.code);
            known
        }
        (Some(known), None) => known,
        (None, code) => {
            let code = code.map_or_else(|| id.to_string(), str::to_string);
            Workspace::new(id.clone(), code)
        }
    };

    let outcome = service.switch_workspace(workspace).await?;
    match outcome {
        SyncOutcome::Completed(report) if !report.cancelled => {
            println!("Switched to {id} (pulled {})", report.pulled);
        }
        _ => println!("Switched to {id}"),
    }
    Ok(())
}

pub async fn run_workspace_list(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let service = open_session(db_path).await?;
    let workspaces = service.workspaces().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&workspaces)?);
        return Ok(());
    }

    if workspaces.is_empty() {
        println!("No workspaces yet. Run `tourbook workspace use <id>`.");
        return Ok(());
    }
    let current = service.current_workspace().map(|workspace| workspace.id);
    for line in format_workspace_lines(&workspaces, current.as_ref()) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_workspace_current(db_path: &Path) -> Result<(), CliError> {
    let service = open_session(db_path).await?;
    match service.current_workspace() {
        Some(workspace) => println!("{} ({})", workspace.id, workspace.code),
        None => return Err(tourbook_core::Error::NoTenant.into()),
    }
    Ok(())
}

pub fn format_workspace_lines(
    workspaces: &[Workspace],
    current: Option<&WorkspaceId>,
) -> Vec<String> {
    workspaces
        .iter()
        .map(|workspace| {
            let marker = if current == Some(&workspace.id) { "*" } else { " " };
            format!("{marker} {:<24}  {}", workspace.id.to_string(), workspace.code)
        })
        .collect()
}
