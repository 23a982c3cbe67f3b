use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tourbook_core::{Resolution, SyncableRecord};

use crate::commands::common::{
    open_session, parse_entity_type, parse_record_id, payload_preview, record_to_item,
    RecordItem,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    #[serde(flatten)]
    pub local: RecordItem,
    pub remote_version: Option<i64>,
    pub remote_payload: Option<Value>,
    pub remote_deleted: bool,
}

pub fn conflict_to_item(record: &SyncableRecord) -> ConflictItem {
    let snapshot = record.remote_snapshot.as_ref();
    ConflictItem {
        local: record_to_item(record),
        remote_version: snapshot.map(|remote| remote.version),
        remote_payload: snapshot.map(|remote| remote.payload.clone()),
        remote_deleted: snapshot.is_some_and(|remote| remote.deleted),
    }
}

pub fn format_conflict_lines(records: &[SyncableRecord]) -> Vec<String> {
    records
        .iter()
        .map(|record| {
            let local = payload_preview(&record.payload, 36);
            let remote = match &record.remote_snapshot {
                Some(snapshot) if snapshot.deleted => format!("v{} deleted", snapshot.version),
                Some(snapshot) => {
                    format!("v{} {}", snapshot.version, payload_preview(&snapshot.payload, 36))
                }
                None => "unknown".to_string(),
            };
            format!(
                "{}:{}  local {local}  remote {remote}",
                record.entity_type, record.id
            )
        })
        .collect()
}

pub async fn run_conflicts(
    entity: Option<&str>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let entity_type = entity.map(parse_entity_type).transpose()?;
    let service = open_session(db_path).await?;
    let conflicts = service.conflicts(entity_type.as_ref()).await?;

    if as_json {
        let items = conflicts
            .iter()
            .map(conflict_to_item)
            .collect::<Vec<ConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }
    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_resolve(
    entity: &str,
    id: &str,
    resolution: Resolution,
    db_path: &Path,
) -> Result<(), CliError> {
    let entity_type = parse_entity_type(entity)?;
    let id = parse_record_id(id)?;
    let service = open_session(db_path).await?;

    match service.resolve_conflict(&entity_type, &id, resolution).await? {
        Some(record) if record.is_pending() => println!("{id} queued for the next sync"),
        Some(_) => println!("{id} now matches the remote copy"),
        None => println!("{id} removed (deleted remotely)"),
    }
    Ok(())
}
