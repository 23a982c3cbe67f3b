use std::path::Path;

use crate::commands::common::{
    format_record_lines, open_session, parse_entity_type, parse_record_id, record_to_item,
    resolve_payload, RecordItem,
};
use crate::error::CliError;

pub async fn run_put(
    entity: &str,
    payload: &str,
    id: Option<&str>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let entity_type = parse_entity_type(entity)?;
    let payload = resolve_payload(payload)?;
    let id = id.map(parse_record_id).transpose()?;
    let service = open_session(db_path).await?;

    let record = service.write(&entity_type, payload, id).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&record_to_item(&record))?);
    } else {
        match record.display_code() {
            Some(code) => println!("{} {code}", record.id),
            None => println!("{}", record.id),
        }
    }
    Ok(())
}

pub async fn run_get(entity: &str, id: &str, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let entity_type = parse_entity_type(entity)?;
    let id = parse_record_id(id)?;
    let service = open_session(db_path).await?;

    let record = service
        .read(&entity_type, &id)
        .await?
        .ok_or_else(|| CliError::RecordNotFound(format!("{entity_type}:{id}")))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&record_to_item(&record))?);
    } else {
        for line in format_record_lines(std::slice::from_ref(&record)) {
            println!("{line}");
        }
        println!("{}", serde_json::to_string_pretty(&record.payload)?);
        if let Some(error) = &record.retry.last_error {
            println!("Last sync error: {error}");
        }
    }
    Ok(())
}

pub async fn run_list(
    entity: &str,
    limit: Option<usize>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let entity_type = parse_entity_type(entity)?;
    let service = open_session(db_path).await?;

    let mut records = service.list(&entity_type).await?;
    if let Some(limit) = limit {
        records.truncate(limit);
    }

    if as_json {
        let items = records.iter().map(record_to_item).collect::<Vec<RecordItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if records.is_empty() {
        println!("No {entity_type} records.");
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_rm(entity: &str, id: &str, db_path: &Path) -> Result<(), CliError> {
    let entity_type = parse_entity_type(entity)?;
    let id = parse_record_id(id)?;
    let service = open_session(db_path).await?;

    if !service.remove(&entity_type, &id).await? {
        return Err(CliError::RecordNotFound(format!("{entity_type}:{id}")));
    }
    println!("{id}");
    Ok(())
}
