use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tourbook_core::remote::{HttpRemoteStore, InMemoryRemoteStore, RemoteStore};
use tourbook_core::{
    ConfigError, EngineConfig, EntityType, RecordId, RemoteConfig, SyncService, SyncableRecord,
};

use crate::error::CliError;

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("TOURBOOK_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tourbook")
        .join("tourbook.db")
}

#[derive(Clone, Copy)]
enum OpenSessionMode {
    Standard,
    RequireRemote,
}

impl OpenSessionMode {
    const fn requires_remote(self) -> bool {
        matches!(self, Self::RequireRemote)
    }
}

pub async fn open_session(path: &Path) -> Result<SyncService, CliError> {
    open_session_with_mode(path, OpenSessionMode::Standard).await
}

pub async fn open_sync_session(path: &Path) -> Result<SyncService, CliError> {
    open_session_with_mode(path, OpenSessionMode::RequireRemote).await
}

async fn open_session_with_mode(
    path: &Path,
    mode: OpenSessionMode,
) -> Result<SyncService, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let config = EngineConfig::from_env()?;
    let (remote, online): (Arc<dyn RemoteStore>, bool) = match remote_from_env(&config)? {
        Some(http) => {
            tracing::debug!(base_url = %http.config().base_url, "Remote store configured");
            (Arc::new(http), true)
        }
        None if mode.requires_remote() => return Err(CliError::SyncNotConfigured),
        None => {
            // Local-only session: every remote call fails as unreachable
            let unreachable = InMemoryRemoteStore::new();
            unreachable.set_offline(true);
            (Arc::new(unreachable), false)
        }
    };

    let service = SyncService::open(path.to_path_buf(), remote, &config).await?;
    service.set_online(online);
    Ok(service)
}

fn remote_from_env(config: &EngineConfig) -> Result<Option<HttpRemoteStore>, CliError> {
    match RemoteConfig::from_env() {
        Ok(remote) => Ok(Some(HttpRemoteStore::new(remote, config.request_timeout)?)),
        Err(ConfigError::MissingVar(_)) => Ok(None),
        Err(error) => Err(error.into()),
    }
}

pub fn parse_entity_type(entity: &str) -> Result<EntityType, CliError> {
    Ok(EntityType::new(entity)?)
}

pub fn parse_record_id(id: &str) -> Result<RecordId, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(CliError::InvalidInput("Record ID cannot be empty".to_string()));
    }
    trimmed
        .parse::<RecordId>()
        .map_err(|_| CliError::InvalidInput(format!("'{trimmed}' is not a record ID")))
}

/// Parse a payload argument; `-` reads it from piped stdin
pub fn resolve_payload(argument: &str) -> Result<Value, CliError> {
    if argument.trim() == "-" {
        let text = read_piped_stdin()?
            .ok_or_else(|| CliError::InvalidInput("No payload on stdin".to_string()))?;
        return parse_payload(&text);
    }
    parse_payload(argument)
}

pub fn parse_payload(text: &str) -> Result<Value, CliError> {
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|error| CliError::InvalidInput(format!("Payload is not valid JSON: {error}")))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(CliError::InvalidInput(
            "Payload must be a JSON object".to_string(),
        ))
    }
}

fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    let trimmed = buffer.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

#[derive(Debug, Serialize)]
pub struct RecordItem {
    pub id: String,
    pub entity_type: String,
    pub code: Option<String>,
    pub status: String,
    pub version: i64,
    pub payload: Value,
    pub updated_at: i64,
    pub relative_time: String,
    pub last_error: Option<String>,
}

pub fn record_to_item(record: &SyncableRecord) -> RecordItem {
    let now_ms = Utc::now().timestamp_millis();
    RecordItem {
        id: record.id.to_string(),
        entity_type: record.entity_type.to_string(),
        code: record.display_code().map(str::to_string),
        status: record_status_label(record),
        version: record.version,
        payload: record.payload.clone(),
        updated_at: record.local_updated_at,
        relative_time: format_relative_time(record.local_updated_at, now_ms),
        last_error: record.retry.last_error.clone(),
    }
}

/// Sync status, with rejected pending records called out
pub fn record_status_label(record: &SyncableRecord) -> String {
    if record.is_pending() && record.retry.rejected {
        "rejected".to_string()
    } else {
        record.sync_status.to_string()
    }
}

pub fn format_record_lines(records: &[SyncableRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let id = record.id.to_string();
            let short_id = id.chars().take(13).collect::<String>();
            let code = record.display_code().unwrap_or("-");
            let status = record_status_label(record);
            let preview = payload_preview(&record.payload, 40);
            let relative_time = format_relative_time(record.local_updated_at, now_ms);
            format!("{short_id:<13}  {code:<10}  {status:<9}  {preview:<40}  {relative_time}")
        })
        .collect()
}

/// Compact single-line JSON, truncated to `max_chars`
pub fn payload_preview(payload: &Value, max_chars: usize) -> String {
    let compact = payload.to_string();
    if compact.chars().count() <= max_chars {
        compact
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = compact.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
