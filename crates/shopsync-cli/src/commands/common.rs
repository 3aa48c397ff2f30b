use std::env;
use std::path::{Path, PathBuf};

use serde_json::Value;
use shopsync_core::sync::{
    HttpRemote, PullRequest, PullResponse, PushRequest, PushResponse, RemoteError, RemoteResult,
    RemoteSync, SyncReport,
};
use shopsync_core::util::now_millis;
use shopsync_core::{
    ChangeOperation, ConflictRecord, Entity, LocalStore, Payload, SyncContext, SyncSettings,
    SyncStatistics,
};

use crate::error::CliError;

pub const ENV_DB_PATH: &str = "SHOPSYNC_DB_PATH";
pub const ENV_CONFIG_PATH: &str = "SHOPSYNC_CONFIG";

const PREVIEW_CHARS: usize = 60;

/// Remote used by the CLI; local commands work without one
pub enum CliRemote {
    Http(HttpRemote),
    Unconfigured,
}

impl CliRemote {
    pub const fn is_configured(&self) -> bool {
        matches!(self, Self::Http(_))
    }
}

impl RemoteSync for CliRemote {
    async fn pull(&self, request: PullRequest) -> RemoteResult<PullResponse> {
        match self {
            Self::Http(remote) => remote.pull(request).await,
            Self::Unconfigured => Err(not_configured()),
        }
    }

    async fn push(&self, request: PushRequest) -> RemoteResult<PushResponse> {
        match self {
            Self::Http(remote) => remote.push(request).await,
            Self::Unconfigured => Err(not_configured()),
        }
    }
}

fn not_configured() -> RemoteError {
    RemoteError::InvalidConfiguration("no remote configured".to_string())
}

pub struct Session {
    pub context: SyncContext<CliRemote>,
    pub remote_configured: bool,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os(ENV_DB_PATH).map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shopsync")
        .join("shopsync.db")
}

pub fn resolve_config_path(cli_config: Option<PathBuf>) -> PathBuf {
    cli_config
        .or_else(|| env::var_os(ENV_CONFIG_PATH).map(PathBuf::from))
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("shopsync")
                .join("config.json")
        })
}

pub fn load_settings(config_path: &Path) -> Result<SyncSettings, CliError> {
    Ok(SyncSettings::load(config_path)?.with_env()?)
}

pub fn open_session(db_path: &Path, config_path: &Path) -> Result<Session, CliError> {
    let settings = load_settings(config_path)?;
    let remote = if settings.remote_base_url().is_some() {
        CliRemote::Http(settings.http_remote()?)
    } else {
        CliRemote::Unconfigured
    };
    let remote_configured = remote.is_configured();

    let store = LocalStore::open_path(db_path)?;
    let context = SyncContext::open(store, remote, &settings)?;
    Ok(Session {
        context,
        remote_configured,
    })
}

/// Parse a JSON object given on the command line
pub fn parse_payload(raw: &str, what: &'static str) -> Result<Payload, CliError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(CliError::NotAnObject(what)),
    }
}

pub fn payload_preview(payload: &Payload, max_chars: usize) -> String {
    let rendered = Value::Object(payload.clone()).to_string();
    if rendered.chars().count() <= max_chars {
        return rendered;
    }
    let mut preview = rendered
        .chars()
        .take(max_chars.saturating_sub(3))
        .collect::<String>();
    preview.push_str("...");
    preview
}

pub fn format_entity_lines(entities: &[Entity]) -> Vec<String> {
    let now = now_millis();
    entities
        .iter()
        .map(|entity| {
            format!(
                "{}  {:<8}  v{:<3}  {:>8}  {}",
                entity.id,
                entity.sync_state.as_str(),
                entity.version,
                format_relative_time(entity.last_modified_at, now),
                payload_preview(&entity.payload, PREVIEW_CHARS)
            )
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[ConflictRecord]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {}  {}/{}  local=v{} remote=v{}  {}",
                format_sync_timestamp(conflict.detected_at),
                conflict.id,
                conflict.entity_type,
                conflict.entity_id,
                conflict.local_version.version,
                conflict.remote_version.version,
                conflict.resolution_strategy.as_str()
            )
        })
        .collect()
}

pub fn format_operation_lines(operations: &[ChangeOperation]) -> Vec<String> {
    operations
        .iter()
        .map(|op| {
            format!(
                "{}  {:<6}  {}/{}  retries={}  {}",
                op.op_id,
                op.kind.as_str(),
                op.entity_type,
                op.entity_id,
                op.retry_count,
                op.last_error.as_deref().unwrap_or("-")
            )
        })
        .collect()
}

pub fn format_statistics_lines(stats: &SyncStatistics) -> Vec<String> {
    let last_sync = stats
        .last_sync_time
        .map_or_else(|| "never".to_string(), format_sync_timestamp);
    vec![
        format!("state:      {}", stats.state.as_str()),
        format!("pending:    {}", stats.pending),
        format!("syncing:    {}", stats.syncing),
        format!("synced:     {}", stats.synced),
        format!("conflicts:  {}", stats.conflicts),
        format!("failed:     {}", stats.failed),
        format!("queued ops: {}", stats.queued_operations),
        format!("last sync:  {last_sync}"),
    ]
}

pub fn format_report_line(report: &SyncReport) -> String {
    let mut line = format!(
        "Sync completed: pulled {} (applied {}, removed {}), pushed {}, conflicts {} (resolved {}), retried {}, failed {}",
        report.pulled,
        report.applied,
        report.removed,
        report.pushed,
        report.conflicts_detected,
        report.conflicts_resolved,
        report.retried,
        report.failed
    );
    if !report.skipped_types.is_empty() {
        let skipped = report
            .skipped_types
            .iter()
            .map(|entity_type| entity_type.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        line.push_str(&format!("; skipped {skipped}"));
    }
    line
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
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
