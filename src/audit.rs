use crate::model::{as_document, Actor, LogAction, LogEntry, LOGS};
use crate::store::{server_timestamp, Direction, DocumentStore, Query};
use anyhow::Context;
use serde_json::{json, Value};

pub const DEFAULT_LOG_LIMIT: usize = 100;
pub const MAX_LOG_LIMIT: usize = 500;

/// Appends an audit entry. Never fails the caller: a write error is only
/// reported through tracing.
pub fn log_activity(
    store: &DocumentStore,
    action: LogAction,
    actor: &Actor,
    details: Value,
    user_agent: &str,
) {
    let doc = as_document(json!({
        "action": action.as_str(),
        "actor": actor,
        "details": details,
        "timestamp": server_timestamp(),
        "date": chrono::Local::now().format("%Y-%m-%d").to_string(),
        "userAgent": user_agent,
    }));
    match store.add(LOGS, doc) {
        Ok(id) => tracing::debug!(%id, action = action.as_str(), "audit entry written"),
        Err(e) => tracing::warn!(action = action.as_str(), "failed to write audit entry: {e:#}"),
    }
}

/// Newest entries first, optionally restricted to one local day.
pub fn list_logs(store: &DocumentStore, date: Option<&str>, limit: Option<usize>) -> anyhow::Result<Vec<LogEntry>> {
    let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let mut q = Query::collection(LOGS)
        .order_by("timestamp", Direction::Desc)
        .limit(limit);
    if let Some(date) = date {
        q = q.where_eq("date", date);
    }
    let snaps = store.query(&q).context("failed to list audit entries")?;
    Ok(snaps.iter().filter_map(LogEntry::from_snapshot).collect())
}
