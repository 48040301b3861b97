use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::types::AppState;
use crate::model::{ActivityType, Actor, LogAction};
use crate::normalize::normalize_date;
use crate::store::{BatchFailure, DocumentStore};
use serde_json::{json, Value};

pub const DEFAULT_ADMIN_NAME: &str = "Admin";

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    /// A failed read. Nothing partial goes back to the caller.
    pub fn query(e: anyhow::Error) -> Self {
        tracing::error!("store query failed: {e:#}");
        Self::new("db_query_failed", format!("{e:#}"))
    }

    /// A failed write. A chunked commit that stopped part way reports how far
    /// it got.
    pub fn write(e: anyhow::Error) -> Self {
        tracing::error!("store write failed: {e:#}");
        if let Some(failure) = e.downcast_ref::<BatchFailure>() {
            return Self {
                code: "batch_failed",
                message: failure.to_string(),
                details: Some(json!({
                    "committedWrites": failure.committed_writes,
                    "committedBatches": failure.committed_batches,
                    "failedBatch": failure.failed_batch,
                    "totalBatches": failure.total_batches,
                })),
            };
        }
        Self::new("db_write_failed", format!("{e:#}"))
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn respond(id: &str, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn store(state: &AppState) -> Result<&DocumentStore, HandlerErr> {
    state
        .store
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_required_date(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, key)?;
    normalize_date(&raw).ok_or_else(|| HandlerErr::bad_params(format!("invalid {}: {}", key, raw)))
}

pub fn get_optional_date(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match get_optional_str(params, key) {
        Some(raw) => normalize_date(&raw)
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("invalid {}: {}", key, raw))),
        None => Ok(None),
    }
}

pub fn get_activity_type(params: &Value, key: &str) -> Result<ActivityType, HandlerErr> {
    let raw = get_required_str(params, key)?;
    ActivityType::parse(&raw).ok_or_else(|| HandlerErr::bad_params(format!("unknown activity type: {}", raw)))
}

/// `params.actor` when the caller identifies itself, otherwise the admin.
pub fn actor(params: &Value) -> Actor {
    params
        .get("actor")
        .and_then(|v| serde_json::from_value::<Actor>(v.clone()).ok())
        .unwrap_or_else(|| Actor::admin(DEFAULT_ADMIN_NAME))
}

pub fn user_agent(params: &Value) -> String {
    get_optional_str(params, "userAgent")
        .unwrap_or_else(|| format!("ibadahd/{}", env!("CARGO_PKG_VERSION")))
}

/// Audit entry for a mutation that already succeeded.
pub fn log(store: &DocumentStore, params: &Value, action: LogAction, details: Value) {
    audit::log_activity(store, action, &actor(params), details, &user_agent(params));
}

pub fn log_as(store: &DocumentStore, params: &Value, action: LogAction, actor: &Actor, details: Value) {
    audit::log_activity(store, action, actor, details, &user_agent(params));
}
