use crate::audit;
use crate::ipc::helpers::{get_optional_date, respond, store, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn logs_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let date = get_optional_date(params, "date")?;
    let limit = params.get("limit").and_then(|v| v.as_u64()).map(|n| n as usize);
    let logs = audit::list_logs(store, date.as_deref(), limit).map_err(HandlerErr::query)?;
    Ok(json!({ "logs": logs }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "logs.list" => Some(respond(&req.id, logs_list(state, &req.params))),
        _ => None,
    }
}
