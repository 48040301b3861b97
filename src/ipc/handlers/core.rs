use crate::activities;
use crate::db;
use crate::ipc::handlers::session::{current_student, SESSION_KEY};
use crate::ipc::helpers::{log, respond, store, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::LogAction;
use crate::store::DocumentStore;
use crate::students;
use serde_json::json;
use std::path::{Path, PathBuf};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(
        &req.id,
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "batchLimit": state.config.batch_limit,
            "subscriptions": state.subscriptions.len(),
        })),
    )
}

/// Opens (or creates) the workspace database, dropping every live
/// subscription of the previous one.
pub fn open_workspace(
    state: &mut AppState,
    path: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let store = DocumentStore::open(path, state.config.batch_limit).map_err(|e| {
        tracing::error!(path = %path.display(), "failed to open workspace: {e:#}");
        HandlerErr::new("db_open_failed", format!("{e:#}"))
    })?;

    let seeded = if state.config.seed_roster {
        students::seed_default_roster(&store).map_err(HandlerErr::write)?
    } else {
        0
    };
    if seeded > 0 {
        log(&store, params, LogAction::SeedStudents, json!({ "count": seeded }));
    }
    let session = current_student(&store)?;

    let dropped = state.subscriptions.len();
    state.subscriptions.clear();

    tracing::info!(
        path = %path.display(),
        seeded,
        dropped_subscriptions = dropped,
        "workspace opened"
    );
    state.store = Some(store);
    state.workspace = Some(path.to_path_buf());
    Ok(json!({
        "workspacePath": path.to_string_lossy(),
        "seededStudents": seeded,
        "sessionStudent": session,
    }))
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return HandlerErr::bad_params("missing params.path").response(&req.id);
    };
    let params = req.params.clone();
    respond(&req.id, open_workspace(state, &path, &params))
}

/// Removes every student and activity, forgets the session and writes the
/// default roster back when seeding is enabled. Logs survive.
fn workspace_reset(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let deleted_activities = activities::clear_all_activities(store).map_err(HandlerErr::write)?;
    let deleted_students = students::delete_all_students(store).map_err(HandlerErr::write)?;
    db::settings_delete(store.conn(), SESSION_KEY).map_err(HandlerErr::write)?;
    let seeded = if state.config.seed_roster {
        students::seed_default_roster(store).map_err(HandlerErr::write)?
    } else {
        0
    };
    let details = json!({
        "deletedStudents": deleted_students,
        "deletedActivities": deleted_activities,
        "seededStudents": seeded,
    });
    log(store, params, LogAction::ResetData, details.clone());
    Ok(details)
}

fn handle_workspace_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    respond(&req.id, workspace_reset(state, &req.params))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "workspace.reset" => Some(handle_workspace_reset(state, req)),
        _ => None,
    }
}
