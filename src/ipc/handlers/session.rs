use crate::db;
use crate::ipc::helpers::{get_required_str, log_as, respond, store, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::{Actor, LogAction, Student};
use crate::store::DocumentStore;
use crate::students;
use serde_json::json;

/// Settings key holding the student picked on this device.
pub const SESSION_KEY: &str = "session.studentId";

/// The remembered student, if it still exists. A stale id is forgotten.
pub fn current_student(store: &DocumentStore) -> Result<Option<Student>, HandlerErr> {
    let saved = db::settings_get_json(store.conn(), SESSION_KEY).map_err(HandlerErr::query)?;
    let Some(id) = saved.as_ref().and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    let student = students::get_student(store, id).map_err(HandlerErr::query)?;
    if student.is_none() {
        tracing::info!(student_id = id, "forgetting session for removed student");
        db::settings_delete(store.conn(), SESSION_KEY).map_err(HandlerErr::write)?;
    }
    Ok(student)
}

fn session_get(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    Ok(json!({ "student": current_student(store)? }))
}

fn session_select(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let Some(student) = students::get_student(store, &student_id).map_err(HandlerErr::query)? else {
        return Err(HandlerErr::not_found(format!("student not found: {}", student_id)));
    };
    db::settings_set_json(store.conn(), SESSION_KEY, &json!(student.id)).map_err(HandlerErr::write)?;
    log_as(
        store,
        params,
        LogAction::StudentLogin,
        &Actor::student(&student),
        json!({ "studentId": student.id, "name": student.name, "class": student.class }),
    );
    Ok(json!({ "student": student }))
}

fn session_clear(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let previous = current_student(store)?;
    db::settings_delete(store.conn(), SESSION_KEY).map_err(HandlerErr::write)?;
    if let Some(student) = &previous {
        log_as(
            store,
            params,
            LogAction::StudentLogout,
            &Actor::student(student),
            json!({ "studentId": student.id, "name": student.name }),
        );
    }
    Ok(json!({ "cleared": previous.is_some() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "session.get" => session_get(state),
        "session.select" => session_select(state, &req.params),
        "session.clear" => session_clear(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
