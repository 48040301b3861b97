use crate::activities::{self, ActivityPatch, UpsertOutcome};
use crate::ipc::error::event;
use crate::ipc::helpers::{
    get_activity_type, get_optional_date, get_optional_str, get_required_date, get_required_str,
    log, respond, store, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{ActivityFilter, ActivityStatus, ActivityType, LogAction};
use crate::store::DocumentStore;
use crate::students;
use serde_json::json;
use std::collections::BTreeSet;

pub const SNAPSHOT_EVENT: &str = "activities.snapshot";

fn filter_from_params(params: &serde_json::Value) -> Result<ActivityFilter, HandlerErr> {
    Ok(ActivityFilter {
        student_id: get_optional_str(params, "studentId"),
        date: get_optional_date(params, "date")?,
    })
}

fn require_student(store: &DocumentStore, student_id: &str) -> Result<(), HandlerErr> {
    match students::get_student(store, student_id).map_err(HandlerErr::query)? {
        Some(_) => Ok(()),
        None => Err(HandlerErr::not_found(format!("student not found: {}", student_id))),
    }
}

fn outcome_details(outcome: &UpsertOutcome) -> serde_json::Value {
    json!({
        "activityId": outcome.after.id,
        "studentId": outcome.after.student_id,
        "date": outcome.after.date,
        "type": outcome.after.activity_type,
        "status": outcome.after.status,
        "created": outcome.created,
        "previousStatus": outcome.before.as_ref().map(|b| b.status),
    })
}

fn activities_query(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let filter = filter_from_params(params)?;
    let found = activities::query_activities(store, &filter).map_err(HandlerErr::query)?;
    Ok(json!({ "activities": found }))
}

fn activities_upsert(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let date = get_required_date(params, "date")?;
    let activity_type = get_activity_type(params, "type")?;
    let status = match get_optional_str(params, "status") {
        Some(raw) => Some(
            ActivityStatus::parse(&raw).ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", raw)))?,
        ),
        None => None,
    };
    let note = params.get("note").and_then(|v| v.as_str()).map(|s| s.to_string());
    require_student(store, &student_id)?;

    let outcome = activities::upsert_activity(store, &student_id, &date, activity_type, ActivityPatch { status, note })
        .map_err(HandlerErr::write)?;
    log(store, params, LogAction::UpsertActivity, outcome_details(&outcome));
    Ok(json!(outcome))
}

fn activities_toggle(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let date = get_required_date(params, "date")?;
    let activity_type = get_activity_type(params, "type")?;
    require_student(store, &student_id)?;

    let outcome =
        activities::toggle_activity(store, &student_id, &date, activity_type).map_err(HandlerErr::write)?;
    log(store, params, LogAction::ToggleActivity, outcome_details(&outcome));
    Ok(json!(outcome))
}

/// Edits the tadarus note, creating the record when there is none yet.
fn activities_set_note(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let date = get_required_date(params, "date")?;
    let note = get_required_str(params, "note")?;
    require_student(store, &student_id)?;

    let outcome = activities::upsert_activity(
        store,
        &student_id,
        &date,
        ActivityType::Tadarus,
        ActivityPatch {
            status: None,
            note: Some(note.clone()),
        },
    )
    .map_err(HandlerErr::write)?;
    log(
        store,
        params,
        LogAction::UpdateNote,
        json!({
            "activityId": outcome.after.id,
            "studentId": student_id,
            "date": date,
            "note": note,
            "previousNote": outcome.before.as_ref().map(|b| b.note.clone()),
        }),
    );
    Ok(json!(outcome))
}

fn activities_delete_batch(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let Some(raw_ids) = params.get("ids").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing ids"));
    };
    let ids: BTreeSet<String> = raw_ids
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.to_string())
        .collect();
    let deleted = activities::delete_activities_batch(store, &ids).map_err(HandlerErr::write)?;
    log(
        store,
        params,
        LogAction::DeleteActivities,
        json!({ "requested": ids.len(), "deletedCount": deleted }),
    );
    Ok(json!({ "deletedCount": deleted }))
}

fn activities_clear_all(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let deleted = activities::clear_all_activities(store).map_err(HandlerErr::write)?;
    log(store, params, LogAction::ClearActivities, json!({ "deletedCount": deleted }));
    Ok(json!({ "deletedCount": deleted }))
}

/// Registers a live view. The initial set comes back in the response; later
/// changes arrive as `activities.snapshot` events.
fn activities_subscribe(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let filter = filter_from_params(params)?;
    let store = store(state)?;
    let subscription = activities::subscribe_activities(store, filter).map_err(HandlerErr::query)?;
    let initial = subscription.latest().unwrap_or_default();

    let id = format!("sub-{}", state.next_subscription);
    state.next_subscription += 1;
    state.subscriptions.insert(id.clone(), subscription);
    tracing::debug!(subscription = %id, "activity subscription opened");
    Ok(json!({ "subscriptionId": id, "activities": initial }))
}

fn activities_unsubscribe(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "subscriptionId")?;
    let Some(subscription) = state.subscriptions.remove(&id) else {
        return Err(HandlerErr::not_found(format!("subscription not found: {}", id)));
    };
    subscription.unsubscribe();
    tracing::debug!(subscription = %id, "activity subscription closed");
    Ok(json!({ "unsubscribed": true }))
}

/// One event per subscription whose view changed since the last drain,
/// carrying only the newest set.
pub fn drain_events(state: &mut AppState) -> Vec<serde_json::Value> {
    state
        .subscriptions
        .iter()
        .filter_map(|(id, sub)| {
            sub.latest().map(|activities| {
                event(
                    SNAPSHOT_EVENT,
                    json!({ "subscriptionId": id, "activities": activities }),
                )
            })
        })
        .collect()
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "activities.query" => activities_query(state, &req.params),
        "activities.upsert" => activities_upsert(state, &req.params),
        "activities.toggle" => activities_toggle(state, &req.params),
        "activities.setNote" => activities_set_note(state, &req.params),
        "activities.deleteBatch" => activities_delete_batch(state, &req.params),
        "activities.clearAll" => activities_clear_all(state, &req.params),
        "activities.subscribe" => activities_subscribe(state, &req.params),
        "activities.unsubscribe" => activities_unsubscribe(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
