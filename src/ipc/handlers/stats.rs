use crate::activities::query_activities;
use crate::ipc::helpers::{get_optional_str, get_required_date, get_required_str, respond, store, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::ActivityFilter;
use crate::stats;
use crate::students;
use serde_json::json;

fn stats_dashboard(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let date = get_required_date(params, "date")?;
    let class = get_optional_str(params, "class");
    let all_students = students::list_students(store).map_err(HandlerErr::query)?;
    let day = query_activities(
        store,
        &ActivityFilter {
            student_id: None,
            date: Some(date.clone()),
        },
    )
    .map_err(HandlerErr::query)?;

    Ok(json!({
        "date": date,
        "class": class.clone().unwrap_or_else(|| "all".to_string()),
        "classes": students::class_list(&all_students),
        "stats": stats::compute_stats(&all_students, &day, class.as_deref()),
        "rows": stats::dashboard_rows(&all_students, &day, class.as_deref()),
    }))
}

fn stats_student_progress(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let date = get_required_date(params, "date")?;
    let Some(student) = students::get_student(store, &student_id).map_err(HandlerErr::query)? else {
        return Err(HandlerErr::not_found(format!("student not found: {}", student_id)));
    };
    let own = query_activities(
        store,
        &ActivityFilter {
            student_id: Some(student_id.clone()),
            date: Some(date.clone()),
        },
    )
    .map_err(HandlerErr::query)?;
    let prayers = stats::prayer_count(&student_id, &own);

    Ok(json!({
        "student": student,
        "date": date,
        "progress": stats::student_progress(&student_id, &own),
        "prayerCount": prayers,
        "prayerBand": stats::PrayerBand::classify(prayers),
        "activities": own,
    }))
}

fn stats_overview(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let all_students = students::list_students(store).map_err(HandlerErr::query)?;
    let all = query_activities(store, &ActivityFilter::default()).map_err(HandlerErr::query)?;
    Ok(json!(stats::overview(&all_students, &all)))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "stats.dashboard" => stats_dashboard(state, &req.params),
        "stats.studentProgress" => stats_student_progress(state, &req.params),
        "stats.overview" => stats_overview(state),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
