use crate::ipc::helpers::{get_optional_str, get_required_str, log, respond, store, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::model::LogAction;
use crate::stats::filter_by_class;
use crate::students::{self, clean_student_input};
use serde_json::json;

fn students_list(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let all = students::list_students(store).map_err(HandlerErr::query)?;
    let class = get_optional_str(params, "class");
    let in_class: Vec<_> = filter_by_class(&all, class.as_deref()).into_iter().cloned().collect();
    let matched = match get_optional_str(params, "query") {
        Some(q) => students::search_students(&in_class, &q).into_iter().cloned().collect(),
        None => in_class,
    };
    Ok(json!({ "students": matched, "total": all.len() }))
}

fn students_classes(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let all = students::list_students(store).map_err(HandlerErr::query)?;
    Ok(json!({ "classes": students::class_list(&all) }))
}

fn students_create(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let name = get_required_str(params, "name")?;
    let class = get_required_str(params, "class")?;
    let Some(student) = students::create_student(store, &name, &class).map_err(HandlerErr::write)? else {
        return Err(HandlerErr::bad_params("name and class must not be blank"));
    };
    log(
        store,
        params,
        LogAction::AddStudent,
        json!({ "studentId": student.id, "name": student.name, "class": student.class }),
    );
    Ok(json!({ "student": student }))
}

fn students_update(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let name = get_required_str(params, "name")?;
    let class = get_required_str(params, "class")?;
    if clean_student_input(&name, &class).is_none() {
        return Err(HandlerErr::bad_params("name and class must not be blank"));
    }
    let Some(edit) = students::update_student(store, &student_id, &name, &class).map_err(HandlerErr::write)? else {
        return Err(HandlerErr::not_found(format!("student not found: {}", student_id)));
    };
    log(
        store,
        params,
        LogAction::EditStudent,
        json!({ "studentId": student_id, "before": edit.before, "after": edit.after }),
    );
    Ok(json!({ "student": edit.after }))
}

fn students_delete(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let Some(deletion) = students::delete_student(store, &student_id).map_err(HandlerErr::write)? else {
        return Err(HandlerErr::not_found(format!("student not found: {}", student_id)));
    };
    log(
        store,
        params,
        LogAction::DeleteStudent,
        json!({
            "studentId": deletion.student.id,
            "name": deletion.student.name,
            "class": deletion.student.class,
            "deletedActivitiesCount": deletion.deleted_activities_count,
        }),
    );
    Ok(json!({
        "deleted": true,
        "deletedActivitiesCount": deletion.deleted_activities_count,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, &req.params),
        "students.classes" => students_classes(state),
        "students.create" => students_create(state, &req.params),
        "students.update" => students_update(state, &req.params),
        "students.delete" => students_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
