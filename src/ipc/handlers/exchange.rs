use crate::exchange::{self, FileFormat, ImportMode};
use crate::ipc::helpers::{
    get_optional_date, get_optional_str, get_required_date, get_required_str, log, respond, store, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::model::LogAction;
use crate::students;
use anyhow::Context;
use serde_json::json;
use std::path::{Path, PathBuf};

fn import_mode(params: &serde_json::Value) -> Result<ImportMode, HandlerErr> {
    match get_optional_str(params, "mode").as_deref() {
        None | Some("single") => Ok(ImportMode::SingleDate(get_required_date(params, "date")?)),
        Some("multi") => {
            let from = get_optional_date(params, "from")?;
            let to = get_optional_date(params, "to")?;
            if let (Some(f), Some(t)) = (&from, &to) {
                if t < f {
                    return Err(HandlerErr::bad_params("to is before from"));
                }
            }
            Ok(ImportMode::MultiDate { from, to })
        }
        Some(other) => Err(HandlerErr::bad_params(format!("unknown import mode: {}", other))),
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn exchange_import(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let in_path = PathBuf::from(get_required_str(params, "path")?);
    let mode = import_mode(params)?;
    let ext = extension_of(&in_path);
    if FileFormat::from_extension(&ext).is_none() {
        return Err(HandlerErr::new(
            "bad_file",
            format!("unsupported file type: {}", in_path.to_string_lossy()),
        ));
    }

    let bytes = std::fs::read(&in_path).map_err(|e| HandlerErr {
        code: "file_read_failed",
        message: e.to_string(),
        details: Some(json!({ "path": in_path.to_string_lossy() })),
    })?;
    let parsed = exchange::parse_import_file(&bytes, &ext).map_err(|e| HandlerErr {
        code: "bad_file",
        message: format!("{e:#}"),
        details: Some(json!({ "path": in_path.to_string_lossy() })),
    })?;
    let summary = exchange::import_activities(store, &parsed, &mode).map_err(HandlerErr::write)?;

    let file_name = in_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut details = json!(summary);
    details["fileName"] = json!(file_name);
    log(store, params, LogAction::ImportActivities, details);
    Ok(json!(summary))
}

fn write_export(out_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    std::fs::write(out_path, bytes)
        .with_context(|| format!("failed to write {}", out_path.to_string_lossy()))
}

/// Writes the recap for one day or an inclusive range into `outDir`.
fn exchange_export(state: &AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let store = store(state)?;
    let from = get_required_date(params, "from")?;
    let to = get_optional_date(params, "to")?;
    let out_dir = PathBuf::from(get_required_str(params, "outDir")?);
    let format = match get_optional_str(params, "format") {
        Some(f) => FileFormat::from_extension(&f)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown export format: {}", f)))?,
        None => FileFormat::Workbook,
    };
    let dates = exchange::expand_date_range(&from, to.as_deref().unwrap_or(&from))
        .map_err(|e| HandlerErr::bad_params(e.to_string()))?;

    let all_students = students::list_students(store).map_err(HandlerErr::query)?;
    let rows = exchange::export_activities(store, &dates, &all_students).map_err(HandlerErr::query)?;
    let bytes = match format {
        FileFormat::Delimited => exchange::to_csv(&rows),
        FileFormat::Workbook => exchange::to_xlsx(&rows).map_err(|e| HandlerErr::new("export_failed", format!("{e:#}")))?,
    };
    let file_name = exchange::export_file_name(&from, to.as_deref(), format);
    let out_path = out_dir.join(&file_name);
    write_export(&out_path, &bytes).map_err(|e| HandlerErr {
        code: "file_write_failed",
        message: format!("{e:#}"),
        details: Some(json!({ "path": out_path.to_string_lossy() })),
    })?;

    log(
        store,
        params,
        LogAction::ExportActivities,
        json!({
            "from": from,
            "to": to,
            "format": format.extension(),
            "fileName": file_name,
            "rows": rows.len(),
        }),
    );
    Ok(json!({
        "path": out_path.to_string_lossy(),
        "fileName": file_name,
        "rows": rows.len(),
        "dates": dates,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "exchange.import" => exchange_import(state, &req.params),
        "exchange.export" => exchange_export(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
