use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub fn event(name: &str, body: serde_json::Value) -> serde_json::Value {
    let mut out = json!({ "event": name });
    if let (Some(out), serde_json::Value::Object(fields)) = (out.as_object_mut(), body) {
        out.extend(fields);
    }
    out
}
