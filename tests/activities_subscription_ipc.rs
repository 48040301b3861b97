use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

const D: &str = "2026-02-18";

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_ibadahd");
    let mut child = Command::new(exe)
        .env("IBADAHD_SEED_ROSTER", "false")
        .env_remove("IBADAHD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn ibadahd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn read_json_line(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read line");
    assert!(!line.trim().is_empty(), "sidecar closed");
    serde_json::from_str(line.trim()).expect("parse json line")
}

/// Sends one request; returns its response and every event line written
/// after it. A trailing `health` call marks the end of those events.
fn request_with_events(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> (serde_json::Value, Vec<serde_json::Value>) {
    let fence = format!("{}-fence", id);
    writeln!(stdin, "{}", json!({ "id": id, "method": method, "params": params })).expect("write request");
    writeln!(stdin, "{}", json!({ "id": fence, "method": "health", "params": {} })).expect("write fence");
    stdin.flush().expect("flush");

    let response = read_json_line(reader);
    assert_eq!(response["id"], id);
    let mut events = Vec::new();
    loop {
        let value = read_json_line(reader);
        if value["id"] == fence.as_str() {
            break;
        }
        assert!(value.get("event").is_some(), "unexpected line {}", value);
        events.push(value);
    }
    (response, events)
}

#[test]
fn subscribers_receive_the_latest_matching_set_until_they_unsubscribe() {
    let workspace = temp_dir("ibadah-subscription");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_with_events(&mut stdin, &mut reader, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let (ahmad, _) = request_with_events(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "name": "Ahmad", "class": "1A" }),
    );
    let ahmad_id = ahmad["result"]["student"]["id"].as_str().expect("id").to_string();

    let (sub, events) = request_with_events(&mut stdin, &mut reader, "3", "activities.subscribe", json!({ "date": D }));
    assert!(events.is_empty());
    let sub_id = sub["result"]["subscriptionId"].as_str().expect("subscription id").to_string();
    assert_eq!(sub["result"]["activities"], json!([]));

    let (_, events) = request_with_events(
        &mut stdin,
        &mut reader,
        "4",
        "activities.toggle",
        json!({ "studentId": ahmad_id, "date": D, "type": "puasa" }),
    );
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event"], "activities.snapshot");
    assert_eq!(events[0]["subscriptionId"], sub_id.as_str());
    let snapshot = events[0]["activities"].as_array().expect("activities");
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0]["type"], "puasa");
    assert_eq!(snapshot[0]["status"], "done");

    // Several writes in one request collapse into one event.
    let (_, events) = request_with_events(
        &mut stdin,
        &mut reader,
        "5",
        "activities.upsert",
        json!({ "studentId": ahmad_id, "date": D, "type": "puasa", "status": "pending" }),
    );
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["activities"][0]["status"], "pending");

    // Reads and audit writes do not wake activity subscribers.
    let (_, events) = request_with_events(&mut stdin, &mut reader, "6", "logs.list", json!({}));
    assert!(events.is_empty());

    let (unsub, _) = request_with_events(
        &mut stdin,
        &mut reader,
        "7",
        "activities.unsubscribe",
        json!({ "subscriptionId": sub_id }),
    );
    assert_eq!(unsub["result"]["unsubscribed"], true);
    let (_, events) = request_with_events(
        &mut stdin,
        &mut reader,
        "8",
        "activities.toggle",
        json!({ "studentId": ahmad_id, "date": D, "type": "sahur" }),
    );
    assert!(events.is_empty());

    let (again, _) = request_with_events(
        &mut stdin,
        &mut reader,
        "9",
        "activities.unsubscribe",
        json!({ "subscriptionId": sub_id }),
    );
    assert_eq!(again["error"]["code"], "not_found");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn switching_workspace_drops_subscriptions() {
    let first = temp_dir("ibadah-subscription-a");
    let second = temp_dir("ibadah-subscription-b");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_with_events(&mut stdin, &mut reader, "1", "workspace.select", json!({ "path": first.to_string_lossy() }));
    request_with_events(&mut stdin, &mut reader, "2", "activities.subscribe", json!({}));
    let (health, _) = request_with_events(&mut stdin, &mut reader, "3", "health", json!({}));
    assert_eq!(health["result"]["subscriptions"], 1);

    request_with_events(&mut stdin, &mut reader, "4", "workspace.select", json!({ "path": second.to_string_lossy() }));
    let (health, _) = request_with_events(&mut stdin, &mut reader, "5", "health", json!({}));
    assert_eq!(health["result"]["subscriptions"], 0);

    drop(stdin);
    let _ = child.wait();
}
