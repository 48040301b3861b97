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

/// Sends one request and returns its response, skipping pushed event lines.
fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "sidecar closed during {}", method);
        let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
        if value.get("event").is_some() {
            continue;
        }
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
        return value;
    }
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(value["ok"], true, "{} failed: {}", method, value);
    value["result"].clone()
}

fn error_code(value: &serde_json::Value) -> &str {
    value["error"]["code"].as_str().unwrap_or("")
}

#[test]
fn deleting_a_student_removes_their_activities_and_logs_the_count() {
    let workspace = temp_dir("ibadah-students-cascade");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let no_ws = request(&mut stdin, &mut reader, "0", "students.list", json!({}));
    assert_eq!(error_code(&no_ws), "no_workspace");

    request_ok(&mut stdin, &mut reader, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));

    let ahmad = request_ok(&mut stdin, &mut reader, "2", "students.create", json!({ "name": " Ahmad ", "class": "1a" }));
    let ahmad_id = ahmad["student"]["id"].as_str().expect("ahmad id").to_string();
    assert_eq!(ahmad["student"]["class"], "1A");
    assert_eq!(ahmad["student"]["name"], "Ahmad");
    let budi = request_ok(&mut stdin, &mut reader, "3", "students.create", json!({ "name": "Budi", "class": "1B" }));
    let budi_id = budi["student"]["id"].as_str().expect("budi id").to_string();

    let blank = request(&mut stdin, &mut reader, "4", "students.create", json!({ "name": "  ", "class": "1A" }));
    assert_eq!(error_code(&blank), "bad_params");

    // Same triple twice: one record.
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "activities.upsert",
        json!({ "studentId": ahmad_id, "date": D, "type": "puasa", "status": "done" }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "activities.upsert",
        json!({ "studentId": ahmad_id, "date": "18/02/2026", "type": "puasa", "status": "done" }),
    );
    assert_eq!(first["created"], true);
    assert_eq!(second["created"], false);
    assert_eq!(first["after"]["id"], second["after"]["id"]);

    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "activities.toggle",
        json!({ "studentId": ahmad_id, "date": D, "type": "sholat_subuh" }),
    );
    let note = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "activities.setNote",
        json!({ "studentId": ahmad_id, "date": D, "note": "Al-Baqarah 1-10" }),
    );
    assert_eq!(note["after"]["type"], "tadarus");
    assert_eq!(note["after"]["note"], "Al-Baqarah 1-10");
    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "activities.upsert",
        json!({ "studentId": ahmad_id, "date": "2026-02-19", "type": "puasa" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "activities.upsert",
        json!({ "studentId": budi_id, "date": D, "type": "puasa" }),
    );

    let ahmad_day = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "activities.query",
        json!({ "studentId": ahmad_id, "date": D }),
    );
    assert_eq!(ahmad_day["activities"].as_array().map(|a| a.len()), Some(3));

    let dashboard = request_ok(&mut stdin, &mut reader, "12", "stats.dashboard", json!({ "date": D }));
    assert_eq!(dashboard["stats"]["totalStudents"], 2);
    assert_eq!(dashboard["stats"]["activeStudents"], 2);
    // 4 done slots of 18
    assert_eq!(dashboard["stats"]["completionRate"], 22);
    let only_1a = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "stats.dashboard",
        json!({ "date": D, "class": "1a" }),
    );
    assert_eq!(only_1a["stats"]["totalStudents"], 1);
    assert_eq!(only_1a["rows"][0]["prayerCount"], 1);
    assert_eq!(only_1a["rows"][0]["prayerBand"], "partial");

    let deleted = request_ok(&mut stdin, &mut reader, "14", "students.delete", json!({ "studentId": ahmad_id }));
    assert_eq!(deleted["deletedActivitiesCount"], 4);

    let left = request_ok(&mut stdin, &mut reader, "15", "activities.query", json!({}));
    let left = left["activities"].as_array().expect("activities").clone();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0]["studentId"], budi_id.as_str());

    let logs = request_ok(&mut stdin, &mut reader, "16", "logs.list", json!({}));
    let entries = logs["logs"].as_array().expect("logs");
    let delete_entries: Vec<&serde_json::Value> = entries
        .iter()
        .filter(|e| e["action"] == "delete_student")
        .collect();
    assert_eq!(delete_entries.len(), 1);
    assert_eq!(delete_entries[0]["details"]["deletedActivitiesCount"], 4);
    assert_eq!(delete_entries[0]["actor"]["type"], "admin");
    assert_eq!(entries[0]["action"], "delete_student", "newest first");

    let again = request(&mut stdin, &mut reader, "17", "students.delete", json!({ "studentId": ahmad_id }));
    assert_eq!(error_code(&again), "not_found");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn session_survives_restart_and_is_logged() {
    let workspace = temp_dir("ibadah-session");
    let budi_id = {
        let (mut child, mut stdin, mut reader) = spawn_sidecar();
        request_ok(&mut stdin, &mut reader, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
        let budi = request_ok(&mut stdin, &mut reader, "2", "students.create", json!({ "name": "Budi", "class": "1B" }));
        let budi_id = budi["student"]["id"].as_str().expect("id").to_string();

        let missing = request(&mut stdin, &mut reader, "3", "session.select", json!({ "studentId": "nobody" }));
        assert_eq!(error_code(&missing), "not_found");
        let selected = request_ok(&mut stdin, &mut reader, "4", "session.select", json!({ "studentId": budi_id }));
        assert_eq!(selected["student"]["name"], "Budi");

        drop(stdin);
        let _ = child.wait();
        budi_id
    };

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let opened = request_ok(&mut stdin, &mut reader, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    assert_eq!(opened["sessionStudent"]["id"], budi_id.as_str());
    let current = request_ok(&mut stdin, &mut reader, "2", "session.get", json!({}));
    assert_eq!(current["student"]["id"], budi_id.as_str());

    let cleared = request_ok(&mut stdin, &mut reader, "3", "session.clear", json!({}));
    assert_eq!(cleared["cleared"], true);
    let after = request_ok(&mut stdin, &mut reader, "4", "session.get", json!({}));
    assert!(after["student"].is_null());

    let logs = request_ok(&mut stdin, &mut reader, "5", "logs.list", json!({}));
    let actions: Vec<&str> = logs["logs"]
        .as_array()
        .expect("logs")
        .iter()
        .filter_map(|e| e["action"].as_str())
        .collect();
    assert_eq!(actions, vec!["student_logout", "student_login", "add_student"]);
    let login = &logs["logs"][1];
    assert_eq!(login["actor"]["type"], "student");
    assert_eq!(login["actor"]["id"], budi_id.as_str());

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn reset_reseeds_the_default_roster() {
    let workspace = temp_dir("ibadah-reset");
    let exe = env!("CARGO_BIN_EXE_ibadahd");
    let mut child = Command::new(exe)
        .env("IBADAHD_SEED_ROSTER", "true")
        .env_remove("IBADAHD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn ibadahd");
    let mut stdin = child.stdin.take().expect("child stdin");
    let mut reader = BufReader::new(child.stdout.take().expect("child stdout"));

    let opened = request_ok(&mut stdin, &mut reader, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    assert_eq!(opened["seededStudents"], 25);
    let classes = request_ok(&mut stdin, &mut reader, "2", "students.classes", json!({}));
    assert_eq!(classes["classes"], json!(["1A", "1B"]));

    let created = request_ok(&mut stdin, &mut reader, "3", "students.create", json!({ "name": "Extra", "class": "2C" }));
    let extra_id = created["student"]["id"].as_str().expect("id").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "activities.upsert",
        json!({ "studentId": extra_id, "date": D, "type": "sahur" }),
    );

    let reset = request_ok(&mut stdin, &mut reader, "5", "workspace.reset", json!({}));
    assert_eq!(reset["deletedStudents"], 26);
    assert_eq!(reset["deletedActivities"], 1);
    assert_eq!(reset["seededStudents"], 25);

    let overview = request_ok(&mut stdin, &mut reader, "6", "stats.overview", json!({}));
    assert_eq!(overview["totalStudents"], 25);
    assert_eq!(overview["totalActivities"], 0);
    assert_eq!(overview["totalClasses"], 2);

    let searched = request_ok(&mut stdin, &mut reader, "7", "students.list", json!({ "query": "ahm" }));
    assert_eq!(searched["students"][0]["name"], "Ahmad");
    assert_eq!(searched["total"], 25);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn mutations_succeed_when_the_audit_log_cannot_be_written() {
    let workspace = temp_dir("ibadah-audit-failure");
    {
        let (mut child, mut stdin, mut reader) = spawn_sidecar();
        request_ok(&mut stdin, &mut reader, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
        drop(stdin);
        let _ = child.wait();
    }

    let conn = rusqlite::Connection::open(workspace.join("ibadah.sqlite3")).expect("open workspace db");
    conn.execute_batch(
        "CREATE TRIGGER reject_logs BEFORE INSERT ON documents
         WHEN NEW.collection = 'logs'
         BEGIN SELECT RAISE(ABORT, 'logs are read-only'); END;",
    )
    .expect("install trigger");
    drop(conn);

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(&mut stdin, &mut reader, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let created = request(&mut stdin, &mut reader, "2", "students.create", json!({ "name": "Citra", "class": "2A" }));
    assert_eq!(created["ok"], true, "{}", created);
    let citra_id = created["result"]["student"]["id"].as_str().expect("id").to_string();

    let toggled = request(
        &mut stdin,
        &mut reader,
        "3",
        "activities.toggle",
        json!({ "studentId": citra_id, "date": D, "type": "puasa" }),
    );
    assert_eq!(toggled["ok"], true, "{}", toggled);

    let listed = request_ok(&mut stdin, &mut reader, "4", "students.list", json!({}));
    assert_eq!(listed["total"], 1);
    let logs = request_ok(&mut stdin, &mut reader, "5", "logs.list", json!({}));
    assert_eq!(logs["logs"], json!([]));

    drop(stdin);
    let _ = child.wait();
}
