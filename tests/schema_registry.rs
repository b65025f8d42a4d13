use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

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

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

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
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn schema_singleton_distinguishes_unconfigured_from_failure() {
    let workspace = temp_dir("gradebook-schema");
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({
            "fullName": "Head Admin",
            "email": "admin@school.test",
            "role": "admin",
            "password": "admin-pass"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "email": "admin@school.test", "password": "admin-pass" }),
    );

    // Nothing configured yet: a not_found the caller can branch on.
    let resp = request(&mut stdin, &mut reader, "4", "gradeSchema.get", json!({}));
    assert_eq!(resp["ok"].as_bool(), Some(false));
    assert_eq!(resp["error"]["code"].as_str(), Some("not_found"));

    // Negative maxima are rejected.
    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "gradeSchema.upsert",
        json!({
            "evaluation_1_max": -1, "evaluation_2_max": 10,
            "evaluation_3_max": 10, "evaluation_4_max": 10,
            "monthly_exam_max": 20, "notebook_max": 5,
            "attendance_max": 5, "behavior_max": 5
        }),
    );
    assert_eq!(resp["error"]["code"].as_str(), Some("bad_params"));

    // A missing field is a validation error, not a zero.
    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "gradeSchema.upsert",
        json!({
            "evaluation_1_max": 10, "evaluation_2_max": 10,
            "evaluation_3_max": 10, "evaluation_4_max": 10,
            "monthly_exam_max": 20, "notebook_max": 5,
            "attendance_max": 5
        }),
    );
    assert_eq!(resp["error"]["code"].as_str(), Some("bad_params"));

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "gradeSchema.upsert",
        json!({
            "evaluation_1_max": 10, "evaluation_2_max": 10,
            "evaluation_3_max": 10, "evaluation_4_max": 10,
            "monthly_exam_max": 20, "notebook_max": 5,
            "attendance_max": 5, "behavior_max": 5
        }),
    );
    let first_id = created["schema"]["id"].as_str().expect("id").to_string();

    let fetched = request_ok(&mut stdin, &mut reader, "8", "gradeSchema.get", json!({}));
    assert_eq!(fetched["schema"]["monthly_exam_max"].as_f64(), Some(20.0));
    assert_eq!(fetched["schema"]["enforceMaxima"].as_bool(), Some(false));

    // The second upsert mutates the one row in place.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "gradeSchema.upsert",
        json!({
            "evaluation_1_max": 15, "evaluation_2_max": 10,
            "evaluation_3_max": 10, "evaluation_4_max": 10,
            "monthly_exam_max": 25, "notebook_max": 5,
            "attendance_max": 5, "behavior_max": 5,
            "enforceMaxima": true
        }),
    );
    assert_eq!(updated["schema"]["id"].as_str(), Some(first_id.as_str()));
    assert_eq!(updated["schema"]["evaluation_1_max"].as_f64(), Some(15.0));
    assert_eq!(updated["schema"]["enforceMaxima"].as_bool(), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
