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
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
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
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("gradebook-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // First account bootstraps the administrator.
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({
            "fullName": "Head Admin",
            "email": "admin@school.test",
            "role": "admin",
            "password": "admin-pass"
        }),
    );
    let admin_id = created["user"]["id"].as_str().expect("admin id").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.login",
        json!({ "email": "admin@school.test", "password": "admin-pass" }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "5", "auth.session", json!({}));
    let _ = request_ok(&mut stdin, &mut reader, "6", "dashboard.stats", json!({}));

    let _ = request_ok(
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
    let _ = request_ok(&mut stdin, &mut reader, "8", "gradeSchema.get", json!({}));

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "users.create",
        json!({
            "fullName": "Sara Teacher",
            "email": "sara@school.test",
            "role": "teacher",
            "subject": "Mathematics",
            "password": "teach-pass"
        }),
    );
    let teacher_id = teacher["user"]["id"].as_str().expect("teacher id").to_string();
    let _ = request_ok(&mut stdin, &mut reader, "10", "users.list", json!({}));

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "classes.create",
        json!({
            "name": "1/4",
            "description": "First grade, fourth section",
            "assignments": [{ "teacherId": teacher_id, "subject": "Mathematics" }]
        }),
    );
    let class_id = class["classId"].as_str().expect("class id").to_string();
    let _ = request_ok(&mut stdin, &mut reader, "12", "classes.list", json!({}));

    let enrolled = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "students.enroll",
        json!({ "classId": class_id, "name": "Omar Ali", "seatNumber": "7" }),
    );
    assert_eq!(enrolled["gradeRowsCreated"].as_i64(), Some(1));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "students.list",
        json!({ "classId": class_id }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "auth.login",
        json!({ "email": "sara@school.test", "password": "teach-pass" }),
    );
    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "grades.open",
        json!({ "classId": class_id }),
    );
    let grade_id = opened["grades"][0]["id"].as_str().expect("grade id").to_string();
    let student_id = opened["grades"][0]["studentId"]
        .as_str()
        .expect("student id")
        .to_string();
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "grades.setComponent",
        json!({ "gradeId": grade_id, "component": "monthly_exam", "value": 17.5 }),
    );
    assert_eq!(updated["grade"]["total"].as_f64(), Some(17.5));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "attendance.mark",
        json!({
            "classId": class_id,
            "studentId": student_id,
            "date": "2026-03-02",
            "isPresent": true
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "attendance.list",
        json!({ "classId": class_id, "month": 3, "year": 2026 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "reports.monthly",
        json!({ "classId": class_id, "month": 3, "year": 2026 }),
    );
    let csv_out = workspace.join("smoke-report.csv");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "reports.exportCsv",
        json!({
            "classId": class_id,
            "month": 3,
            "year": 2026,
            "outPath": csv_out.to_string_lossy()
        }),
    );
    assert!(csv_out.is_file(), "csv export written");

    // Back to the admin for the audit trail and account operations.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "auth.login",
        json!({ "email": "admin@school.test", "password": "admin-pass" }),
    );
    let logs = request_ok(&mut stdin, &mut reader, "23", "audit.list", json!({}));
    assert!(
        logs["logs"].as_array().map(|a| !a.is_empty()).unwrap_or(false),
        "audit log has entries"
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "24",
        "auth.changePassword",
        json!({ "userId": teacher_id, "newPassword": "teach-pass-2" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "25",
        "auth.deleteUser",
        json!({ "userId": admin_id }),
    );
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "25b",
        "users.update",
        json!({ "userId": teacher_id, "patch": { "subject": "Physics" } }),
    );
    assert_eq!(updated["user"]["subject"].as_str(), Some("Physics"));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "25c",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "25d",
        "classes.delete",
        json!({ "classId": class_id }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "26", "auth.logout", json!({}));

    let unknown = request(&mut stdin, &mut reader, "27", "no.such.method", json!({}));
    assert_eq!(
        unknown["error"]["code"].as_str(),
        Some("not_implemented"),
        "unknown method is reported"
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
