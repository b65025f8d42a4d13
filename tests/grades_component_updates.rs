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

struct Fixture {
    class_id: String,
    grade_id: String,
}

/// admin + two teachers; t1 owns Mathematics in the class, one enrolled
/// student. Leaves the session on t1.
fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) -> Fixture {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s2",
        "users.create",
        json!({
            "fullName": "Head Admin",
            "email": "admin@school.test",
            "role": "admin",
            "password": "admin-pass"
        }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s3",
        "auth.login",
        json!({ "email": "admin@school.test", "password": "admin-pass" }),
    );
    let t1 = request_ok(
        stdin,
        reader,
        "s4",
        "users.create",
        json!({
            "fullName": "Teacher One",
            "email": "t1@school.test",
            "role": "teacher",
            "password": "pass-one"
        }),
    )["user"]["id"]
        .as_str()
        .expect("t1")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s5",
        "users.create",
        json!({
            "fullName": "Teacher Two",
            "email": "t2@school.test",
            "role": "teacher",
            "password": "pass-two"
        }),
    );
    let class_id = request_ok(
        stdin,
        reader,
        "s6",
        "classes.create",
        json!({
            "name": "6/1",
            "assignments": [{ "teacherId": t1, "subject": "Mathematics" }]
        }),
    )["classId"]
        .as_str()
        .expect("class id")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s7",
        "students.enroll",
        json!({ "classId": class_id, "name": "Omar Ali" }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s8",
        "auth.login",
        json!({ "email": "t1@school.test", "password": "pass-one" }),
    );
    let opened = request_ok(
        stdin,
        reader,
        "s9",
        "grades.open",
        json!({ "classId": class_id }),
    );
    let grade_id = opened["grades"][0]["id"].as_str().expect("grade id").to_string();
    Fixture { class_id, grade_id }
}

#[test]
fn total_tracks_component_writes_and_clears() {
    let workspace = temp_dir("gradebook-components");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let fx = seed(&mut stdin, &mut reader, &workspace);

    let r = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.setComponent",
        json!({ "gradeId": fx.grade_id, "component": "evaluation_1", "value": 7.5 }),
    );
    assert_eq!(r["grade"]["total"].as_f64(), Some(7.5));

    let r = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.setComponent",
        json!({ "gradeId": fx.grade_id, "component": "monthly_exam", "value": 18 }),
    );
    assert_eq!(r["grade"]["total"].as_f64(), Some(25.5));

    let r = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.setComponent",
        json!({ "gradeId": fx.grade_id, "component": "behavior", "value": 5 }),
    );
    assert_eq!(r["grade"]["total"].as_f64(), Some(30.5));

    // Clearing a component removes it from the sum.
    let r = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.setComponent",
        json!({ "gradeId": fx.grade_id, "component": "evaluation_1", "value": null }),
    );
    assert_eq!(r["grade"]["evaluation_1"], json!(null));
    assert_eq!(r["grade"]["total"].as_f64(), Some(23.0));

    // Negative scores never enter the ledger.
    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "grades.setComponent",
        json!({ "gradeId": fx.grade_id, "component": "notebook", "value": -1 }),
    );
    assert_eq!(resp["error"]["code"].as_str(), Some("bad_params"));

    // The same writes in a different order land on the same total.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "auth.login",
        json!({ "email": "admin@school.test", "password": "admin-pass" }),
    );
    let class2 = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "classes.list",
        json!({}),
    );
    assert!(class2["classes"].as_array().is_some());
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.enroll",
        json!({ "classId": fx.class_id, "name": "Second Student" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "auth.login",
        json!({ "email": "t1@school.test", "password": "pass-one" }),
    );
    let opened = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "grades.open",
        json!({ "classId": fx.class_id }),
    );
    let second_grade = opened["grades"]
        .as_array()
        .expect("grades")
        .iter()
        .find(|g| g["studentName"].as_str() == Some("Second Student"))
        .expect("second student row")["id"]
        .as_str()
        .expect("grade id")
        .to_string();
    let r = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.setComponent",
        json!({ "gradeId": second_grade, "component": "behavior", "value": 5 }),
    );
    assert_eq!(r["grade"]["total"].as_f64(), Some(5.0));
    let r = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "grades.setComponent",
        json!({ "gradeId": second_grade, "component": "monthly_exam", "value": 18 }),
    );
    assert_eq!(r["grade"]["total"].as_f64(), Some(23.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn only_the_owning_teacher_may_write() {
    let workspace = temp_dir("gradebook-ownership");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let fx = seed(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "auth.login",
        json!({ "email": "t2@school.test", "password": "pass-two" }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "grades.setComponent",
        json!({ "gradeId": fx.grade_id, "component": "evaluation_1", "value": 9 }),
    );
    assert_eq!(resp["error"]["code"].as_str(), Some("not_authorized"));

    // Admins administer locks but do not enter scores.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "email": "admin@school.test", "password": "admin-pass" }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "grades.setComponent",
        json!({ "gradeId": fx.grade_id, "component": "evaluation_1", "value": 9 }),
    );
    assert_eq!(resp["error"]["code"].as_str(), Some("not_authorized"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn locked_rows_reject_component_writes_until_unlocked() {
    let workspace = temp_dir("gradebook-locks");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let fx = seed(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "auth.login",
        json!({ "email": "admin@school.test", "password": "admin-pass" }),
    );
    let r = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.setLocked",
        json!({ "gradeId": fx.grade_id, "locked": true }),
    );
    assert_eq!(r["isLocked"].as_bool(), Some(true));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "email": "t1@school.test", "password": "pass-one" }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "grades.setComponent",
        json!({ "gradeId": fx.grade_id, "component": "notebook", "value": 4 }),
    );
    assert_eq!(resp["error"]["code"].as_str(), Some("grade_locked"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "auth.login",
        json!({ "email": "admin@school.test", "password": "admin-pass" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.setLocked",
        json!({ "gradeId": fx.grade_id, "locked": false }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "auth.login",
        json!({ "email": "t1@school.test", "password": "pass-one" }),
    );
    let r = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.setComponent",
        json!({ "gradeId": fx.grade_id, "component": "notebook", "value": 4 }),
    );
    assert_eq!(r["grade"]["total"].as_f64(), Some(4.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn schema_maxima_bind_only_when_enforcement_is_on() {
    let workspace = temp_dir("gradebook-maxima");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let fx = seed(&mut stdin, &mut reader, &workspace);

    let schema_fields = json!({
        "evaluation_1_max": 10, "evaluation_2_max": 10,
        "evaluation_3_max": 10, "evaluation_4_max": 10,
        "monthly_exam_max": 20, "notebook_max": 5,
        "attendance_max": 5, "behavior_max": 5
    });

    // Schema configured without enforcement: over-maximum passes through,
    // matching the observed legacy behavior.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "auth.login",
        json!({ "email": "admin@school.test", "password": "admin-pass" }),
    );
    let mut with_flag = schema_fields.clone();
    with_flag["enforceMaxima"] = json!(false);
    let _ = request_ok(&mut stdin, &mut reader, "2", "gradeSchema.upsert", with_flag);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "email": "t1@school.test", "password": "pass-one" }),
    );
    let r = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.setComponent",
        json!({ "gradeId": fx.grade_id, "component": "notebook", "value": 50 }),
    );
    assert_eq!(r["grade"]["notebook"].as_f64(), Some(50.0));

    // With enforcement on, the same write is rejected and names the
    // component and its maximum.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "auth.login",
        json!({ "email": "admin@school.test", "password": "admin-pass" }),
    );
    let mut with_flag = schema_fields.clone();
    with_flag["enforceMaxima"] = json!(true);
    let _ = request_ok(&mut stdin, &mut reader, "6", "gradeSchema.upsert", with_flag);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "auth.login",
        json!({ "email": "t1@school.test", "password": "pass-one" }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "8",
        "grades.setComponent",
        json!({ "gradeId": fx.grade_id, "component": "notebook", "value": 50 }),
    );
    assert_eq!(resp["error"]["code"].as_str(), Some("bad_params"));
    assert_eq!(resp["error"]["details"]["max"].as_f64(), Some(5.0));

    let r = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.setComponent",
        json!({ "gradeId": fx.grade_id, "component": "notebook", "value": 4.5 }),
    );
    assert_eq!(r["grade"]["notebook"].as_f64(), Some(4.5));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
