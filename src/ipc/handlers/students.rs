use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth::Role;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, require_admin, require_session, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn teacher_assigned_to_class(
    conn: &Connection,
    teacher_id: &str,
    class_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM class_assignments WHERE class_id = ? AND teacher_id = ? LIMIT 1",
        (class_id, teacher_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let class_id = req
        .params
        .get("classId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if session.role == Role::Teacher {
        let Some(class_id) = class_id.as_deref() else {
            return err(&req.id, "bad_params", "missing classId", None);
        };
        match teacher_assigned_to_class(conn, &session.user_id, class_id) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_authorized",
                    "you are not assigned to this class",
                    None,
                )
            }
            Err(e) => return e.response(&req.id),
        }
    }

    let (sql, params): (&str, Vec<String>) = match class_id {
        Some(cid) => (
            "SELECT s.id, s.class_id, s.name, s.seat_number, s.national_id, c.name
             FROM students s
             LEFT JOIN classes c ON c.id = s.class_id
             WHERE s.class_id = ?
             ORDER BY s.name",
            vec![cid],
        ),
        None => (
            "SELECT s.id, s.class_id, s.name, s.seat_number, s.national_id, c.name
             FROM students s
             LEFT JOIN classes c ON c.id = s.class_id
             ORDER BY s.name",
            Vec::new(),
        ),
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |r| {
            let id: String = r.get(0)?;
            let class_id: String = r.get(1)?;
            let name: String = r.get(2)?;
            let seat_number: Option<String> = r.get(3)?;
            let national_id: Option<String> = r.get(4)?;
            let class_name: Option<String> = r.get(5)?;
            Ok(json!({
                "id": id,
                "classId": class_id,
                "name": name,
                "seatNumber": seat_number,
                "nationalId": national_id,
                "className": class_name.unwrap_or_else(|| "Unknown".to_string())
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Enrollment: the student plus one ledger row per class assignment, all
/// inside one transaction so a mid-loop failure cannot leave a student
/// with only part of their ledger.
fn handle_students_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    let Some(class_id) = req.params.get("classId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing classId", None);
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let seat_number = req
        .params
        .get("seatNumber")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let national_id = req
        .params
        .get("nationalId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let class_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if class_exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    if session.role == Role::Teacher {
        match teacher_assigned_to_class(conn, &session.user_id, class_id) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_authorized",
                    "you are not assigned to this class",
                    None,
                )
            }
            Err(e) => return e.response(&req.id),
        }
    }

    let assignments: Result<Vec<(String, String)>, _> = conn
        .prepare(
            "SELECT teacher_id, subject FROM class_assignments
             WHERE class_id = ? ORDER BY subject",
        )
        .and_then(|mut stmt| {
            stmt.query_map([class_id], |r| Ok((r.get(0)?, r.get(1)?)))
                .and_then(|it| it.collect())
        });
    let assignments = match assignments {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    let now = db::now_stamp();

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO students(id, class_id, name, seat_number, national_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&student_id, class_id, &name, &seat_number, &national_id, &now),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    for (teacher_id, subject) in &assignments {
        if let Err(e) = tx.execute(
            "INSERT INTO grades(id, student_id, class_id, teacher_id, subject, total, is_locked, updated_at)
             VALUES(?, ?, ?, ?, ?, 0, 0, ?)",
            (
                Uuid::new_v4().to_string(),
                &student_id,
                class_id,
                teacher_id,
                subject,
                &now,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "grades", "subject": subject })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let after = json!({
        "id": student_id,
        "classId": class_id,
        "name": name,
        "seatNumber": seat_number,
        "nationalId": national_id
    });
    let _ = db::record_audit(
        conn,
        &session.user_id,
        "created",
        "student",
        Some(&student_id),
        None,
        Some(&after),
    );

    if assignments.is_empty() {
        // The student exists but has nothing to be graded against.
        return err(
            &req.id,
            "no_assignments",
            "class has no subject assignments; student was created ungraded",
            Some(json!({ "studentId": student_id, "classId": class_id })),
        );
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "gradeRowsCreated": assignments.len() }),
    )
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match require_admin(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(student_id) = req.params.get("studentId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };

    let current: Option<(String, String)> = match conn
        .query_row(
            "SELECT name, class_id FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((name, class_id)) = current else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (sql, table) in [
        ("DELETE FROM grades WHERE student_id = ?", "grades"),
        ("DELETE FROM attendance WHERE student_id = ?", "attendance"),
        ("DELETE FROM students WHERE id = ?", "students"),
    ] {
        if let Err(e) = tx.execute(sql, [student_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let before = json!({ "id": student_id, "name": name, "classId": class_id });
    let _ = db::record_audit(
        conn,
        &actor.user_id,
        "deleted",
        "student",
        Some(student_id),
        Some(&before),
        None,
    );

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.enroll" => Some(handle_students_enroll(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
