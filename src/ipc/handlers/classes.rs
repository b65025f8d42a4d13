use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth::Role;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, require_admin, require_session, HandlerErr};
use crate::ipc::types::{AppState, Request};

#[derive(Debug, Clone, PartialEq, Eq)]
struct DesiredAssignment {
    teacher_id: String,
    subject: String,
}

fn parse_assignment_list(params: &serde_json::Value) -> Result<Vec<DesiredAssignment>, HandlerErr> {
    let Some(raw) = params.get("assignments") else {
        return Ok(Vec::new());
    };
    let Some(items) = raw.as_array() else {
        return Err(HandlerErr::new("bad_params", "assignments must be an array"));
    };
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let teacher_id = item
            .get("teacherId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty());
        let subject = item
            .get("subject")
            .and_then(|v| v.as_str())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty());
        let (Some(teacher_id), Some(subject)) = (teacher_id, subject) else {
            return Err(HandlerErr::new(
                "bad_params",
                format!("assignments[{}] requires teacherId and subject", i),
            ));
        };
        out.push(DesiredAssignment {
            teacher_id: teacher_id.to_string(),
            subject: subject.to_string(),
        });
    }
    Ok(out)
}

fn duplicate_assignment_err(subject: &str, class_name: &str, class_id: &str) -> HandlerErr {
    HandlerErr::with_details(
        "duplicate_assignment",
        format!(
            "subject \"{}\" is already assigned in class \"{}\"",
            subject, class_name
        ),
        json!({ "subject": subject, "classId": class_id, "className": class_name }),
    )
}

/// One subject may only be assigned once per class; the desired list
/// itself must not repeat a subject either.
fn check_internal_duplicates(
    desired: &[DesiredAssignment],
    class_name: &str,
    class_id: &str,
) -> Result<(), HandlerErr> {
    for (i, a) in desired.iter().enumerate() {
        if desired[..i].iter().any(|b| b.subject == a.subject) {
            return Err(duplicate_assignment_err(&a.subject, class_name, class_id));
        }
    }
    Ok(())
}

fn teacher_display_names(conn: &Connection) -> Result<std::collections::HashMap<String, String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, full_name FROM profiles")
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let names = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<std::collections::HashMap<_, _>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(names)
}

fn assignments_for_class(
    conn: &Connection,
    class_id: &str,
) -> Result<Vec<(String, String, String)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, teacher_id, subject FROM class_assignments
             WHERE class_id = ? ORDER BY subject",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    stmt.query_map([class_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    if session.role == Role::Teacher {
        // A teacher sees only the classes they are assigned to, with
        // their own subjects.
        let mut stmt = match conn.prepare(
            "SELECT DISTINCT c.id, c.name, c.description
             FROM classes c
             JOIN class_assignments a ON a.class_id = c.id
             WHERE a.teacher_id = ?
             ORDER BY c.name",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let classes = stmt
            .query_map([&session.user_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        let classes = match classes {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        let mut out = Vec::with_capacity(classes.len());
        for (id, name, description) in classes {
            let mut subj_stmt = match conn.prepare(
                "SELECT subject FROM class_assignments
                 WHERE class_id = ? AND teacher_id = ? ORDER BY subject",
            ) {
                Ok(s) => s,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            let subjects = subj_stmt
                .query_map((&id, &session.user_id), |r| r.get::<_, String>(0))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>());
            let subjects = match subjects {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            out.push(json!({
                "id": id,
                "name": name,
                "description": description,
                "subjects": subjects
            }));
        }
        return ok(&req.id, json!({ "classes": out }));
    }

    // Admin view includes counts and full assignment lists.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.description,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM class_assignments a WHERE a.class_id = c.id) AS assignment_count
         FROM classes c
         ORDER BY c.created_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let classes = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let classes = match classes {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let names = match teacher_display_names(conn) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut out = Vec::with_capacity(classes.len());
    for (id, name, description, student_count, assignment_count) in classes {
        let rows = match assignments_for_class(conn, &id) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
        let assignments: Vec<serde_json::Value> = rows
            .into_iter()
            .map(|(_, teacher_id, subject)| {
                let teacher_name = names
                    .get(&teacher_id)
                    .cloned()
                    .unwrap_or_else(|| "Unknown".to_string());
                json!({
                    "teacherId": teacher_id,
                    "teacherName": teacher_name,
                    "subject": subject
                })
            })
            .collect();
        out.push(json!({
            "id": id,
            "name": name,
            "description": description,
            "studentCount": student_count,
            "assignmentCount": assignment_count,
            "assignments": assignments
        }));
    }

    ok(&req.id, json!({ "classes": out }))
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match require_admin(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let description = req
        .params
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let desired = match parse_assignment_list(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = check_internal_duplicates(&desired, &name, &class_id) {
        return e.response(&req.id);
    }

    let created_at = db::now_stamp();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO classes(id, name, description, created_at) VALUES(?, ?, ?, ?)",
        (&class_id, &name, &description, &created_at),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    for a in &desired {
        // Existence check before insert, mirroring the unique index.
        let existing: Result<Option<i64>, _> = tx
            .query_row(
                "SELECT 1 FROM class_assignments WHERE class_id = ? AND subject = ?",
                (&class_id, &a.subject),
                |r| r.get(0),
            )
            .optional();
        match existing {
            Ok(Some(_)) => {
                let _ = tx.rollback();
                return duplicate_assignment_err(&a.subject, &name, &class_id).response(&req.id);
            }
            Ok(None) => {}
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        }
        if let Err(e) = tx.execute(
            "INSERT INTO class_assignments(id, class_id, teacher_id, subject, created_at)
             VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &class_id,
                &a.teacher_id,
                &a.subject,
                &created_at,
            ),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let after = json!({
        "id": class_id,
        "name": name,
        "description": description,
        "assignments": desired
            .iter()
            .map(|a| json!({ "teacherId": a.teacher_id, "subject": a.subject }))
            .collect::<Vec<_>>()
    });
    let _ = db::record_audit(
        conn,
        &actor.user_id,
        "created",
        "class",
        Some(&class_id),
        None,
        Some(&after),
    );

    ok(
        &req.id,
        json!({ "classId": class_id, "name": name, "assignmentCount": desired.len() }),
    )
}

fn handle_classes_update_assignments(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match require_admin(state) {
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

    let class_name: Option<String> = match conn
        .query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(class_name) = class_name else {
        return err(&req.id, "not_found", "class not found", None);
    };

    let desired = match parse_assignment_list(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = check_internal_duplicates(&desired, &class_name, class_id) {
        return e.response(&req.id);
    }

    let current = match assignments_for_class(conn, class_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // Set difference both ways; re-applying an identical target set
    // produces zero writes.
    let removed: Vec<&(String, String, String)> = current
        .iter()
        .filter(|(_, teacher_id, subject)| {
            !desired
                .iter()
                .any(|d| d.teacher_id == *teacher_id && d.subject == *subject)
        })
        .collect();
    let added: Vec<&DesiredAssignment> = desired
        .iter()
        .filter(|d| {
            !current
                .iter()
                .any(|(_, teacher_id, subject)| {
                    *teacher_id == d.teacher_id && *subject == d.subject
                })
        })
        .collect();

    let before = json!(current
        .iter()
        .map(|(_, teacher_id, subject)| json!({ "teacherId": teacher_id, "subject": subject }))
        .collect::<Vec<_>>());

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (id, _, _) in &removed {
        if let Err(e) = tx.execute("DELETE FROM class_assignments WHERE id = ?", [id]) {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
    }
    for a in &added {
        if let Err(e) = tx.execute(
            "INSERT INTO class_assignments(id, class_id, teacher_id, subject, created_at)
             VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                class_id,
                &a.teacher_id,
                &a.subject,
                db::now_stamp(),
            ),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    if !removed.is_empty() || !added.is_empty() {
        let after = json!(desired
            .iter()
            .map(|a| json!({ "teacherId": a.teacher_id, "subject": a.subject }))
            .collect::<Vec<_>>());
        let _ = db::record_audit(
            conn,
            &actor.user_id,
            "updated",
            "class",
            Some(class_id),
            Some(&before),
            Some(&after),
        );
    }

    ok(
        &req.id,
        json!({ "added": added.len(), "removed": removed.len() }),
    )
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match require_admin(state) {
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

    let class_name: Option<String> = match conn
        .query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(class_name) = class_name else {
        return err(&req.id, "not_found", "class not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicit dependency order; the schema declares no ON DELETE CASCADE.
    for (sql, table) in [
        ("DELETE FROM grades WHERE class_id = ?", "grades"),
        ("DELETE FROM attendance WHERE class_id = ?", "attendance"),
        (
            "DELETE FROM class_assignments WHERE class_id = ?",
            "class_assignments",
        ),
        ("DELETE FROM students WHERE class_id = ?", "students"),
        ("DELETE FROM classes WHERE id = ?", "classes"),
    ] {
        if let Err(e) = tx.execute(sql, [class_id]) {
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

    let before = json!({ "id": class_id, "name": class_name });
    let _ = db::record_audit(
        conn,
        &actor.user_id,
        "deleted",
        "class",
        Some(class_id),
        Some(&before),
        None,
    );

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.updateAssignments" => Some(handle_classes_update_assignments(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
