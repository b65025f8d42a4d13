use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::calc::{self, GradeComponent, COMPONENT_COUNT};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, require_admin, require_teacher, HandlerErr};
use crate::ipc::types::{AppState, Request};

use super::schema::load_schema;

pub struct GradeRow {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub teacher_id: String,
    pub subject: String,
    pub components: [Option<f64>; COMPONENT_COUNT],
    pub total: f64,
    pub is_locked: bool,
    pub updated_at: String,
}

fn read_grade(conn: &Connection, grade_id: &str) -> Result<Option<GradeRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, student_id, class_id, teacher_id, subject,
                evaluation_1, evaluation_2, evaluation_3, evaluation_4,
                monthly_exam, notebook, attendance, behavior,
                total, is_locked, updated_at
         FROM grades WHERE id = ?",
        [grade_id],
        |r| {
            let mut components: [Option<f64>; COMPONENT_COUNT] = [None; COMPONENT_COUNT];
            for (i, slot) in components.iter_mut().enumerate() {
                *slot = r.get(5 + i)?;
            }
            Ok(GradeRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                class_id: r.get(2)?,
                teacher_id: r.get(3)?,
                subject: r.get(4)?,
                components,
                total: r.get(13)?,
                is_locked: r.get::<_, i64>(14)? != 0,
                updated_at: r.get(15)?,
            })
        },
    )
    .optional()
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn grade_json(row: &GradeRow, student_name: Option<&str>) -> serde_json::Value {
    let mut obj = json!({
        "id": row.id,
        "studentId": row.student_id,
        "classId": row.class_id,
        "teacherId": row.teacher_id,
        "subject": row.subject,
        "total": row.total,
        "isLocked": row.is_locked,
        "updatedAt": row.updated_at,
    });
    for comp in GradeComponent::ALL {
        obj[comp.column()] = json!(row.components[comp.index()]);
    }
    if let Some(name) = student_name {
        obj["studentName"] = json!(name);
    }
    obj
}

fn handle_grades_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_teacher(state) {
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

    let subjects: Result<Vec<String>, _> = conn
        .prepare(
            "SELECT subject FROM class_assignments
             WHERE class_id = ? AND teacher_id = ? ORDER BY subject",
        )
        .and_then(|mut stmt| {
            stmt.query_map((class_id, &session.user_id), |r| r.get(0))
                .and_then(|it| it.collect())
        });
    let subjects = match subjects {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let subject = match req.params.get("subject").and_then(|v| v.as_str()) {
        Some(s) => {
            if !subjects.iter().any(|own| own == s) {
                return err(
                    &req.id,
                    "not_found",
                    "no assignment for this subject",
                    Some(json!({ "subject": s, "classId": class_id })),
                );
            }
            s.to_string()
        }
        None => match subjects.first() {
            Some(s) => s.clone(),
            None => {
                return ok(
                    &req.id,
                    json!({ "subject": null, "subjects": [], "grades": [] }),
                )
            }
        },
    };

    let mut stmt = match conn.prepare(
        "SELECT g.id, g.student_id, g.class_id, g.teacher_id, g.subject,
                g.evaluation_1, g.evaluation_2, g.evaluation_3, g.evaluation_4,
                g.monthly_exam, g.notebook, g.attendance, g.behavior,
                g.total, g.is_locked, g.updated_at,
                s.name
         FROM grades g
         LEFT JOIN students s ON s.id = g.student_id
         WHERE g.class_id = ? AND g.subject = ? AND g.teacher_id = ?
         ORDER BY s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((class_id, &subject, &session.user_id), |r| {
            let mut components: [Option<f64>; COMPONENT_COUNT] = [None; COMPONENT_COUNT];
            for (i, slot) in components.iter_mut().enumerate() {
                *slot = r.get(5 + i)?;
            }
            let row = GradeRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                class_id: r.get(2)?,
                teacher_id: r.get(3)?,
                subject: r.get(4)?,
                components,
                total: r.get(13)?,
                is_locked: r.get::<_, i64>(14)? != 0,
                updated_at: r.get(15)?,
            };
            let name: Option<String> = r.get(16)?;
            Ok(grade_json(
                &row,
                Some(name.as_deref().unwrap_or("Unknown")),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(grades) => ok(
            &req.id,
            json!({ "subject": subject, "subjects": subjects, "grades": grades }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_set_component(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_teacher(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(grade_id) = req.params.get("gradeId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing gradeId", None);
    };
    let Some(component) = req
        .params
        .get("component")
        .and_then(|v| v.as_str())
        .and_then(GradeComponent::parse)
    else {
        return err(
            &req.id,
            "bad_params",
            "component must be one of: evaluation_1, evaluation_2, evaluation_3, evaluation_4, monthly_exam, notebook, attendance, behavior",
            None,
        );
    };
    // An explicit null clears the component; a missing value is a caller
    // mistake, not a clear.
    let value = match req.params.get("value") {
        None => return err(&req.id, "bad_params", "missing value", None),
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(n) => Some(n),
            None => return err(&req.id, "bad_params", "value must be a number or null", None),
        },
    };
    if let Some(v) = value {
        if v < 0.0 {
            return err(
                &req.id,
                "bad_params",
                "negative scores are not allowed",
                Some(json!({ "value": v })),
            );
        }
    }

    let row = match read_grade(conn, grade_id) {
        Ok(Some(r)) => r,
        Ok(None) => return err(&req.id, "not_found", "grade not found", None),
        Err(e) => return e.response(&req.id),
    };
    if row.teacher_id != session.user_id {
        return err(
            &req.id,
            "not_authorized",
            "only the assigned teacher may modify this grade",
            None,
        );
    }
    if row.is_locked {
        return err(
            &req.id,
            "grade_locked",
            "grade is locked",
            Some(json!({ "gradeId": grade_id })),
        );
    }

    if let Some(v) = value {
        let schema = match load_schema(conn) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
        if let Some(schema) = schema {
            let max = schema.maxima[component.index()];
            if schema.enforce_maxima && v > max {
                return err(
                    &req.id,
                    "bad_params",
                    format!("{} exceeds the configured maximum", component.column()),
                    Some(json!({ "component": component.column(), "max": max, "value": v })),
                );
            }
        }
    }

    let old_value = row.components[component.index()];
    let mut components = row.components;
    components[component.index()] = value;
    let total = calc::ledger_total(&components);
    let updated_at = db::now_stamp();

    let sql = format!(
        "UPDATE grades SET {} = ?, total = ?, updated_at = ? WHERE id = ?",
        component.column()
    );
    if let Err(e) = conn.execute(&sql, (value, total, &updated_at, grade_id)) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let before = json!({ component.column(): old_value, "total": row.total });
    let after = json!({ component.column(): value, "total": total });
    let _ = db::record_audit(
        conn,
        &session.user_id,
        "updated",
        "grade",
        Some(grade_id),
        Some(&before),
        Some(&after),
    );

    let updated = GradeRow {
        components,
        total,
        updated_at,
        ..row
    };
    ok(&req.id, json!({ "grade": grade_json(&updated, None) }))
}

fn handle_grades_set_locked(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match require_admin(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(grade_id) = req.params.get("gradeId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing gradeId", None);
    };
    let Some(locked) = req.params.get("locked").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "locked must be boolean", None);
    };

    let row = match read_grade(conn, grade_id) {
        Ok(Some(r)) => r,
        Ok(None) => return err(&req.id, "not_found", "grade not found", None),
        Err(e) => return e.response(&req.id),
    };

    if row.is_locked != locked {
        if let Err(e) = conn.execute(
            "UPDATE grades SET is_locked = ? WHERE id = ?",
            (locked as i64, grade_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        let action = if locked { "locked" } else { "unlocked" };
        let _ = db::record_audit(
            conn,
            &actor.user_id,
            action,
            "grade",
            Some(grade_id),
            Some(&json!({ "isLocked": row.is_locked })),
            Some(&json!({ "isLocked": locked })),
        );
    }

    ok(&req.id, json!({ "gradeId": grade_id, "isLocked": locked }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.open" => Some(handle_grades_open(state, req)),
        "grades.setComponent" => Some(handle_grades_set_component(state, req)),
        "grades.setLocked" => Some(handle_grades_set_locked(state, req)),
        _ => None,
    }
}
