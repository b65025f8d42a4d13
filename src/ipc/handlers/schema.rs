use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::calc::GradeComponent;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, require_admin, require_session, HandlerErr};
use crate::ipc::types::{AppState, Request};

pub struct SchemaRow {
    pub id: String,
    pub maxima: [f64; 8],
    pub enforce_maxima: bool,
}

/// None when no schema has been configured yet; callers must be able to
/// tell that apart from a storage failure.
pub fn load_schema(conn: &rusqlite::Connection) -> Result<Option<SchemaRow>, HandlerErr> {
    conn.query_row(
        "SELECT id,
                evaluation_1_max, evaluation_2_max, evaluation_3_max, evaluation_4_max,
                monthly_exam_max, notebook_max, attendance_max, behavior_max,
                enforce_maxima
         FROM grade_schema",
        [],
        |r| {
            let mut maxima = [0.0f64; 8];
            for (i, slot) in maxima.iter_mut().enumerate() {
                *slot = r.get(1 + i)?;
            }
            Ok(SchemaRow {
                id: r.get(0)?,
                maxima,
                enforce_maxima: r.get::<_, i64>(9)? != 0,
            })
        },
    )
    .optional()
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn schema_json(row: &SchemaRow) -> serde_json::Value {
    let mut obj = json!({
        "id": row.id,
        "enforceMaxima": row.enforce_maxima,
    });
    for comp in GradeComponent::ALL {
        obj[comp.max_column()] = json!(row.maxima[comp.index()]);
    }
    obj
}

fn handle_schema_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_session(state) {
        return e.response(&req.id);
    }
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    match load_schema(conn) {
        Ok(Some(row)) => ok(&req.id, json!({ "schema": schema_json(&row) })),
        Ok(None) => err(&req.id, "not_found", "no grade schema configured", None),
        Err(e) => e.response(&req.id),
    }
}

fn handle_schema_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match require_admin(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    let mut maxima = [0.0f64; 8];
    for comp in GradeComponent::ALL {
        let key = comp.max_column();
        let Some(v) = req.params.get(key).and_then(|v| v.as_f64()) else {
            return err(&req.id, "bad_params", format!("missing {}", key), None);
        };
        if v < 0.0 {
            return err(
                &req.id,
                "bad_params",
                format!("{} must not be negative", key),
                Some(json!({ "field": key, "value": v })),
            );
        }
        maxima[comp.index()] = v;
    }
    let enforce_maxima = req
        .params
        .get("enforceMaxima")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let existing = match load_schema(conn) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let before = existing.as_ref().map(schema_json);

    let row = match existing {
        Some(prev) => {
            let updated = SchemaRow {
                id: prev.id,
                maxima,
                enforce_maxima,
            };
            if let Err(e) = conn.execute(
                "UPDATE grade_schema SET
                    evaluation_1_max = ?, evaluation_2_max = ?, evaluation_3_max = ?, evaluation_4_max = ?,
                    monthly_exam_max = ?, notebook_max = ?, attendance_max = ?, behavior_max = ?,
                    enforce_maxima = ?, updated_at = ?
                 WHERE id = ?",
                (
                    maxima[0], maxima[1], maxima[2], maxima[3], maxima[4], maxima[5], maxima[6],
                    maxima[7], enforce_maxima as i64, db::now_stamp(), &updated.id,
                ),
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
            updated
        }
        None => {
            let created = SchemaRow {
                id: Uuid::new_v4().to_string(),
                maxima,
                enforce_maxima,
            };
            if let Err(e) = conn.execute(
                "INSERT INTO grade_schema(
                    id,
                    evaluation_1_max, evaluation_2_max, evaluation_3_max, evaluation_4_max,
                    monthly_exam_max, notebook_max, attendance_max, behavior_max,
                    enforce_maxima, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &created.id, maxima[0], maxima[1], maxima[2], maxima[3], maxima[4], maxima[5],
                    maxima[6], maxima[7], enforce_maxima as i64, db::now_stamp(),
                ),
            ) {
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
            created
        }
    };

    let after = schema_json(&row);
    let action = if before.is_some() { "updated" } else { "created" };
    let _ = db::record_audit(
        conn,
        &actor.user_id,
        action,
        "grade_schema",
        Some(&row.id),
        before.as_ref(),
        Some(&after),
    );

    ok(&req.id, json!({ "schema": after }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gradeSchema.get" => Some(handle_schema_get(state, req)),
        "gradeSchema.upsert" => Some(handle_schema_upsert(state, req)),
        _ => None,
    }
}
