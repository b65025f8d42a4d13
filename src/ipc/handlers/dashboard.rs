use serde_json::json;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, require_admin};
use crate::ipc::types::{AppState, Request};

fn handle_dashboard_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state) {
        return e.response(&req.id);
    }
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    let counts = (|| -> rusqlite::Result<(i64, i64, i64)> {
        let teachers: i64 = conn.query_row(
            "SELECT COUNT(*) FROM profiles WHERE role = 'teacher'",
            [],
            |r| r.get(0),
        )?;
        let students: i64 = conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))?;
        let classes: i64 = conn.query_row("SELECT COUNT(*) FROM classes", [], |r| r.get(0))?;
        Ok((teachers, students, classes))
    })();

    match counts {
        Ok((teachers, students, classes)) => ok(
            &req.id,
            json!({ "teachers": teachers, "students": students, "classes": classes }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.stats" => Some(handle_dashboard_stats(state, req)),
        _ => None,
    }
}
