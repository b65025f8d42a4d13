use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, require_session, require_teacher, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn parse_iso_date(s: &str) -> Result<String, HandlerErr> {
    match chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
        Ok(d) => Ok(d.format("%Y-%m-%d").to_string()),
        Err(_) => Err(HandlerErr::new("bad_params", "date must be YYYY-MM-DD")),
    }
}

fn parse_month_year(req: &Request) -> Result<(i32, u32), HandlerErr> {
    let month = req
        .params
        .get("month")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing month"))?;
    let year = req
        .params
        .get("year")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing year"))?;
    if !(1..=12).contains(&month) {
        return Err(HandlerErr::new("bad_params", "month must be between 1 and 12"));
    }
    if !(1900..=9999).contains(&year) {
        return Err(HandlerErr::new("bad_params", "year is out of range"));
    }
    Ok((year as i32, month as u32))
}

/// One present/absent flag per student per day; marking the same day again
/// overwrites the earlier flag.
fn handle_attendance_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let Some(student_id) = req.params.get("studentId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(is_present) = req.params.get("isPresent").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "isPresent must be boolean", None);
    };
    let date = match req.params.get("date").and_then(|v| v.as_str()) {
        Some(s) => match parse_iso_date(s) {
            Ok(d) => d,
            Err(e) => return e.response(&req.id),
        },
        None => return err(&req.id, "bad_params", "missing date", None),
    };

    let assigned: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM class_assignments WHERE class_id = ? AND teacher_id = ? LIMIT 1",
            (class_id, &session.user_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if assigned.is_none() {
        return err(
            &req.id,
            "not_authorized",
            "you are not assigned to this class",
            None,
        );
    }

    let in_class: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            (student_id, class_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if in_class.is_none() {
        return err(&req.id, "not_found", "student not found in this class", None);
    }

    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM attendance WHERE student_id = ? AND attendance_date = ?",
            (student_id, &date),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match existing {
        Some(id) => {
            if let Err(e) = conn.execute(
                "UPDATE attendance SET is_present = ?, class_id = ?, teacher_id = ? WHERE id = ?",
                (is_present as i64, class_id, &session.user_id, &id),
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
        None => {
            if let Err(e) = conn.execute(
                "INSERT INTO attendance(id, class_id, student_id, teacher_id, attendance_date, is_present)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    class_id,
                    student_id,
                    &session.user_id,
                    &date,
                    is_present as i64,
                ),
            ) {
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
        }
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "date": date, "isPresent": is_present }),
    )
}

fn handle_attendance_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_session(state) {
        return e.response(&req.id);
    }
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(class_id) = req.params.get("classId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing classId", None);
    };
    let (year, month) = match parse_month_year(req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some((start, end)) = calc::month_date_range(year, month) else {
        return err(&req.id, "bad_params", "month must be between 1 and 12", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, student_id, teacher_id, attendance_date, is_present
         FROM attendance
         WHERE class_id = ? AND attendance_date >= ? AND attendance_date <= ?
         ORDER BY attendance_date, student_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((class_id, &start, &end), |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let teacher_id: String = r.get(2)?;
            let date: String = r.get(3)?;
            let is_present: i64 = r.get(4)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "teacherId": teacher_id,
                "date": date,
                "isPresent": is_present != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(records) => ok(&req.id, json!({ "records": records })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.mark" => Some(handle_attendance_mark(state, req)),
        "attendance.list" => Some(handle_attendance_list(state, req)),
        _ => None,
    }
}
