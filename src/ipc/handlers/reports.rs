use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::Role;
use crate::calc::{self, AttendanceSummary, GradeComponent, COMPONENT_COUNT};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, require_session, HandlerErr};
use crate::ipc::types::{AppState, Request};

struct ReportRow {
    student_id: String,
    student_name: String,
    teacher_name: String,
    subject: String,
    components: [Option<f64>; COMPONENT_COUNT],
    total: f64,
}

struct ReportModel {
    class_id: String,
    class_name: String,
    month: u32,
    year: i32,
    window_start: String,
    window_end: String,
    rows: Vec<ReportRow>,
    attendance: Vec<AttendanceSummary>,
}

pub const CSV_COLUMNS: [&str; 12] = [
    "name",
    "class",
    "subject",
    "evaluation_1",
    "evaluation_2",
    "evaluation_3",
    "evaluation_4",
    "monthly_exam",
    "notebook",
    "attendance",
    "behavior",
    "total",
];

fn display_names(conn: &Connection, table: &str) -> Result<HashMap<String, String>, HandlerErr> {
    let sql = match table {
        "profiles" => "SELECT id, full_name FROM profiles",
        _ => "SELECT id, name FROM students",
    };
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

/// Gathers the month's ledger rows and attendance in two independent
/// reads; a best-effort snapshot, not a transaction.
fn build_report(
    conn: &Connection,
    class_id: &str,
    month: u32,
    year: i32,
    teacher_filter: Option<&str>,
) -> Result<ReportModel, HandlerErr> {
    let class_name: Option<String> = conn
        .query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let Some(class_name) = class_name else {
        return Err(HandlerErr::new("not_found", "class not found"));
    };

    let Some((window_start, window_end)) = calc::month_window(year, month) else {
        return Err(HandlerErr::new("bad_params", "month must be between 1 and 12"));
    };

    let (sql, params): (&str, Vec<String>) = match teacher_filter {
        Some(tid) => (
            "SELECT student_id, teacher_id, subject,
                    evaluation_1, evaluation_2, evaluation_3, evaluation_4,
                    monthly_exam, notebook, attendance, behavior, total
             FROM grades
             WHERE class_id = ? AND teacher_id = ? AND updated_at >= ? AND updated_at <= ?",
            vec![
                class_id.to_string(),
                tid.to_string(),
                window_start.clone(),
                window_end.clone(),
            ],
        ),
        None => (
            "SELECT student_id, teacher_id, subject,
                    evaluation_1, evaluation_2, evaluation_3, evaluation_4,
                    monthly_exam, notebook, attendance, behavior, total
             FROM grades
             WHERE class_id = ? AND updated_at >= ? AND updated_at <= ?",
            vec![
                class_id.to_string(),
                window_start.clone(),
                window_end.clone(),
            ],
        ),
    };

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let raw = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |r| {
            let student_id: String = r.get(0)?;
            let teacher_id: String = r.get(1)?;
            let subject: String = r.get(2)?;
            let mut components: [Option<f64>; COMPONENT_COUNT] = [None; COMPONENT_COUNT];
            for (i, slot) in components.iter_mut().enumerate() {
                *slot = r.get(3 + i)?;
            }
            let total: f64 = r.get(11)?;
            Ok((student_id, teacher_id, subject, components, total))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    // Name joins resolve against current rosters; anything missing renders
    // as a literal "Unknown" instead of failing the whole report.
    let student_names = display_names(conn, "students")?;
    let teacher_names = display_names(conn, "profiles")?;

    let mut rows: Vec<ReportRow> = raw
        .into_iter()
        .map(|(student_id, teacher_id, subject, components, total)| {
            let student_name = student_names
                .get(&student_id)
                .cloned()
                .unwrap_or_else(|| "Unknown".to_string());
            let teacher_name = teacher_names
                .get(&teacher_id)
                .cloned()
                .unwrap_or_else(|| "Unknown".to_string());
            ReportRow {
                student_id,
                student_name,
                teacher_name,
                subject,
                components,
                total,
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        (a.student_name.as_str(), a.subject.as_str())
            .cmp(&(b.student_name.as_str(), b.subject.as_str()))
    });

    // Attendance summary for the same window, one row per roster student.
    let Some((date_start, date_end)) = calc::month_date_range(year, month) else {
        return Err(HandlerErr::new("bad_params", "month must be between 1 and 12"));
    };
    let roster: Vec<(String, String)> = conn
        .prepare("SELECT id, name FROM students WHERE class_id = ? ORDER BY name")
        .and_then(|mut stmt| {
            stmt.query_map([class_id], |r| Ok((r.get(0)?, r.get(1)?)))
                .and_then(|it| it.collect())
        })
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let (att_sql, att_params): (&str, Vec<String>) = match teacher_filter {
        Some(tid) => (
            "SELECT student_id, is_present FROM attendance
             WHERE class_id = ? AND teacher_id = ? AND attendance_date >= ? AND attendance_date <= ?",
            vec![
                class_id.to_string(),
                tid.to_string(),
                date_start,
                date_end,
            ],
        ),
        None => (
            "SELECT student_id, is_present FROM attendance
             WHERE class_id = ? AND attendance_date >= ? AND attendance_date <= ?",
            vec![class_id.to_string(), date_start, date_end],
        ),
    };
    let mut att_stmt = conn
        .prepare(att_sql)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let marks = att_stmt
        .query_map(rusqlite::params_from_iter(att_params.iter()), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let mut counts: HashMap<String, (i64, i64)> = HashMap::new();
    for (student_id, present) in marks {
        let entry = counts.entry(student_id).or_insert((0, 0));
        if present {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }
    let attendance = roster
        .into_iter()
        .map(|(id, name)| {
            let (present, absent) = counts.get(&id).copied().unwrap_or((0, 0));
            AttendanceSummary {
                student_id: id,
                student_name: name,
                present_days: present,
                absent_days: absent,
                presence_percent: calc::presence_percentage(present, absent),
            }
        })
        .collect();

    Ok(ReportModel {
        class_id: class_id.to_string(),
        class_name,
        month,
        year,
        window_start,
        window_end,
        rows,
        attendance,
    })
}

fn row_json(model: &ReportModel, row: &ReportRow) -> serde_json::Value {
    let mut obj = json!({
        "studentId": row.student_id,
        "name": row.student_name,
        "class": model.class_name,
        "subject": row.subject,
        "teacherName": row.teacher_name,
        "total": row.total,
    });
    for comp in GradeComponent::ALL {
        obj[comp.column()] = json!(row.components[comp.index()]);
    }
    obj
}

fn model_json(model: &ReportModel) -> serde_json::Value {
    json!({
        "classId": model.class_id,
        "className": model.class_name,
        "month": model.month,
        "year": model.year,
        "windowStart": model.window_start,
        "windowEnd": model.window_end,
        "rows": model
            .rows
            .iter()
            .map(|r| row_json(model, r))
            .collect::<Vec<_>>(),
        "attendance": model
            .attendance
            .iter()
            .map(|a| serde_json::to_value(a).unwrap_or_default())
            .collect::<Vec<_>>(),
    })
}

/// The export is rendered from the same model the table uses; row order
/// and cell values cannot drift apart.
fn model_csv(model: &ReportModel) -> String {
    let mut out = CSV_COLUMNS.join(",");
    out.push('\n');
    for row in &model.rows {
        let mut fields: Vec<String> = vec![
            calc::csv_quote(&row.student_name),
            calc::csv_quote(&model.class_name),
            calc::csv_quote(&row.subject),
        ];
        for comp in GradeComponent::ALL {
            fields.push(calc::fmt_component(row.components[comp.index()]));
        }
        fields.push(calc::fmt_number(row.total));
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

fn scope_for_session(state: &AppState, req: &Request) -> Result<Option<String>, HandlerErr> {
    let session = require_session(state)?;
    match session.role {
        Role::Teacher => Ok(Some(session.user_id)),
        Role::Admin => Ok(req
            .params
            .get("teacherId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())),
    }
}

fn report_args(req: &Request) -> Result<(String, u32, i32), HandlerErr> {
    let class_id = req
        .params
        .get("classId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing classId"))?
        .to_string();
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
    Ok((class_id, month as u32, year as i32))
}

fn handle_reports_monthly(state: &mut AppState, req: &Request) -> serde_json::Value {
    let teacher_filter = match scope_for_session(state, req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let (class_id, month, year) = match report_args(req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match build_report(conn, &class_id, month, year, teacher_filter.as_deref()) {
        Ok(model) => ok(&req.id, model_json(&model)),
        Err(e) => e.response(&req.id),
    }
}

fn export_file_name(class_name: &str) -> String {
    let scope: String = class_name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let date = chrono::Utc::now().format("%Y-%m-%d");
    format!("report-{}-{}.csv", scope, date)
}

fn handle_reports_export_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let teacher_filter = match scope_for_session(state, req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let (class_id, month, year) = match report_args(req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let model = match build_report(conn, &class_id, month, year, teacher_filter.as_deref()) {
        Ok(m) => m,
        Err(e) => return e.response(&req.id),
    };
    let csv = model_csv(&model);

    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(p) => std::path::PathBuf::from(p),
        None => {
            let Some(workspace) = state.workspace.as_ref() else {
                return err(&req.id, "no_workspace", "select a workspace first", None);
            };
            workspace
                .join("exports")
                .join(export_file_name(&model.class_name))
        }
    };
    if let Some(parent) = out_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(&req.id, "io_failed", e.to_string(), None);
        }
    }
    if let Err(e) = std::fs::write(&out_path, csv) {
        return err(&req.id, "io_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "path": out_path.to_string_lossy(),
            "rowsExported": model.rows.len()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.monthly" => Some(handle_reports_monthly(state, req)),
        "reports.exportCsv" => Some(handle_reports_export_csv(state, req)),
        _ => None,
    }
}
