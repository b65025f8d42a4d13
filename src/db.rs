use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("gradebook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS profiles(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL,
            subject TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_profiles_role ON profiles(role)",
        [],
    )?;

    // Identity directory. Stands in for the hosted auth provider; only
    // src/identity.rs touches this table.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS auth_users(
            profile_id TEXT PRIMARY KEY,
            password_hash TEXT NOT NULL,
            FOREIGN KEY(profile_id) REFERENCES profiles(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_schema(
            id TEXT PRIMARY KEY,
            evaluation_1_max REAL NOT NULL,
            evaluation_2_max REAL NOT NULL,
            evaluation_3_max REAL NOT NULL,
            evaluation_4_max REAL NOT NULL,
            monthly_exam_max REAL NOT NULL,
            notebook_max REAL NOT NULL,
            attendance_max REAL NOT NULL,
            behavior_max REAL NOT NULL,
            enforce_maxima INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT
        )",
        [],
    )?;
    ensure_grade_schema_enforce_flag(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_assignments(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(teacher_id) REFERENCES profiles(id),
            UNIQUE(class_id, subject)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_assignments_class ON class_assignments(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_assignments_teacher ON class_assignments(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            seat_number TEXT,
            national_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            evaluation_1 REAL,
            evaluation_2 REAL,
            evaluation_3 REAL,
            evaluation_4 REAL,
            monthly_exam REAL,
            notebook REAL,
            attendance REAL,
            behavior REAL,
            total REAL NOT NULL DEFAULT 0,
            is_locked INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(teacher_id) REFERENCES profiles(id),
            UNIQUE(student_id, class_id, subject)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_class ON grades(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_teacher_class ON grades(teacher_id, class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_class_updated ON grades(class_id, updated_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            attendance_date TEXT NOT NULL,
            is_present INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(teacher_id) REFERENCES profiles(id),
            UNIQUE(student_id, attendance_date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_class_date ON attendance(class_id, attendance_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_logs(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            action TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT,
            before_snapshot TEXT,
            after_snapshot TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_logs_created ON audit_logs(created_at)",
        [],
    )?;

    Ok(conn)
}

fn ensure_grade_schema_enforce_flag(conn: &Connection) -> anyhow::Result<()> {
    // Workspaces created before the bounds-enforcement option lack the column.
    if table_has_column(conn, "grade_schema", "enforce_maxima")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE grade_schema ADD COLUMN enforce_maxima INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// UTC, second precision. Lexicographic order over these strings matches
/// chronological order, which the report month-window filter relies on.
pub fn now_stamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

pub fn record_audit(
    conn: &Connection,
    user_id: &str,
    action: &str,
    entity_type: &str,
    entity_id: Option<&str>,
    before: Option<&serde_json::Value>,
    after: Option<&serde_json::Value>,
) -> anyhow::Result<()> {
    let before_text = before.map(|v| v.to_string());
    let after_text = after.map(|v| v.to_string());
    conn.execute(
        "INSERT INTO audit_logs(id, user_id, action, entity_type, entity_id, before_snapshot, after_snapshot, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            uuid::Uuid::new_v4().to_string(),
            user_id,
            action,
            entity_type,
            entity_id,
            before_text,
            after_text,
            now_stamp(),
        ),
    )?;
    Ok(())
}
