use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::auth::Role;
use crate::db;
use crate::identity;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, require_admin, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn profile_json(
    id: &str,
    full_name: &str,
    email: &str,
    role: &str,
    subject: Option<&str>,
    is_active: bool,
    created_at: &str,
) -> serde_json::Value {
    json!({
        "id": id,
        "fullName": full_name,
        "email": email,
        "role": role,
        "subject": subject,
        "isActive": is_active,
        "createdAt": created_at
    })
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state) {
        return e.response(&req.id);
    }
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, full_name, email, role, subject, is_active, created_at
         FROM profiles
         ORDER BY created_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let full_name: String = r.get(1)?;
            let email: String = r.get(2)?;
            let role: String = r.get(3)?;
            let subject: Option<String> = r.get(4)?;
            let is_active: i64 = r.get(5)?;
            let created_at: String = r.get(6)?;
            Ok(profile_json(
                &id,
                &full_name,
                &email,
                &role,
                subject.as_deref(),
                is_active != 0,
                &created_at,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn admin_exists(conn: &rusqlite::Connection) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM profiles WHERE role = 'admin'",
        [],
        |r| r.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let bootstrap = match admin_exists(conn) {
        Ok(exists) => !exists,
        Err(e) => return e.response(&req.id),
    };

    // Initial setup: the very first administrator is created without a
    // session. Every later account requires one.
    let actor = match require_admin(state) {
        Ok(s) => Some(s),
        Err(e) if !bootstrap => return e.response(&req.id),
        Err(_) => None,
    };

    let full_name = match req.params.get("fullName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing fullName", None),
    };
    let email = match req.params.get("email").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing email", None),
    };
    let role = match req
        .params
        .get("role")
        .and_then(|v| v.as_str())
        .and_then(Role::parse)
    {
        Some(r) => r,
        None => {
            return err(
                &req.id,
                "bad_params",
                "role must be one of: admin, teacher",
                None,
            )
        }
    };
    if actor.is_none() && role != Role::Admin {
        return err(
            &req.id,
            "not_authorized",
            "the first account must be an administrator",
            None,
        );
    }
    let subject = req
        .params
        .get("subject")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let password = match req.params.get("password").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing password", None),
    };
    if password.chars().count() < 6 {
        return err(
            &req.id,
            "bad_params",
            "password must be at least 6 characters",
            None,
        );
    }

    let duplicate: Option<i64> = match conn
        .query_row("SELECT 1 FROM profiles WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if duplicate.is_some() {
        return err(
            &req.id,
            "duplicate_email",
            format!("an account already exists for {}", email),
            Some(json!({ "email": email })),
        );
    }

    let user_id = Uuid::new_v4().to_string();
    let created_at = db::now_stamp();

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO profiles(id, full_name, email, role, subject, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (&user_id, &full_name, &email, role.as_str(), &subject, &created_at),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = identity::register(&tx, &user_id, &password) {
        let _ = tx.rollback();
        return err(&req.id, "upstream_failed", e.0, None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let actor_id = actor
        .map(|s| s.user_id)
        .unwrap_or_else(|| user_id.clone());
    let after = profile_json(
        &user_id,
        &full_name,
        &email,
        role.as_str(),
        subject.as_deref(),
        true,
        &created_at,
    );
    let _ = db::record_audit(
        conn,
        &actor_id,
        "created",
        "user",
        Some(&user_id),
        None,
        Some(&after),
    );

    ok(&req.id, json!({ "user": after }))
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match require_admin(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(user_id) = req.params.get("userId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing userId", None);
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let current: Option<(String, String, String, Option<String>, i64, String)> = match conn
        .query_row(
            "SELECT full_name, email, role, subject, is_active, created_at
             FROM profiles WHERE id = ?",
            [user_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((full_name, email, role_raw, subject, is_active, created_at)) = current else {
        return err(&req.id, "not_found", "user not found", None);
    };

    let before = profile_json(
        user_id,
        &full_name,
        &email,
        &role_raw,
        subject.as_deref(),
        is_active != 0,
        &created_at,
    );

    let mut new_full_name = full_name;
    let mut new_role = role_raw;
    let mut new_subject = subject;
    let mut new_active = is_active != 0;

    for (k, v) in patch {
        match k.as_str() {
            "fullName" => match v.as_str() {
                Some(s) if !s.trim().is_empty() => new_full_name = s.trim().to_string(),
                _ => return err(&req.id, "bad_params", "fullName must not be empty", None),
            },
            "role" => match v.as_str().and_then(Role::parse) {
                Some(r) => new_role = r.as_str().to_string(),
                None => {
                    return err(
                        &req.id,
                        "bad_params",
                        "role must be one of: admin, teacher",
                        None,
                    )
                }
            },
            "subject" => {
                if v.is_null() {
                    new_subject = None;
                } else if let Some(s) = v.as_str() {
                    let t = s.trim().to_string();
                    new_subject = if t.is_empty() { None } else { Some(t) };
                } else {
                    return err(&req.id, "bad_params", "subject must be string or null", None);
                }
            }
            "isActive" => match v.as_bool() {
                Some(b) => new_active = b,
                None => return err(&req.id, "bad_params", "isActive must be boolean", None),
            },
            other => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown patch field: {}", other),
                    None,
                )
            }
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE profiles SET full_name = ?, role = ?, subject = ?, is_active = ? WHERE id = ?",
        (
            &new_full_name,
            &new_role,
            &new_subject,
            new_active as i64,
            user_id,
        ),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let after = profile_json(
        user_id,
        &new_full_name,
        &email,
        &new_role,
        new_subject.as_deref(),
        new_active,
        &created_at,
    );
    let _ = db::record_audit(
        conn,
        &actor.user_id,
        "updated",
        "user",
        Some(user_id),
        Some(&before),
        Some(&after),
    );

    ok(&req.id, json!({ "user": after }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(handle_users_list(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        _ => None,
    }
}
