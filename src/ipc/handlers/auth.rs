use rusqlite::OptionalExtension;
use serde_json::json;

use crate::auth::{self, Role, Session};
use crate::identity;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{required_str, require_session};
use crate::ipc::types::{AppState, Request};

const MIN_PASSWORD_CHARS: usize = 6;

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let email = match required_str(req, "email") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e.response(&req.id),
    };
    let password = match required_str(req, "password") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let row: Option<(String, String, String, i64)> = match conn
        .query_row(
            "SELECT id, full_name, role, is_active FROM profiles WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let Some((user_id, full_name, role_raw, is_active)) = row else {
        return err(&req.id, "not_authenticated", "invalid email or password", None);
    };
    let Some(role) = Role::parse(&role_raw) else {
        return err(&req.id, "internal", "profile has an unknown role", None);
    };
    if is_active == 0 {
        return err(
            &req.id,
            "not_authorized",
            "account is deactivated",
            Some(json!({ "landingRoute": auth::LOGIN_ROUTE })),
        );
    }

    match identity::verify(conn, &user_id, &password) {
        Ok(true) => {}
        Ok(false) => {
            return err(&req.id, "not_authenticated", "invalid email or password", None)
        }
        Err(e) => return err(&req.id, "upstream_failed", e.0, None),
    }

    let landing = auth::resolve_landing_route(role, true);
    state.session = Some(Session {
        user_id: user_id.clone(),
        role,
    });
    ok(
        &req.id,
        json!({
            "userId": user_id,
            "fullName": full_name,
            "role": role.as_str(),
            "landingRoute": landing
        }),
    )
}

fn handle_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.session = None;
    ok(&req.id, json!({ "ok": true }))
}

fn handle_session(state: &mut AppState, req: &Request) -> serde_json::Value {
    // A deactivated account's session was already cleared by the router,
    // so reaching here with a session means it is live.
    match state.session.as_ref() {
        None => ok(
            &req.id,
            json!({
                "state": "unauthenticated",
                "landingRoute": auth::LOGIN_ROUTE
            }),
        ),
        Some(s) => ok(
            &req.id,
            json!({
                "state": s.role.as_str(),
                "userId": s.user_id,
                "landingRoute": auth::resolve_landing_route(s.role, true)
            }),
        ),
    }
}

/// The caller must be an administrator, verified by looking their role up
/// in storage rather than trusting the in-memory session.
fn caller_role_from_db(
    conn: &rusqlite::Connection,
    session: &Session,
) -> Result<Option<Role>, rusqlite::Error> {
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM profiles WHERE id = ?",
            [&session.user_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(role.as_deref().and_then(Role::parse))
}

fn handle_change_password(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };

    let (Some(user_id), Some(new_password)) = (
        req.params.get("userId").and_then(|v| v.as_str()),
        req.params.get("newPassword").and_then(|v| v.as_str()),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "user id and new password are required",
            None,
        );
    };
    if new_password.chars().count() < MIN_PASSWORD_CHARS {
        return err(
            &req.id,
            "bad_params",
            "password must be at least 6 characters",
            None,
        );
    }

    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    match caller_role_from_db(conn, &session) {
        Ok(Some(Role::Admin)) => {}
        Ok(_) => {
            return err(
                &req.id,
                "not_authorized",
                "this operation is available to administrators only",
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    match identity::set_password(conn, user_id, new_password) {
        Ok(()) => ok(&req.id, json!({ "ok": true, "userId": user_id })),
        Err(e) => err(&req.id, "upstream_failed", e.0, None),
    }
}

fn handle_change_own_password(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let Some(new_password) = req.params.get("newPassword").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing newPassword", None);
    };
    if new_password.chars().count() < MIN_PASSWORD_CHARS {
        return err(
            &req.id,
            "bad_params",
            "password must be at least 6 characters",
            None,
        );
    }

    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match identity::set_password(conn, &session.user_id, new_password) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "upstream_failed", e.0, None),
    }
}

/// Acknowledgment stub: hard deletion of an account is not performed over
/// this protocol. Callers deactivate the profile first (users.update with
/// isActive=false) and this call confirms the request was well-formed.
fn handle_delete_user(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = crate::ipc::helpers::require_admin(state) {
        return e.response(&req.id);
    }
    let Some(user_id) = req.params.get("userId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing userId", None);
    };
    ok(
        &req.id,
        json!({
            "acknowledged": true,
            "userId": user_id,
            "message": "profile deactivation is the supported removal path; no identity records were deleted"
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.login" => Some(handle_login(state, req)),
        "auth.logout" => Some(handle_logout(state, req)),
        "auth.session" => Some(handle_session(state, req)),
        "auth.changePassword" => Some(handle_change_password(state, req)),
        "auth.changeOwnPassword" => Some(handle_change_own_password(state, req)),
        "auth.deleteUser" => Some(handle_delete_user(state, req)),
        _ => None,
    }
}
