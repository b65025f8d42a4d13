use rusqlite::OptionalExtension;

use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

/// Deactivated accounts are signed out on their next request, before any
/// handler sees the session.
fn expire_deactivated_session(state: &mut AppState) {
    let Some(user_id) = state.session.as_ref().map(|s| s.user_id.clone()) else {
        return;
    };
    let Some(conn) = state.db.as_ref() else {
        state.session = None;
        return;
    };
    let active = conn
        .query_row(
            "SELECT is_active FROM profiles WHERE id = ?",
            [&user_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .unwrap_or(None);
    if active != Some(1) {
        state.session = None;
    }
}

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    expire_deactivated_session(state);

    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::auth::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::users::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::schema::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::classes::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::students::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::grades::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::attendance::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::reports::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::audit::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::dashboard::try_handle(state, &req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
