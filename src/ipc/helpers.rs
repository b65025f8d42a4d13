use rusqlite::Connection;
use serde_json::json;

use crate::auth::{self, AuthError, Role, Session};
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn required_str(req: &Request, key: &str) -> Result<String, HandlerErr> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// The one role gate (see crate::auth). Handlers never inspect roles
/// directly.
pub fn require_role(state: &AppState, required: Option<Role>) -> Result<Session, HandlerErr> {
    match auth::authorize(state.session.as_ref(), required) {
        Ok(s) => Ok(s.clone()),
        Err(AuthError::Unauthenticated) => Err(HandlerErr::with_details(
            "not_authenticated",
            "sign in first",
            json!({ "landingRoute": auth::LOGIN_ROUTE }),
        )),
        Err(AuthError::Forbidden { required, actual }) => Err(HandlerErr::with_details(
            "not_authorized",
            format!("this operation requires the {} role", required.as_str()),
            json!({ "landingRoute": auth::resolve_landing_route(actual, true) }),
        )),
    }
}

pub fn require_admin(state: &AppState) -> Result<Session, HandlerErr> {
    require_role(state, Some(Role::Admin))
}

pub fn require_teacher(state: &AppState) -> Result<Session, HandlerErr> {
    require_role(state, Some(Role::Teacher))
}

pub fn require_session(state: &AppState) -> Result<Session, HandlerErr> {
    require_role(state, None)
}
