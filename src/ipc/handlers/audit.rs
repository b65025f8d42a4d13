use std::collections::HashMap;

use serde_json::json;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, require_admin};
use crate::ipc::types::{AppState, Request};

const AUDIT_LIST_LIMIT: i64 = 500;

fn snapshot_value(raw: Option<String>) -> serde_json::Value {
    match raw {
        None => serde_json::Value::Null,
        Some(text) => serde_json::from_str(&text).unwrap_or(serde_json::Value::Null),
    }
}

fn handle_audit_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_admin(state) {
        return e.response(&req.id);
    }
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    let names: Result<HashMap<String, String>, _> = conn
        .prepare("SELECT id, full_name FROM profiles")
        .and_then(|mut stmt| {
            stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
                .and_then(|it| it.collect())
        });
    let names = match names {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, user_id, action, entity_type, entity_id, before_snapshot, after_snapshot, created_at
         FROM audit_logs
         ORDER BY created_at DESC, id
         LIMIT ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([AUDIT_LIST_LIMIT], |r| {
            let id: String = r.get(0)?;
            let user_id: String = r.get(1)?;
            let action: String = r.get(2)?;
            let entity_type: String = r.get(3)?;
            let entity_id: Option<String> = r.get(4)?;
            let before: Option<String> = r.get(5)?;
            let after: Option<String> = r.get(6)?;
            let created_at: String = r.get(7)?;
            let user_name = names
                .get(&user_id)
                .cloned()
                .unwrap_or_else(|| "Unknown".to_string());
            Ok(json!({
                "id": id,
                "userId": user_id,
                "userName": user_name,
                "action": action,
                "entityType": entity_type,
                "entityId": entity_id,
                "before": snapshot_value(before),
                "after": snapshot_value(after),
                "createdAt": created_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(logs) => ok(&req.id, json!({ "logs": logs })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.list" => Some(handle_audit_list(state, req)),
        _ => None,
    }
}
