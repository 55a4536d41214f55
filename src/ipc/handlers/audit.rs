use crate::audit;
use crate::ipc::error::{err, grade_err, ok};
use crate::ipc::helpers::{req_str, to_json};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_audit_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (entity, entity_id) = match (req_str(&req.params, "entity"), req_str(&req.params, "entityId")) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => return e.response(&req.id),
    };
    let entries = match audit::list(conn, entity, entity_id) {
        Ok(v) => v,
        Err(e) => return grade_err(&req.id, &e),
    };
    match to_json(&entries) {
        Ok(v) => ok(&req.id, json!({ "entries": v })),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.list" => Some(handle_audit_list(state, req)),
        _ => None,
    }
}
