use crate::audit;
use crate::db;
use crate::error::GradeResult;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    parse_actor, parse_at, parse_field, req_str, require_admin, to_json, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::permissions::{self, NewGrant};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{json, Value};

fn grant(conn: &Connection, p: &Value) -> HandlerResult {
    let actor = parse_actor(p)?;
    require_admin(&actor, "granting permissions")?;
    let new: NewGrant = parse_field(p, "grant")?;
    let now = Utc::now();
    let g = db::with_tx(conn, |tx| -> GradeResult<_> {
        let g = permissions::create_grant(tx, &new, now)?;
        audit::append(
            tx,
            "permission_grant",
            &g.id,
            "grant",
            &actor.id,
            None::<&()>,
            Some(&g),
            &db::format_time(now),
        )?;
        Ok(g)
    })?;
    tracing::info!(grant_id = %g.id, grantee = %g.grantee_id, "permission granted");
    to_json(&g)
}

fn revoke(conn: &Connection, p: &Value) -> HandlerResult {
    let actor = parse_actor(p)?;
    require_admin(&actor, "revoking permissions")?;
    let grant_id = req_str(p, "grantId")?;
    let now = Utc::now();
    let g = db::with_tx(conn, |tx| -> GradeResult<_> {
        let before = permissions::get_grant(tx, grant_id)?;
        let after = permissions::revoke_grant(tx, grant_id, now)?;
        audit::append(
            tx,
            "permission_grant",
            grant_id,
            "revoke",
            &actor.id,
            Some(&before),
            Some(&after),
            &db::format_time(now),
        )?;
        Ok(after)
    })?;
    tracing::info!(grant_id, "permission revoked");
    to_json(&g)
}

fn list(conn: &Connection, p: &Value) -> HandlerResult {
    let grants = permissions::list_grants(conn, req_str(p, "granteeId")?)?;
    Ok(json!({ "grants": to_json(&grants)? }))
}

fn resolve(conn: &Connection, p: &Value) -> HandlerResult {
    let grantee = req_str(p, "granteeId")?;
    let at = parse_at(p)?;
    let clauses = permissions::clauses_for(conn, grantee, at)?;
    let enrollments = permissions::resolve_enrollments(conn, grantee, at)?;
    Ok(json!({
        "at": db::format_time(at),
        "clauses": to_json(&clauses)?,
        "enrollments": to_json(&enrollments)?,
    }))
}

fn expire_sweep(conn: &Connection, p: &Value) -> HandlerResult {
    let at = parse_at(p)?;
    let expired = permissions::expire_grants(conn, at)?;
    Ok(json!({ "expired": expired }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "permissions.grant" => grant,
        "permissions.revoke" => revoke,
        "permissions.list" => list,
        "permissions.resolve" => resolve,
        "permissions.expireSweep" => expire_sweep,
        _ => return None,
    };
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(match run(conn, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
