use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{parse_actor, parse_field, req_str, to_json, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::retake::{self, RetakeScores};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{json, Value};

fn record(conn: &Connection, p: &Value) -> HandlerResult {
    let actor = parse_actor(p)?;
    let scores: RetakeScores = match p.get("scores") {
        None | Some(Value::Null) => RetakeScores::default(),
        Some(_) => parse_field(p, "scores")?,
    };
    let attempt_number = match p.get("attemptNumber") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_i64()
                .ok_or_else(|| HandlerErr::bad_params("attemptNumber must be an integer"))?,
        ),
    };
    let out = retake::record_retake(
        conn,
        req_str(p, "studentId")?,
        req_str(p, "subjectId")?,
        &scores,
        attempt_number,
        &actor,
        Utc::now(),
    )?;
    to_json(&out)
}

fn list(conn: &Connection, p: &Value) -> HandlerResult {
    let attempts = retake::list_attempts(conn, req_str(p, "studentId")?, req_str(p, "subjectId")?)?;
    Ok(json!({ "attempts": to_json(&attempts)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "retakes.record" => record,
        "retakes.list" => list,
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
