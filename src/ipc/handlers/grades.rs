use crate::error::GradeError;
use crate::grades::{self, BatchError, BestEffortReport, GradeFilter, Outcome, ScoreRow, SheetScope};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    opt_str, parse_actor, parse_field, parse_ids, req_str, to_json, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle::{self, GradeField};
use crate::permissions;
use crate::roster;
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{json, Value};

fn outcome(o: &Outcome) -> HandlerResult {
    to_json(o)
}

fn batch(result: Result<Vec<Outcome>, BatchError>, what: &str) -> HandlerResult {
    match result {
        Ok(results) => Ok(json!({
            "ok": true,
            "updated": results.len(),
            "results": to_json(&results)?,
        })),
        Err(BatchError::Store(e)) => Err(e.into()),
        Err(BatchError::Rejected { total, errors }) => Err(HandlerErr::Other {
            code: "batch_rejected",
            message: format!("{} of {} {} failed; nothing was saved", errors.len(), total, what),
            details: Some(json!({
                "total": total,
                "rejected": errors.len(),
                "errors": errors.iter().map(|e| e.to_json()).collect::<Vec<_>>(),
            })),
        }),
    }
}

fn best_effort(report: BestEffortReport) -> HandlerResult {
    let mut result = json!({
        "ok": true,
        "updated": report.results.len(),
        "results": to_json(&report.results)?,
    });
    if !report.errors.is_empty() {
        result["rejected"] = json!(report.errors.len());
        result["errors"] = json!(report.errors.iter().map(|e| e.to_json()).collect::<Vec<_>>());
    }
    Ok(result)
}

fn max_ids(conn: &Connection) -> Result<usize, HandlerErr> {
    Ok(setup::limits(conn)?.max_batch_ids)
}

fn submit_for_review(conn: &Connection, p: &Value) -> HandlerResult {
    let actor = parse_actor(p)?;
    let ids = parse_ids(p, "gradeIds", max_ids(conn)?)?;
    batch(grades::submit_for_review(conn, &ids, &actor, Utc::now()), "grades")
}

fn approve_tx_dk(conn: &Connection, p: &Value) -> HandlerResult {
    let actor = parse_actor(p)?;
    outcome(&grades::approve_tx_dk(
        conn,
        req_str(p, "gradeId")?,
        &actor,
        opt_str(p, "reason"),
        Utc::now(),
    )?)
}

fn reject_to_draft(conn: &Connection, p: &Value) -> HandlerResult {
    let actor = parse_actor(p)?;
    outcome(&grades::reject_to_draft(
        conn,
        req_str(p, "gradeId")?,
        &actor,
        opt_str(p, "reason"),
        Utc::now(),
    )?)
}

fn enter_final_score(conn: &Connection, p: &Value) -> HandlerResult {
    let actor = parse_actor(p)?;
    let Some(score) = p.get("score").and_then(|v| v.as_f64()) else {
        return Err(HandlerErr::bad_params("score must be a number"));
    };
    outcome(&grades::enter_final_score(
        conn,
        req_str(p, "gradeId")?,
        &actor,
        score,
        opt_str(p, "reason"),
        Utc::now(),
    )?)
}

fn finalize_lock(conn: &Connection, p: &Value) -> HandlerResult {
    let actor = parse_actor(p)?;
    outcome(&grades::finalize_lock(
        conn,
        req_str(p, "gradeId")?,
        &actor,
        opt_str(p, "reason"),
        Utc::now(),
    )?)
}

fn parse_grade_field(p: &Value) -> Result<GradeField, HandlerErr> {
    let raw = req_str(p, "field")?;
    GradeField::parse(raw)
        .ok_or_else(|| HandlerErr::bad_params("field must be one of: tx, dk, final"))
}

fn emergency_unlock(conn: &Connection, p: &Value) -> HandlerResult {
    let actor = parse_actor(p)?;
    let field = parse_grade_field(p)?;
    outcome(&grades::emergency_unlock(
        conn,
        req_str(p, "gradeId")?,
        &actor,
        field,
        opt_str(p, "reason"),
        Utc::now(),
    )?)
}

fn bulk_save_scores(conn: &Connection, p: &Value) -> HandlerResult {
    let actor = parse_actor(p)?;
    let scope = SheetScope {
        class_id: req_str(p, "classId")?.to_string(),
        subject_id: req_str(p, "subjectId")?.to_string(),
        cohort_id: req_str(p, "cohortId")?.to_string(),
        semester_id: req_str(p, "semesterId")?.to_string(),
    };
    let Some(raw_rows) = p.get("rows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing rows[]"));
    };
    let max = setup::limits(conn)?.max_bulk_rows;
    if raw_rows.len() > max {
        return Err(HandlerErr::Other {
            code: "too_many_items",
            message: format!("bulk payload exceeds max rows: {} > {}", raw_rows.len(), max),
            details: Some(json!({ "count": raw_rows.len(), "max": max })),
        });
    }
    let mut rows = Vec::with_capacity(raw_rows.len());
    for (i, r) in raw_rows.iter().enumerate() {
        let row: ScoreRow = serde_json::from_value(r.clone())
            .map_err(|e| HandlerErr::bad_params(format!("row at index {} is invalid: {}", i, e)))?;
        rows.push(row);
    }
    batch(
        grades::bulk_save_scores(conn, &scope, &rows, &actor, Utc::now()),
        "rows",
    )
}

fn bulk_approve(conn: &Connection, p: &Value) -> HandlerResult {
    let actor = parse_actor(p)?;
    let ids = parse_ids(p, "gradeIds", max_ids(conn)?)?;
    best_effort(grades::bulk_approve(conn, &ids, &actor, opt_str(p, "reason"), Utc::now()))
}

fn bulk_lock_final(conn: &Connection, p: &Value) -> HandlerResult {
    let actor = parse_actor(p)?;
    let ids = parse_ids(p, "gradeIds", max_ids(conn)?)?;
    best_effort(grades::bulk_lock_final(conn, &ids, &actor, opt_str(p, "reason"), Utc::now()))
}

fn get(conn: &Connection, p: &Value) -> HandlerResult {
    to_json(&grades::load(conn, req_str(p, "gradeId")?)?)
}

fn list(conn: &Connection, p: &Value) -> HandlerResult {
    let actor = parse_actor(p)?;
    let filter: GradeFilter = match p.get("filter") {
        None | Some(Value::Null) => GradeFilter::default(),
        Some(_) => parse_field(p, "filter")?,
    };
    let mut rows = grades::list(conn, &filter)?;
    // Instructors only see grades inside their resolved scope.
    if !actor.is_admin() {
        let now = Utc::now();
        let mut visible = Vec::with_capacity(rows.len());
        for g in rows {
            let e = roster::get_enrollment(conn, &g.enrollment_id)?;
            if permissions::enrollment_in_scope(conn, &actor.id, &e, now)? {
                visible.push(g);
            }
        }
        rows = visible;
    }
    Ok(json!({ "grades": to_json(&rows)? }))
}

fn can_edit(conn: &Connection, p: &Value) -> HandlerResult {
    let actor = parse_actor(p)?;
    let grade = grades::load(conn, req_str(p, "gradeId")?)?;
    let in_scope = match grades::ensure_in_scope(conn, &actor, &grade, Utc::now()) {
        Ok(()) => true,
        Err(GradeError::StateGuard(_)) => false,
        Err(e) => return Err(e.into()),
    };
    let check = |f: GradeField| in_scope && lifecycle::can_edit(&actor, &grade, f);
    Ok(json!({
        "gradeId": grade.id,
        "status": grade.status,
        "inScope": in_scope,
        "tx": check(GradeField::Tx),
        "dk": check(GradeField::Dk),
        "final": check(GradeField::Final),
    }))
}

fn history(conn: &Connection, p: &Value) -> HandlerResult {
    let grade_id = req_str(p, "gradeId")?;
    grades::load(conn, grade_id)?;
    Ok(json!({ "events": to_json(&grades::list_events(conn, grade_id)?)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "grades.submitForReview" => submit_for_review,
        "grades.approveTxDk" => approve_tx_dk,
        "grades.rejectToDraft" => reject_to_draft,
        "grades.enterFinalScore" => enter_final_score,
        "grades.finalizeLock" => finalize_lock,
        "grades.emergencyUnlock" => emergency_unlock,
        "grades.bulkSaveScores" => bulk_save_scores,
        "grades.bulkApprove" => bulk_approve,
        "grades.bulkLockFinal" => bulk_lock_final,
        "grades.get" => get,
        "grades.list" => list,
        "grades.canEdit" => can_edit,
        "grades.history" => history,
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
