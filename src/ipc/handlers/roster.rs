use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{opt_str, req_str, to_json, HandlerErr, HandlerResult};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, EnrollmentKey, NamedTable};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{json, Value};

fn create_student(conn: &Connection, p: &Value) -> HandlerResult {
    let s = roster::create_student(conn, req_str(p, "code")?, req_str(p, "fullName")?)?;
    to_json(&s)
}

fn create_subject(conn: &Connection, p: &Value) -> HandlerResult {
    let s = roster::create_subject(conn, req_str(p, "code")?, req_str(p, "name")?)?;
    to_json(&s)
}

fn create_semester(conn: &Connection, p: &Value) -> HandlerResult {
    let s = roster::create_semester(conn, req_str(p, "name")?, req_str(p, "academicYear")?)?;
    to_json(&s)
}

fn create_named(conn: &Connection, p: &Value, kind: NamedTable) -> HandlerResult {
    to_json(&roster::create_named(conn, kind, req_str(p, "name")?)?)
}

fn enroll(conn: &Connection, p: &Value) -> HandlerResult {
    let attempt = match p.get("attempt") {
        None | Some(Value::Null) => 1,
        Some(v) => match v.as_i64() {
            Some(n) if n >= 1 => n,
            _ => return Err(HandlerErr::bad_params("attempt must be an integer >= 1")),
        },
    };
    let key = EnrollmentKey {
        student_id: req_str(p, "studentId")?.to_string(),
        class_id: req_str(p, "classId")?.to_string(),
        subject_id: req_str(p, "subjectId")?.to_string(),
        cohort_id: req_str(p, "cohortId")?.to_string(),
        attempt,
    };
    let semester_id = req_str(p, "semesterId")?;
    let e = roster::lookup_or_create_enrollment(conn, &key, semester_id, &db::format_time(Utc::now()))?;
    to_json(&e)
}

fn set_enrollment_active(conn: &Connection, p: &Value) -> HandlerResult {
    let Some(active) = p.get("active").and_then(|v| v.as_bool()) else {
        return Err(HandlerErr::bad_params("active must be boolean"));
    };
    to_json(&roster::set_enrollment_active(conn, req_str(p, "enrollmentId")?, active)?)
}

fn list(conn: &Connection, p: &Value) -> HandlerResult {
    let kind = opt_str(p, "kind").unwrap_or("students");
    let items = match kind {
        "students" => to_json(&roster::list_students(conn)?)?,
        "subjects" => to_json(&roster::list_subjects(conn)?)?,
        "classes" => to_json(&roster::list_named(conn, NamedTable::Class)?)?,
        "cohorts" => to_json(&roster::list_named(conn, NamedTable::Cohort)?)?,
        "semesters" => to_json(&roster::list_semesters(conn)?)?,
        other => {
            return Err(HandlerErr::bad_params(format!(
                "kind must be one of: students, subjects, classes, cohorts, semesters (got {})",
                other
            )))
        }
    };
    Ok(json!({ "kind": kind, "items": items }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "roster.createStudent" => create_student,
        "roster.createSubject" => create_subject,
        "roster.createSemester" => create_semester,
        "roster.createClass" => |c, p| create_named(c, p, NamedTable::Class),
        "roster.createCohort" => |c, p| create_named(c, p, NamedTable::Cohort),
        "roster.enroll" => enroll,
        "roster.setEnrollmentActive" => set_enrollment_active,
        "roster.list" => list,
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
