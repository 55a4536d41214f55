//! Persisted grade records and the lifecycle operations exposed to callers.
//!
//! Every public operation here returns an [`Outcome`]: the grade after the
//! mutation, its status, and the ids of any transition events or attempt
//! records it produced. Bulk policies are fixed per operation:
//!
//! - [`bulk_save_scores`] and [`submit_for_review`] are all-or-nothing.
//! - [`bulk_approve`] and [`bulk_lock_final`] are best-effort per record.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::audit;
use crate::calc::{self, Classification, ScoreMap};
use crate::db;
use crate::error::{GradeError, GradeResult};
use crate::lifecycle::{self, Actor, GradeField, GradeStatus, Locks, Transition};
use crate::permissions;
use crate::retake::{self, Placement, RetakeScores};
use crate::roster::{self, EnrollmentKey};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub id: String,
    pub student_id: String,
    pub enrollment_id: String,
    pub subject_id: String,
    pub semester_id: String,
    pub academic_year: String,
    pub tx_scores: ScoreMap,
    pub dk_scores: ScoreMap,
    pub final_score: Option<f64>,
    pub tbkt_score: Option<f64>,
    pub tbmh_score: Option<f64>,
    pub classification: Option<Classification>,
    pub passed: bool,
    pub attempt_number: i64,
    pub status: GradeStatus,
    #[serde(flatten)]
    pub locks: Locks,
    pub submitted_at: Option<String>,
    pub submitted_by: Option<String>,
    pub approved_at: Option<String>,
    pub approved_by: Option<String>,
    pub finalized_at: Option<String>,
    pub finalized_by: Option<String>,
    /// Bumped on every write. Not checked on update yet.
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl GradeRecord {
    pub fn blank(
        id: &str,
        student_id: &str,
        enrollment_id: &str,
        subject_id: &str,
        semester_id: &str,
        academic_year: &str,
        now: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            student_id: student_id.to_string(),
            enrollment_id: enrollment_id.to_string(),
            subject_id: subject_id.to_string(),
            semester_id: semester_id.to_string(),
            academic_year: academic_year.to_string(),
            tx_scores: ScoreMap::new(),
            dk_scores: ScoreMap::new(),
            final_score: None,
            tbkt_score: None,
            tbmh_score: None,
            classification: None,
            passed: false,
            attempt_number: 1,
            status: GradeStatus::Draft,
            locks: Locks::default(),
            submitted_at: None,
            submitted_by: None,
            approved_at: None,
            approved_by: None,
            finalized_at: None,
            finalized_by: None,
            version: 0,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }

    /// Re-derives computed scores. A gated final is dropped here, before persistence.
    pub fn recompute(&mut self) {
        let c = calc::derive(&self.tx_scores, &self.dk_scores, self.final_score);
        self.final_score = c.final_score;
        self.tbkt_score = c.tbkt;
        self.tbmh_score = c.tbmh;
        self.classification = c.classification;
        self.passed = c.passed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Transition,
    Override,
}

impl EventKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Transition => "transition",
            Self::Override => "override",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransitionEvent {
    pub id: String,
    pub grade_id: String,
    pub from_state: String,
    pub to_state: String,
    pub kind: String,
    pub actor_id: String,
    pub actor_role: String,
    pub reason: Option<String>,
    pub at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub grade: GradeRecord,
    pub status: GradeStatus,
    pub event_ids: Vec<String>,
    pub attempt_ids: Vec<String>,
}

impl Outcome {
    pub fn new(grade: GradeRecord) -> Self {
        Self {
            status: grade.status,
            grade,
            event_ids: Vec::new(),
            attempt_ids: Vec::new(),
        }
    }
}

/// One failed item of a bulk operation.
#[derive(Debug)]
pub struct RowError {
    pub index: usize,
    pub key: String,
    pub error: GradeError,
}

impl RowError {
    pub fn to_json(&self) -> serde_json::Value {
        self.error
            .to_row_json(json!({ "index": self.index, "key": self.key }))
    }
}

#[derive(Debug)]
pub enum BatchError {
    /// Some rows failed; nothing was committed.
    Rejected { total: usize, errors: Vec<RowError> },
    Store(GradeError),
}

impl From<rusqlite::Error> for BatchError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(GradeError::Db(e))
    }
}

#[derive(Debug, Default)]
pub struct BestEffortReport {
    pub results: Vec<Outcome>,
    pub errors: Vec<RowError>,
}

const GRADE_COLUMNS: &str = "id, student_id, enrollment_id, subject_id, semester_id, academic_year,
    tx_scores, dk_scores, final_score, tbkt_score, tbmh_score, classification, passed,
    attempt_number, status, tx_locked, dk_locked, final_locked,
    submitted_at, submitted_by, approved_at, approved_by, finalized_at, finalized_by,
    version, created_at, updated_at";

pub(crate) fn score_map_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<ScoreMap> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn grade_from_row(row: &Row<'_>) -> rusqlite::Result<GradeRecord> {
    let classification: Option<String> = row.get(11)?;
    let status: String = row.get(14)?;
    let status = GradeStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            14,
            rusqlite::types::Type::Text,
            format!("unknown grade status {status}").into(),
        )
    })?;
    Ok(GradeRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        enrollment_id: row.get(2)?,
        subject_id: row.get(3)?,
        semester_id: row.get(4)?,
        academic_year: row.get(5)?,
        tx_scores: score_map_col(row, 6)?,
        dk_scores: score_map_col(row, 7)?,
        final_score: row.get(8)?,
        tbkt_score: row.get(9)?,
        tbmh_score: row.get(10)?,
        classification: classification.as_deref().and_then(Classification::parse),
        passed: row.get::<_, i64>(12)? != 0,
        attempt_number: row.get(13)?,
        status,
        locks: Locks {
            tx_locked: row.get::<_, i64>(15)? != 0,
            dk_locked: row.get::<_, i64>(16)? != 0,
            final_locked: row.get::<_, i64>(17)? != 0,
        },
        submitted_at: row.get(18)?,
        submitted_by: row.get(19)?,
        approved_at: row.get(20)?,
        approved_by: row.get(21)?,
        finalized_at: row.get(22)?,
        finalized_by: row.get(23)?,
        version: row.get(24)?,
        created_at: row.get(25)?,
        updated_at: row.get(26)?,
    })
}

pub fn load(conn: &Connection, id: &str) -> GradeResult<GradeRecord> {
    let sql = format!("SELECT {} FROM grades WHERE id = ?", GRADE_COLUMNS);
    conn.query_row(&sql, [id], grade_from_row)
        .optional()?
        .ok_or_else(|| GradeError::not_found("grade", id))
}

fn find_by_key(
    conn: &Connection,
    student_id: &str,
    enrollment_id: &str,
    semester_id: &str,
    academic_year: &str,
) -> GradeResult<Option<GradeRecord>> {
    let sql = format!(
        "SELECT {} FROM grades
         WHERE student_id = ? AND enrollment_id = ? AND semester_id = ? AND academic_year = ?",
        GRADE_COLUMNS
    );
    Ok(conn
        .query_row(
            &sql,
            (student_id, enrollment_id, semester_id, academic_year),
            grade_from_row,
        )
        .optional()?)
}

/// The grade a (student, subject) pair is on: highest attempt first, then the
/// most recently updated.
pub fn find_for_pair(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
) -> GradeResult<Option<GradeRecord>> {
    let sql = format!(
        "SELECT {} FROM grades WHERE student_id = ? AND subject_id = ?
         ORDER BY attempt_number DESC, updated_at DESC, created_at DESC LIMIT 1",
        GRADE_COLUMNS
    );
    Ok(conn
        .query_row(&sql, (student_id, subject_id), grade_from_row)
        .optional()?)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeFilter {
    pub class_id: Option<String>,
    pub subject_id: Option<String>,
    pub semester_id: Option<String>,
    pub status: Option<GradeStatus>,
}

pub fn list(conn: &Connection, filter: &GradeFilter) -> GradeResult<Vec<GradeRecord>> {
    let cols = GRADE_COLUMNS
        .split(',')
        .map(|c| format!("g.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "SELECT {} FROM grades g JOIN enrollments e ON e.id = g.enrollment_id WHERE 1 = 1",
        cols
    );
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(v) = &filter.class_id {
        sql.push_str(" AND e.class_id = ?");
        binds.push(v.clone().into());
    }
    if let Some(v) = &filter.subject_id {
        sql.push_str(" AND g.subject_id = ?");
        binds.push(v.clone().into());
    }
    if let Some(v) = &filter.semester_id {
        sql.push_str(" AND g.semester_id = ?");
        binds.push(v.clone().into());
    }
    if let Some(v) = filter.status {
        sql.push_str(" AND g.status = ?");
        binds.push(v.as_str().to_string().into());
    }
    sql.push_str(" ORDER BY g.student_id, g.created_at");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), grade_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn insert(conn: &Connection, g: &GradeRecord) -> GradeResult<()> {
    conn.execute(
        "INSERT INTO grades(id, student_id, enrollment_id, subject_id, semester_id, academic_year, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &g.id,
            &g.student_id,
            &g.enrollment_id,
            &g.subject_id,
            &g.semester_id,
            &g.academic_year,
            g.status.as_str(),
            &g.created_at,
            &g.updated_at,
        ),
    )?;
    Ok(())
}

/// Writes every mutable column and bumps `version`.
pub(crate) fn store(conn: &Connection, g: &mut GradeRecord, now: &str) -> GradeResult<()> {
    g.version += 1;
    g.updated_at = now.to_string();
    conn.execute(
        "UPDATE grades SET
           enrollment_id = ?, semester_id = ?, academic_year = ?,
           tx_scores = ?, dk_scores = ?, final_score = ?, tbkt_score = ?, tbmh_score = ?,
           classification = ?, passed = ?, attempt_number = ?, status = ?,
           tx_locked = ?, dk_locked = ?, final_locked = ?,
           submitted_at = ?, submitted_by = ?, approved_at = ?, approved_by = ?,
           finalized_at = ?, finalized_by = ?, version = ?, updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            &g.enrollment_id,
            &g.semester_id,
            &g.academic_year,
            serde_json::to_string(&g.tx_scores)?,
            serde_json::to_string(&g.dk_scores)?,
            g.final_score,
            g.tbkt_score,
            g.tbmh_score,
            g.classification.map(Classification::label),
            g.passed as i64,
            g.attempt_number,
            g.status.as_str(),
            g.locks.tx_locked as i64,
            g.locks.dk_locked as i64,
            g.locks.final_locked as i64,
            &g.submitted_at,
            &g.submitted_by,
            &g.approved_at,
            &g.approved_by,
            &g.finalized_at,
            &g.finalized_by,
            g.version,
            &g.updated_at,
            &g.id,
        ],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn record_event(
    conn: &Connection,
    grade_id: &str,
    from: GradeStatus,
    to: GradeStatus,
    kind: EventKind,
    actor: &Actor,
    reason: Option<&str>,
    now: &str,
) -> GradeResult<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO state_transition_events(id, grade_id, from_state, to_state, kind, actor_id, actor_role, reason, at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            grade_id,
            from.as_str(),
            to.as_str(),
            kind.as_str(),
            &actor.id,
            actor.role.as_str(),
            reason,
            now,
        ),
    )?;
    tracing::info!(
        grade_id,
        from = from.as_str(),
        to = to.as_str(),
        kind = kind.as_str(),
        actor = %actor.id,
        "grade state event"
    );
    Ok(id)
}

pub fn list_events(conn: &Connection, grade_id: &str) -> GradeResult<Vec<StateTransitionEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, grade_id, from_state, to_state, kind, actor_id, actor_role, reason, at
         FROM state_transition_events WHERE grade_id = ? ORDER BY at, rowid",
    )?;
    let rows = stmt
        .query_map([grade_id], |r| {
            Ok(StateTransitionEvent {
                id: r.get(0)?,
                grade_id: r.get(1)?,
                from_state: r.get(2)?,
                to_state: r.get(3)?,
                kind: r.get(4)?,
                actor_id: r.get(5)?,
                actor_role: r.get(6)?,
                reason: r.get(7)?,
                at: r.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Instructors may only touch grades whose enrollment is inside their resolved scope.
pub(crate) fn ensure_in_scope(
    conn: &Connection,
    actor: &Actor,
    grade: &GradeRecord,
    now: DateTime<Utc>,
) -> GradeResult<()> {
    if actor.is_admin() {
        return Ok(());
    }
    let enrollment = roster::get_enrollment(conn, &grade.enrollment_id)?;
    if permissions::enrollment_in_scope(conn, &actor.id, &enrollment, now)? {
        return Ok(());
    }
    Err(GradeError::guard(
        "grade is outside the instructor's permission scope",
    ))
}

fn require_reason(reason: Option<&str>, what: &str) -> GradeResult<String> {
    match reason.map(str::trim) {
        Some(r) if !r.is_empty() => Ok(r.to_string()),
        _ => Err(GradeError::validation(format!("a reason is required to {}", what))),
    }
}

/// Runs one lifecycle transition on a stored grade and persists the result.
fn transition_one(
    conn: &Connection,
    grade_id: &str,
    actor: &Actor,
    transition: Transition,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> GradeResult<Outcome> {
    let ts = db::format_time(now);
    let mut grade = load(conn, grade_id)?;
    ensure_in_scope(conn, actor, &grade, now)?;
    let before = grade.clone();

    let from = grade.status;
    let to = lifecycle::apply_transition(actor, &mut grade, transition, reason)?;
    match transition {
        Transition::Submit => {
            grade.submitted_at = Some(ts.clone());
            grade.submitted_by = Some(actor.id.clone());
        }
        Transition::Approve => {
            grade.approved_at = Some(ts.clone());
            grade.approved_by = Some(actor.id.clone());
        }
        Transition::Reject => {
            grade.submitted_at = None;
            grade.submitted_by = None;
        }
        Transition::EnterFinal => {}
        Transition::Finalize => {
            grade.finalized_at = Some(ts.clone());
            grade.finalized_by = Some(actor.id.clone());
        }
    }

    store(conn, &mut grade, &ts)?;
    let event_id = record_event(
        conn,
        &grade.id,
        from,
        to,
        EventKind::Transition,
        actor,
        reason,
        &ts,
    )?;
    audit::append(
        conn,
        "grade",
        &grade.id,
        transition.name(),
        &actor.id,
        Some(&before),
        Some(&grade),
        &ts,
    )?;

    let mut out = Outcome::new(grade);
    out.event_ids.push(event_id);
    Ok(out)
}

/// DRAFT -> PENDING_REVIEW for every id, all-or-nothing.
pub fn submit_for_review(
    conn: &Connection,
    grade_ids: &[String],
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<Vec<Outcome>, BatchError> {
    if grade_ids.is_empty() {
        return Err(BatchError::Store(GradeError::validation(
            "gradeIds must not be empty",
        )));
    }
    db::with_tx(conn, |tx| {
        let mut results = Vec::with_capacity(grade_ids.len());
        let mut errors = Vec::new();
        for (index, id) in grade_ids.iter().enumerate() {
            match transition_one(tx, id, actor, Transition::Submit, None, now) {
                Ok(o) => results.push(o),
                Err(error) => errors.push(RowError {
                    index,
                    key: id.clone(),
                    error,
                }),
            }
        }
        if errors.is_empty() {
            Ok(results)
        } else {
            tracing::warn!(failed = errors.len(), "submit for review rejected");
            Err(BatchError::Rejected {
                total: grade_ids.len(),
                errors,
            })
        }
    })
}

pub fn approve_tx_dk(
    conn: &Connection,
    grade_id: &str,
    actor: &Actor,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> GradeResult<Outcome> {
    db::with_tx(conn, |tx| {
        transition_one(tx, grade_id, actor, Transition::Approve, reason, now)
    })
}

pub fn reject_to_draft(
    conn: &Connection,
    grade_id: &str,
    actor: &Actor,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> GradeResult<Outcome> {
    let reason = require_reason(reason, "reject")?;
    db::with_tx(conn, |tx| {
        transition_one(tx, grade_id, actor, Transition::Reject, Some(&reason), now)
    })
}

/// Saves a final score. From APPROVED_TX_DK this is the FINAL_ENTERED transition;
/// in FINAL_ENTERED (or an unsealed FINALIZED record) it only corrects the value.
pub fn enter_final_score(
    conn: &Connection,
    grade_id: &str,
    actor: &Actor,
    score: f64,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> GradeResult<Outcome> {
    calc::validate_score("finalScore", score)?;
    db::with_tx(conn, |tx| {
        let ts = db::format_time(now);
        let mut grade = load(tx, grade_id)?;
        ensure_in_scope(tx, actor, &grade, now)?;
        if !actor.is_admin() {
            return Err(GradeError::guard(
                "enter final score requires an administrator",
            ));
        }
        if !matches!(
            grade.status,
            GradeStatus::ApprovedTxDk | GradeStatus::FinalEntered | GradeStatus::Finalized
        ) {
            return Err(GradeError::guard(format!(
                "cannot enter final score: grade is {} (TX/DK must be approved first)",
                grade.status.as_str()
            )));
        }
        lifecycle::ensure_can_edit(actor, &grade, GradeField::Final)?;
        if calc::final_is_gated(grade.tbkt_score) {
            return Err(GradeError::guard(format!(
                "cannot enter final score: TBKT {:.2} is below {:.1}",
                grade.tbkt_score.unwrap_or_default(),
                calc::PASS_THRESHOLD
            )));
        }

        let before = grade.clone();
        grade.final_score = Some(score);
        grade.recompute();

        let mut event_ids = Vec::new();
        if grade.status == GradeStatus::ApprovedTxDk {
            let from = grade.status;
            let to = lifecycle::apply_transition(actor, &mut grade, Transition::EnterFinal, reason)?;
            store(tx, &mut grade, &ts)?;
            event_ids.push(record_event(
                tx,
                &grade.id,
                from,
                to,
                EventKind::Transition,
                actor,
                reason,
                &ts,
            )?);
        } else {
            store(tx, &mut grade, &ts)?;
        }
        retake::sync_current(tx, &grade)?;
        audit::append(
            tx,
            "grade",
            &grade.id,
            "enter final score",
            &actor.id,
            Some(&before),
            Some(&grade),
            &ts,
        )?;

        let mut out = Outcome::new(grade);
        out.event_ids = event_ids;
        Ok(out)
    })
}

fn finalize_in(
    conn: &Connection,
    grade_id: &str,
    actor: &Actor,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> GradeResult<Outcome> {
    let grade = load(conn, grade_id)?;
    if grade.status == GradeStatus::Finalized && !grade.locks.final_locked {
        return reseal(conn, grade, actor, reason, now);
    }
    transition_one(conn, grade_id, actor, Transition::Finalize, reason, now)
}

// A FINALIZED record whose final lock was emergency-cleared is sealed again in place.
fn reseal(
    conn: &Connection,
    mut grade: GradeRecord,
    actor: &Actor,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> GradeResult<Outcome> {
    if !actor.is_admin() {
        return Err(GradeError::guard("lock final requires an administrator"));
    }
    if grade.final_score.is_none() {
        return Err(GradeError::guard("cannot finalize a grade without a final score"));
    }
    let ts = db::format_time(now);
    let before = grade.clone();
    grade.locks.final_locked = true;
    grade.finalized_at = Some(ts.clone());
    grade.finalized_by = Some(actor.id.clone());
    store(conn, &mut grade, &ts)?;
    let event_id = record_event(
        conn,
        &grade.id,
        GradeStatus::Finalized,
        GradeStatus::Finalized,
        EventKind::Override,
        actor,
        reason,
        &ts,
    )?;
    audit::append(
        conn,
        "grade",
        &grade.id,
        "reseal final",
        &actor.id,
        Some(&before),
        Some(&grade),
        &ts,
    )?;
    let mut out = Outcome::new(grade);
    out.event_ids.push(event_id);
    Ok(out)
}

pub fn finalize_lock(
    conn: &Connection,
    grade_id: &str,
    actor: &Actor,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> GradeResult<Outcome> {
    db::with_tx(conn, |tx| finalize_in(tx, grade_id, actor, reason, now))
}

/// Clears one field lock without moving the status. Logged as an override
/// event whose from and to states are equal.
pub fn emergency_unlock(
    conn: &Connection,
    grade_id: &str,
    actor: &Actor,
    field: GradeField,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> GradeResult<Outcome> {
    if !actor.is_admin() {
        return Err(GradeError::guard("emergency unlock requires an administrator"));
    }
    let reason = require_reason(reason, "unlock")?;
    db::with_tx(conn, |tx| {
        let ts = db::format_time(now);
        let mut grade = load(tx, grade_id)?;
        if !grade.locks.is_locked(field) {
            return Err(GradeError::guard(format!(
                "{} is not locked",
                field.as_str()
            )));
        }
        let before = grade.clone();
        grade.locks.set(field, false);
        store(tx, &mut grade, &ts)?;
        let event_id = record_event(
            tx,
            &grade.id,
            grade.status,
            grade.status,
            EventKind::Override,
            actor,
            Some(&format!("unlock {}: {}", field.as_str(), reason)),
            &ts,
        )?;
        audit::append(
            tx,
            "grade",
            &grade.id,
            "emergency unlock",
            &actor.id,
            Some(&before),
            Some(&grade),
            &ts,
        )?;
        tracing::warn!(grade_id, field = field.as_str(), actor = %actor.id, "emergency unlock");
        let mut out = Outcome::new(grade);
        out.event_ids.push(event_id);
        Ok(out)
    })
}

fn best_effort<F>(conn: &Connection, grade_ids: &[String], mut op: F) -> BestEffortReport
where
    F: FnMut(&Connection, &str) -> GradeResult<Outcome>,
{
    let mut report = BestEffortReport::default();
    for (index, id) in grade_ids.iter().enumerate() {
        match db::with_tx(conn, |tx| op(tx, id)) {
            Ok(o) => report.results.push(o),
            Err(error) => report.errors.push(RowError {
                index,
                key: id.clone(),
                error,
            }),
        }
    }
    if !report.errors.is_empty() {
        tracing::warn!(
            succeeded = report.results.len(),
            failed = report.errors.len(),
            "bulk operation finished with failures"
        );
    }
    report
}

/// PENDING_REVIEW -> APPROVED_TX_DK per record; failures do not stop the batch.
pub fn bulk_approve(
    conn: &Connection,
    grade_ids: &[String],
    actor: &Actor,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> BestEffortReport {
    best_effort(conn, grade_ids, |tx, id| {
        transition_one(tx, id, actor, Transition::Approve, reason, now)
    })
}

/// FINAL_ENTERED -> FINALIZED per record; failures do not stop the batch.
pub fn bulk_lock_final(
    conn: &Connection,
    grade_ids: &[String],
    actor: &Actor,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> BestEffortReport {
    best_effort(conn, grade_ids, |tx, id| finalize_in(tx, id, actor, reason, now))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRow {
    pub student_id: String,
    #[serde(default)]
    pub tx: Option<ScoreMap>,
    #[serde(default)]
    pub dk: Option<ScoreMap>,
    #[serde(default, rename = "final")]
    pub final_score: Option<f64>,
    #[serde(default)]
    pub attempt_number: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SheetScope {
    pub class_id: String,
    pub subject_id: String,
    pub cohort_id: String,
    pub semester_id: String,
}

fn validate_row(row: &ScoreRow) -> GradeResult<()> {
    if row.student_id.trim().is_empty() {
        return Err(GradeError::validation("studentId is required"));
    }
    if let Some(tx) = &row.tx {
        calc::validate_component_map("tx", tx)?;
    }
    if let Some(dk) = &row.dk {
        calc::validate_component_map("dk", dk)?;
    }
    if let Some(f) = row.final_score {
        calc::validate_score("final", f)?;
    }
    if let Some(a) = row.attempt_number {
        if a < 1 {
            return Err(GradeError::validation_with(
                "attemptNumber must be >= 1",
                json!({ "attemptNumber": a }),
            ));
        }
    }
    Ok(())
}

fn save_row(
    conn: &Connection,
    scope: &SheetScope,
    academic_year: &str,
    row: &ScoreRow,
    actor: &Actor,
    now: DateTime<Utc>,
) -> GradeResult<Outcome> {
    validate_row(row)?;
    roster::get_student(conn, &row.student_id)?;
    let ts = db::format_time(now);
    let attempt = row.attempt_number.unwrap_or(1);

    if !actor.is_admin()
        && !permissions::scope_allows(
            conn,
            &actor.id,
            &scope.class_id,
            &scope.subject_id,
            &scope.cohort_id,
            &scope.semester_id,
            now,
        )?
    {
        return Err(GradeError::guard(
            "class/subject/semester is outside the instructor's permission scope",
        ));
    }

    let key = EnrollmentKey {
        student_id: row.student_id.clone(),
        class_id: scope.class_id.clone(),
        subject_id: scope.subject_id.clone(),
        cohort_id: scope.cohort_id.clone(),
        attempt,
    };

    let pair = find_for_pair(conn, &row.student_id, &scope.subject_id)?;
    let (mut grade, created, before) = match pair {
        Some(g) if g.attempt_number > attempt => {
            return Err(GradeError::guard(format!(
                "grade is on attempt {}; a row for attempt {} cannot be saved",
                g.attempt_number, attempt
            )));
        }
        // A higher attempt on a pair that already has a grade is a retake.
        Some(g) if g.attempt_number < attempt => {
            let enrollment = roster::lookup_or_create_enrollment(conn, &key, &scope.semester_id, &ts)?;
            let place = Placement {
                enrollment: &enrollment,
                semester_id: &scope.semester_id,
                academic_year,
            };
            let scores = RetakeScores {
                tx: row.tx.clone().unwrap_or_default(),
                dk: row.dk.clone().unwrap_or_default(),
                final_score: row.final_score,
            };
            return retake::apply_retake(
                conn,
                g,
                &scores,
                Some(attempt),
                actor,
                Some(&place),
                now,
            );
        }
        // Retake already open: the sheet edits the pair's grade and takes it
        // onto this sheet.
        Some(mut g) if attempt >= 2 => {
            let before = g.clone();
            let enrollment = roster::lookup_or_create_enrollment(conn, &key, &scope.semester_id, &ts)?;
            Placement {
                enrollment: &enrollment,
                semester_id: &scope.semester_id,
                academic_year,
            }
            .apply(&mut g);
            (g, false, Some(before))
        }
        _ => {
            let enrollment = roster::lookup_or_create_enrollment(conn, &key, &scope.semester_id, &ts)?;
            match find_by_key(
                conn,
                &row.student_id,
                &enrollment.id,
                &scope.semester_id,
                academic_year,
            )? {
                Some(g) => {
                    let before = g.clone();
                    (g, false, Some(before))
                }
                None => {
                    let mut g = GradeRecord::blank(
                        &Uuid::new_v4().to_string(),
                        &row.student_id,
                        &enrollment.id,
                        &scope.subject_id,
                        &scope.semester_id,
                        academic_year,
                        &ts,
                    );
                    g.attempt_number = attempt;
                    insert(conn, &g)?;
                    (g, true, None)
                }
            }
        }
    };

    if let Some(tx) = &row.tx {
        if *tx != grade.tx_scores {
            lifecycle::ensure_can_edit(actor, &grade, GradeField::Tx)?;
            grade.tx_scores = tx.clone();
        }
    }
    if let Some(dk) = &row.dk {
        if *dk != grade.dk_scores {
            lifecycle::ensure_can_edit(actor, &grade, GradeField::Dk)?;
            grade.dk_scores = dk.clone();
        }
    }
    let final_supplied = row.final_score.is_some() && row.final_score != grade.final_score;
    if final_supplied {
        lifecycle::ensure_can_edit(actor, &grade, GradeField::Final)?;
        grade.final_score = row.final_score;
    }
    grade.recompute();
    if matches!(grade.status, GradeStatus::FinalEntered | GradeStatus::Finalized)
        && grade.final_score.is_none()
    {
        return Err(GradeError::guard(
            "scores would drop TBKT below the threshold and discard the entered final score",
        ));
    }

    let mut out_events = Vec::new();
    if final_supplied
        && grade.status == GradeStatus::ApprovedTxDk
        && grade.final_score.is_some()
    {
        let from = grade.status;
        let to = lifecycle::apply_transition(actor, &mut grade, Transition::EnterFinal, None)?;
        out_events.push((from, to));
    }

    store(conn, &mut grade, &ts)?;
    retake::sync_current(conn, &grade)?;
    let mut event_ids = Vec::new();
    for (from, to) in out_events {
        event_ids.push(record_event(
            conn,
            &grade.id,
            from,
            to,
            EventKind::Transition,
            actor,
            None,
            &ts,
        )?);
    }
    audit::append(
        conn,
        "grade",
        &grade.id,
        if created { "create" } else { "save scores" },
        &actor.id,
        before.as_ref(),
        Some(&grade),
        &ts,
    )?;

    let mut out = Outcome::new(grade);
    out.event_ids = event_ids;
    Ok(out)
}

/// Saves a whole score sheet for one class/subject/cohort/semester.
/// All rows commit together or none do.
pub fn bulk_save_scores(
    conn: &Connection,
    scope: &SheetScope,
    rows: &[ScoreRow],
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<Vec<Outcome>, BatchError> {
    let semester = roster::get_semester(conn, &scope.semester_id).map_err(BatchError::Store)?;
    roster::get_named(conn, roster::NamedTable::Class, &scope.class_id).map_err(BatchError::Store)?;
    roster::get_subject(conn, &scope.subject_id).map_err(BatchError::Store)?;
    roster::get_named(conn, roster::NamedTable::Cohort, &scope.cohort_id)
        .map_err(BatchError::Store)?;

    db::with_tx(conn, |tx| {
        let mut results = Vec::with_capacity(rows.len());
        let mut errors = Vec::new();
        for (index, row) in rows.iter().enumerate() {
            match save_row(tx, scope, &semester.academic_year, row, actor, now) {
                Ok(o) => results.push(o),
                Err(error) => errors.push(RowError {
                    index,
                    key: row.student_id.clone(),
                    error,
                }),
            }
        }
        if errors.is_empty() {
            tracing::info!(rows = results.len(), subject_id = %scope.subject_id, "score sheet saved");
            Ok(results)
        } else {
            tracing::warn!(failed = errors.len(), total = rows.len(), "score sheet rejected");
            Err(BatchError::Rejected {
                total: rows.len(),
                errors,
            })
        }
    })
}
