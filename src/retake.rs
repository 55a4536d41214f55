//! Retake ledger: the chronological chain of attempts per (student, subject).
//!
//! The grade record always mirrors the newest attempt. The ledger keeps every
//! attempt, plus one baseline row holding the scores the student had before
//! the first retake. Every row is numbered 2 or above; a baseline records the
//! attempt it captured in `source_attempt`. At most one row per pair is
//! current; [`promote_attempt`] is the only code path that moves that flag.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit;
use crate::calc::{self, ScoreMap};
use crate::db;
use crate::error::{GradeError, GradeResult};
use crate::grades::{self, EventKind, GradeRecord, Outcome};
use crate::lifecycle::{Actor, GradeStatus, Locks};
use crate::roster::{self, Enrollment, EnrollmentKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptKind {
    ExamRetake,
    CourseRetake,
}

impl AttemptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExamRetake => "EXAM_RETAKE",
            Self::CourseRetake => "COURSE_RETAKE",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "EXAM_RETAKE" => Some(Self::ExamRetake),
            "COURSE_RETAKE" => Some(Self::CourseRetake),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptResult {
    Pass,
    FailExam,
    FailTbkt,
    Pending,
}

impl AttemptResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::FailExam => "FAIL_EXAM",
            Self::FailTbkt => "FAIL_TBKT",
            Self::Pending => "PENDING",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "PASS" => Some(Self::Pass),
            "FAIL_EXAM" => Some(Self::FailExam),
            "FAIL_TBKT" => Some(Self::FailTbkt),
            "PENDING" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// Outcome of one attempt's scores.
///
/// A passing TBKT without a final exam yet is still pending, as is an attempt
/// with no TBKT at all.
pub fn result_status(tbkt: Option<f64>, final_score: Option<f64>, tbmh: Option<f64>) -> AttemptResult {
    if matches!(tbmh, Some(v) if v >= calc::PASS_THRESHOLD) {
        return AttemptResult::Pass;
    }
    match tbkt {
        Some(t) if t >= calc::PASS_THRESHOLD => {
            if final_score.is_none() {
                AttemptResult::Pending
            } else {
                AttemptResult::FailExam
            }
        }
        Some(_) => AttemptResult::FailTbkt,
        None => AttemptResult::Pending,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub id: String,
    pub grade_id: String,
    pub student_id: String,
    pub subject_id: String,
    pub kind: AttemptKind,
    pub attempt_number: i64,
    pub tx_scores: ScoreMap,
    pub dk_scores: ScoreMap,
    pub final_score: Option<f64>,
    pub tbkt_score: Option<f64>,
    pub tbmh_score: Option<f64>,
    pub result_status: AttemptResult,
    pub is_current: bool,
    pub is_baseline: bool,
    /// Grade attempt a baseline row was taken from.
    pub source_attempt: Option<i64>,
    pub created_at: String,
    pub created_by: String,
}

impl AttemptRecord {
    fn rescore(&mut self, tbkt: Option<f64>, final_score: Option<f64>) {
        let c = calc::derive_with_tbkt(tbkt, final_score);
        self.final_score = c.final_score;
        self.tbkt_score = c.tbkt;
        self.tbmh_score = c.tbmh;
        self.result_status = result_status(c.tbkt, c.final_score, c.tbmh);
    }
}

/// Scores submitted for a retake. Exam retakes only read `final`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetakeScores {
    #[serde(default)]
    pub tx: ScoreMap,
    #[serde(default)]
    pub dk: ScoreMap,
    #[serde(default, rename = "final")]
    pub final_score: Option<f64>,
}

impl RetakeScores {
    fn validate(&self) -> GradeResult<()> {
        calc::validate_component_map("tx", &self.tx)?;
        calc::validate_component_map("dk", &self.dk)?;
        if let Some(f) = self.final_score {
            calc::validate_score("final", f)?;
        }
        Ok(())
    }
}

const ATTEMPT_COLUMNS: &str = "id, grade_id, student_id, subject_id, kind, attempt_number,
    tx_scores, dk_scores, final_score, tbkt_score, tbmh_score, result_status,
    is_current, is_baseline, source_attempt, created_at, created_by";

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<AttemptRecord> {
    let kind: String = row.get(4)?;
    let result: String = row.get(11)?;
    let bad = |idx: usize, v: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value {v}").into(),
        )
    };
    Ok(AttemptRecord {
        id: row.get(0)?,
        grade_id: row.get(1)?,
        student_id: row.get(2)?,
        subject_id: row.get(3)?,
        kind: AttemptKind::parse(&kind).ok_or_else(|| bad(4, kind.clone()))?,
        attempt_number: row.get(5)?,
        tx_scores: grades::score_map_col(row, 6)?,
        dk_scores: grades::score_map_col(row, 7)?,
        final_score: row.get(8)?,
        tbkt_score: row.get(9)?,
        tbmh_score: row.get(10)?,
        result_status: AttemptResult::parse(&result).ok_or_else(|| bad(11, result.clone()))?,
        is_current: row.get::<_, i64>(12)? != 0,
        is_baseline: row.get::<_, i64>(13)? != 0,
        source_attempt: row.get(14)?,
        created_at: row.get(15)?,
        created_by: row.get(16)?,
    })
}

/// Full chain for a pair, oldest first. The baseline row sorts first.
pub fn list_attempts(conn: &Connection, student_id: &str, subject_id: &str) -> GradeResult<Vec<AttemptRecord>> {
    let sql = format!(
        "SELECT {} FROM grade_attempts WHERE student_id = ? AND subject_id = ?
         ORDER BY attempt_number, is_baseline DESC, created_at, rowid",
        ATTEMPT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((student_id, subject_id), attempt_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn current_attempt(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
) -> GradeResult<Option<AttemptRecord>> {
    let sql = format!(
        "SELECT {} FROM grade_attempts WHERE student_id = ? AND subject_id = ? AND is_current = 1",
        ATTEMPT_COLUMNS
    );
    Ok(conn
        .query_row(&sql, (student_id, subject_id), attempt_from_row)
        .optional()?)
}

fn retake_count(conn: &Connection, student_id: &str, subject_id: &str) -> GradeResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM grade_attempts WHERE student_id = ? AND subject_id = ? AND is_baseline = 0",
        (student_id, subject_id),
        |r| r.get(0),
    )?)
}

fn insert_attempt(conn: &Connection, a: &AttemptRecord) -> GradeResult<()> {
    if a.attempt_number < 2 {
        return Err(GradeError::validation_with(
            "retake attempts are numbered from 2",
            serde_json::json!({ "attemptNumber": a.attempt_number }),
        ));
    }
    conn.execute(
        "INSERT INTO grade_attempts(id, grade_id, student_id, subject_id, kind, attempt_number,
            tx_scores, dk_scores, final_score, tbkt_score, tbmh_score, result_status,
            is_current, is_baseline, source_attempt, created_at, created_by)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
        rusqlite::params![
            &a.id,
            &a.grade_id,
            &a.student_id,
            &a.subject_id,
            a.kind.as_str(),
            a.attempt_number,
            serde_json::to_string(&a.tx_scores)?,
            serde_json::to_string(&a.dk_scores)?,
            a.final_score,
            a.tbkt_score,
            a.tbmh_score,
            a.result_status.as_str(),
            a.is_baseline as i64,
            a.source_attempt,
            &a.created_at,
            &a.created_by,
        ],
    )?;
    Ok(())
}

fn update_scores(conn: &Connection, a: &AttemptRecord) -> GradeResult<()> {
    conn.execute(
        "UPDATE grade_attempts SET tx_scores = ?, dk_scores = ?, final_score = ?, tbkt_score = ?,
            tbmh_score = ?, result_status = ?
         WHERE id = ?",
        rusqlite::params![
            serde_json::to_string(&a.tx_scores)?,
            serde_json::to_string(&a.dk_scores)?,
            a.final_score,
            a.tbkt_score,
            a.tbmh_score,
            a.result_status.as_str(),
            &a.id,
        ],
    )?;
    Ok(())
}

/// Makes `new_attempt_id` the only current attempt of the pair.
///
/// Must run inside the caller's transaction; the old flag is cleared before
/// the new one is set so the partial unique index never sees two.
pub fn promote_attempt(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    new_attempt_id: &str,
) -> GradeResult<()> {
    conn.execute(
        "UPDATE grade_attempts SET is_current = 0
         WHERE student_id = ? AND subject_id = ? AND is_current = 1 AND id <> ?",
        (student_id, subject_id, new_attempt_id),
    )?;
    let n = conn.execute(
        "UPDATE grade_attempts SET is_current = 1
         WHERE id = ? AND student_id = ? AND subject_id = ? AND is_baseline = 0",
        (new_attempt_id, student_id, subject_id),
    )?;
    if n == 0 {
        return Err(GradeError::not_found("attempt", new_attempt_id));
    }
    Ok(())
}

#[derive(Debug)]
enum Plan {
    CompleteInPlace(AttemptRecord),
    New {
        kind: AttemptKind,
        attempt_number: i64,
        with_baseline: bool,
    },
}

fn next_number(previous: i64, supplied: Option<i64>) -> i64 {
    (previous + 1).max(supplied.unwrap_or(2).max(2))
}

fn plan(grade: &GradeRecord, current: Option<AttemptRecord>, retakes: i64, supplied: Option<i64>) -> GradeResult<Plan> {
    let Some(current) = current else {
        if retakes > 0 {
            return Err(GradeError::guard(
                "attempt ledger has no current attempt for this student and subject",
            ));
        }
        let kind = match result_status(grade.tbkt_score, grade.final_score, grade.tbmh_score) {
            AttemptResult::Pass => {
                return Err(GradeError::guard("student already passed this subject"))
            }
            AttemptResult::Pending => {
                return Err(GradeError::guard(
                    "original attempt is not complete; nothing to retake yet",
                ))
            }
            AttemptResult::FailExam => AttemptKind::ExamRetake,
            AttemptResult::FailTbkt => AttemptKind::CourseRetake,
        };
        return Ok(Plan::New {
            kind,
            attempt_number: next_number(1, supplied),
            with_baseline: true,
        });
    };

    let kind = match (current.result_status, current.kind) {
        (AttemptResult::Pass, _) => {
            return Err(GradeError::guard("student already passed this subject"))
        }
        (AttemptResult::Pending, _) => return Ok(Plan::CompleteInPlace(current)),
        (AttemptResult::FailExam, AttemptKind::CourseRetake) => AttemptKind::ExamRetake,
        (AttemptResult::FailExam, AttemptKind::ExamRetake) | (AttemptResult::FailTbkt, _) => {
            AttemptKind::CourseRetake
        }
    };
    Ok(Plan::New {
        kind,
        attempt_number: next_number(current.attempt_number, supplied),
        with_baseline: false,
    })
}

/// Carries TX/DK/TBKT forward for exam retakes; course retakes take the submitted sets.
fn scored_attempt(
    kind: AttemptKind,
    source_tx: &ScoreMap,
    source_dk: &ScoreMap,
    source_tbkt: Option<f64>,
    scores: &RetakeScores,
) -> (ScoreMap, ScoreMap, Option<f64>) {
    match kind {
        AttemptKind::ExamRetake => (source_tx.clone(), source_dk.clone(), source_tbkt),
        AttemptKind::CourseRetake => (
            scores.tx.clone(),
            scores.dk.clone(),
            calc::compute_tbkt(&scores.tx, &scores.dk),
        ),
    }
}

/// Points the grade at `attempt` and restarts its lifecycle for that attempt.
fn mirror_into_grade(grade: &mut GradeRecord, attempt: &AttemptRecord) {
    grade.tx_scores = attempt.tx_scores.clone();
    grade.dk_scores = attempt.dk_scores.clone();
    let c = calc::derive_with_tbkt(attempt.tbkt_score, attempt.final_score);
    grade.final_score = c.final_score;
    grade.tbkt_score = c.tbkt;
    grade.tbmh_score = c.tbmh;
    grade.classification = c.classification;
    grade.passed = c.passed;
    grade.attempt_number = attempt.attempt_number;
    grade.finalized_at = None;
    grade.finalized_by = None;

    match attempt.kind {
        AttemptKind::CourseRetake => {
            grade.status = GradeStatus::Draft;
            grade.locks = Locks::default();
            grade.submitted_at = None;
            grade.submitted_by = None;
            grade.approved_at = None;
            grade.approved_by = None;
        }
        AttemptKind::ExamRetake => {
            grade.status = if grade.final_score.is_some() {
                GradeStatus::FinalEntered
            } else {
                GradeStatus::ApprovedTxDk
            };
            grade.locks = Locks {
                tx_locked: true,
                dk_locked: true,
                final_locked: false,
            };
        }
    }
}

/// Enrollment for `attempt` in the same class, subject and cohort as the grade's
/// current one. New enrollments open in the grade's semester.
fn attempt_enrollment(
    conn: &Connection,
    grade: &GradeRecord,
    attempt: i64,
    now: &str,
) -> GradeResult<Enrollment> {
    let current = roster::get_enrollment(conn, &grade.enrollment_id)?;
    if current.attempt == attempt {
        return Ok(current);
    }
    let key = EnrollmentKey {
        student_id: grade.student_id.clone(),
        class_id: current.class_id,
        subject_id: grade.subject_id.clone(),
        cohort_id: current.cohort_id,
        attempt,
    };
    roster::lookup_or_create_enrollment(conn, &key, &grade.semester_id, now)
}

/// Where a score-sheet retake puts the pair's grade.
pub(crate) struct Placement<'a> {
    pub enrollment: &'a Enrollment,
    pub semester_id: &'a str,
    pub academic_year: &'a str,
}

impl Placement<'_> {
    pub(crate) fn apply(&self, grade: &mut GradeRecord) {
        grade.enrollment_id = self.enrollment.id.clone();
        grade.semester_id = self.semester_id.to_string();
        grade.academic_year = self.academic_year.to_string();
    }
}

/// Applies one retake submission to `grade`. Runs inside the caller's transaction.
///
/// The grade always ends up on the enrollment of the attempt it now mirrors.
/// `retarget` places it on the retake sheet; without it the grade keeps its
/// class, cohort and semester.
pub(crate) fn apply_retake(
    conn: &Connection,
    mut grade: GradeRecord,
    scores: &RetakeScores,
    supplied_attempt: Option<i64>,
    actor: &Actor,
    retarget: Option<&Placement<'_>>,
    now: DateTime<Utc>,
) -> GradeResult<Outcome> {
    if !actor.is_admin() {
        return Err(GradeError::guard("recording a retake requires an administrator"));
    }
    scores.validate()?;
    let ts = db::format_time(now);
    let before = grade.clone();
    let current = current_attempt(conn, &grade.student_id, &grade.subject_id)?;
    let retakes = retake_count(conn, &grade.student_id, &grade.subject_id)?;

    let mut attempt_ids = Vec::new();
    let attempt = match plan(&grade, current.clone(), retakes, supplied_attempt)? {
        Plan::CompleteInPlace(mut a) => {
            if a.kind == AttemptKind::CourseRetake && !scores.tx.is_empty() {
                a.tx_scores = scores.tx.clone();
            }
            if a.kind == AttemptKind::CourseRetake && !scores.dk.is_empty() {
                a.dk_scores = scores.dk.clone();
            }
            let tbkt = match a.kind {
                AttemptKind::CourseRetake => calc::compute_tbkt(&a.tx_scores, &a.dk_scores),
                AttemptKind::ExamRetake => a.tbkt_score,
            };
            a.rescore(tbkt, scores.final_score.or(a.final_score));
            update_scores(conn, &a)?;
            attempt_ids.push(a.id.clone());
            a
        }
        Plan::New {
            kind,
            attempt_number,
            with_baseline,
        } => {
            if with_baseline {
                let baseline = AttemptRecord {
                    id: Uuid::new_v4().to_string(),
                    grade_id: grade.id.clone(),
                    student_id: grade.student_id.clone(),
                    subject_id: grade.subject_id.clone(),
                    kind,
                    attempt_number: grade.attempt_number.max(2),
                    tx_scores: grade.tx_scores.clone(),
                    dk_scores: grade.dk_scores.clone(),
                    final_score: grade.final_score,
                    tbkt_score: grade.tbkt_score,
                    tbmh_score: grade.tbmh_score,
                    result_status: result_status(grade.tbkt_score, grade.final_score, grade.tbmh_score),
                    is_current: false,
                    is_baseline: true,
                    source_attempt: Some(grade.attempt_number),
                    created_at: ts.clone(),
                    created_by: actor.id.clone(),
                };
                insert_attempt(conn, &baseline)?;
                attempt_ids.push(baseline.id);
            }

            let (tx, dk, tbkt) = match &current {
                Some(c) => scored_attempt(kind, &c.tx_scores, &c.dk_scores, c.tbkt_score, scores),
                None => scored_attempt(kind, &grade.tx_scores, &grade.dk_scores, grade.tbkt_score, scores),
            };
            let mut a = AttemptRecord {
                id: Uuid::new_v4().to_string(),
                grade_id: grade.id.clone(),
                student_id: grade.student_id.clone(),
                subject_id: grade.subject_id.clone(),
                kind,
                attempt_number,
                tx_scores: tx,
                dk_scores: dk,
                final_score: None,
                tbkt_score: None,
                tbmh_score: None,
                result_status: AttemptResult::Pending,
                is_current: false,
                is_baseline: false,
                source_attempt: None,
                created_at: ts.clone(),
                created_by: actor.id.clone(),
            };
            a.rescore(tbkt, scores.final_score);
            insert_attempt(conn, &a)?;
            promote_attempt(conn, &a.student_id, &a.subject_id, &a.id)?;
            a.is_current = true;
            attempt_ids.push(a.id.clone());
            a
        }
    };

    match retarget {
        Some(place) => place.apply(&mut grade),
        None => {
            let enrollment = attempt_enrollment(conn, &grade, attempt.attempt_number, &ts)?;
            grade.enrollment_id = enrollment.id;
        }
    }
    let from = grade.status;
    mirror_into_grade(&mut grade, &attempt);
    grades::store(conn, &mut grade, &ts)?;

    let reason = format!(
        "retake attempt {} ({})",
        attempt.attempt_number,
        attempt.kind.as_str()
    );
    let event_id = grades::record_event(
        conn,
        &grade.id,
        from,
        grade.status,
        EventKind::Transition,
        actor,
        Some(&reason),
        &ts,
    )?;
    audit::append(
        conn,
        "grade_attempt",
        &attempt.id,
        "record retake",
        &actor.id,
        current.as_ref(),
        Some(&attempt),
        &ts,
    )?;
    audit::append(
        conn,
        "grade",
        &grade.id,
        "record retake",
        &actor.id,
        Some(&before),
        Some(&grade),
        &ts,
    )?;
    tracing::info!(
        grade_id = %grade.id,
        attempt = attempt.attempt_number,
        kind = attempt.kind.as_str(),
        result = attempt.result_status.as_str(),
        "retake recorded"
    );

    let mut out = Outcome::new(grade);
    out.event_ids.push(event_id);
    out.attempt_ids = attempt_ids;
    Ok(out)
}

/// Records a retake for the pair's latest grade, in one transaction.
pub fn record_retake(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    scores: &RetakeScores,
    attempt_number: Option<i64>,
    actor: &Actor,
    now: DateTime<Utc>,
) -> GradeResult<Outcome> {
    if !actor.is_admin() {
        return Err(GradeError::guard("recording a retake requires an administrator"));
    }
    scores.validate()?;
    db::with_tx(conn, |tx| {
        roster::get_student(tx, student_id)?;
        roster::get_subject(tx, subject_id)?;
        let grade = grades::find_for_pair(tx, student_id, subject_id)?
            .ok_or_else(|| GradeError::not_found("grade", format!("{student_id}/{subject_id}")))?;
        apply_retake(tx, grade, scores, attempt_number, actor, None, now)
    })
}

/// Keeps the current attempt's snapshot in line after ordinary edits to its grade.
pub(crate) fn sync_current(conn: &Connection, grade: &GradeRecord) -> GradeResult<()> {
    let Some(mut a) = current_attempt(conn, &grade.student_id, &grade.subject_id)? else {
        return Ok(());
    };
    if a.grade_id != grade.id || a.attempt_number != grade.attempt_number {
        return Ok(());
    }
    a.tx_scores = grade.tx_scores.clone();
    a.dk_scores = grade.dk_scores.clone();
    a.rescore(grade.tbkt_score, grade.final_score);
    update_scores(conn, &a)
}
