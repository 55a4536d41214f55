//! Permission scope resolution for instructors.
//!
//! A grant scopes an instructor to one semester and, optionally, to a single
//! class, subject and cohort. A `None` dimension matches every value. The
//! scope of an instructor is the union of all grants that are `active` and
//! whose validity window contains the resolution time. The window is checked
//! live even though [`expire_grants`] also flips stale grants to `expired`.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db;
use crate::error::{GradeError, GradeResult};
use crate::roster::{self, Enrollment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantStatus {
    Active,
    Expired,
    Revoked,
}

impl GrantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionGrant {
    pub id: String,
    pub grantee_id: String,
    pub class_id: Option<String>,
    pub subject_id: Option<String>,
    pub cohort_id: Option<String>,
    pub semester_id: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub status: GrantStatus,
}

impl PermissionGrant {
    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && now <= self.valid_to
    }

    pub fn clause(&self) -> ScopeClause {
        ScopeClause {
            semester_id: self.semester_id.clone(),
            class_id: self.class_id.clone(),
            subject_id: self.subject_id.clone(),
            cohort_id: self.cohort_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGrant {
    pub grantee_id: String,
    #[serde(default)]
    pub class_id: Option<String>,
    #[serde(default)]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub cohort_id: Option<String>,
    pub semester_id: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
}

/// One grant reduced to its match condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeClause {
    pub semester_id: String,
    pub class_id: Option<String>,
    pub subject_id: Option<String>,
    pub cohort_id: Option<String>,
}

impl ScopeClause {
    pub fn matches(&self, class_id: &str, subject_id: &str, cohort_id: &str, semester_id: &str) -> bool {
        fn dim(want: &Option<String>, got: &str) -> bool {
            want.as_deref().map(|w| w == got).unwrap_or(true)
        }
        self.semester_id == semester_id
            && dim(&self.class_id, class_id)
            && dim(&self.subject_id, subject_id)
            && dim(&self.cohort_id, cohort_id)
    }

    fn push_sql(&self, sql: &mut String, binds: &mut Vec<Value>) {
        sql.push_str("(semester_id = ?");
        binds.push(Value::Text(self.semester_id.clone()));
        for (col, v) in [
            ("class_id", &self.class_id),
            ("subject_id", &self.subject_id),
            ("cohort_id", &self.cohort_id),
        ] {
            if let Some(v) = v {
                sql.push_str(" AND ");
                sql.push_str(col);
                sql.push_str(" = ?");
                binds.push(Value::Text(v.clone()));
            }
        }
        sql.push(')');
    }
}

fn parse_db_time(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

const GRANT_COLUMNS: &str =
    "id, grantee_id, class_id, subject_id, cohort_id, semester_id, valid_from, valid_to, status";

fn grant_from_row(row: &Row<'_>) -> rusqlite::Result<PermissionGrant> {
    let status: String = row.get(8)?;
    Ok(PermissionGrant {
        id: row.get(0)?,
        grantee_id: row.get(1)?,
        class_id: row.get(2)?,
        subject_id: row.get(3)?,
        cohort_id: row.get(4)?,
        semester_id: row.get(5)?,
        valid_from: parse_db_time(&row.get::<_, String>(6)?)?,
        valid_to: parse_db_time(&row.get::<_, String>(7)?)?,
        // Unknown statuses never grant anything.
        status: GrantStatus::parse(&status).unwrap_or(GrantStatus::Revoked),
    })
}

pub fn create_grant(conn: &Connection, g: &NewGrant, now: DateTime<Utc>) -> GradeResult<PermissionGrant> {
    if g.grantee_id.trim().is_empty() {
        return Err(GradeError::validation("granteeId must not be empty"));
    }
    if g.valid_to <= g.valid_from {
        return Err(GradeError::validation("validTo must be after validFrom"));
    }
    roster::get_semester(conn, &g.semester_id)?;
    if let Some(c) = &g.class_id {
        roster::get_named(conn, roster::NamedTable::Class, c)?;
    }
    if let Some(s) = &g.subject_id {
        roster::get_subject(conn, s)?;
    }
    if let Some(c) = &g.cohort_id {
        roster::get_named(conn, roster::NamedTable::Cohort, c)?;
    }

    let grant = PermissionGrant {
        id: Uuid::new_v4().to_string(),
        grantee_id: g.grantee_id.trim().to_string(),
        class_id: g.class_id.clone(),
        subject_id: g.subject_id.clone(),
        cohort_id: g.cohort_id.clone(),
        semester_id: g.semester_id.clone(),
        valid_from: g.valid_from,
        valid_to: g.valid_to,
        status: GrantStatus::Active,
    };
    conn.execute(
        "INSERT INTO permission_grants(id, grantee_id, class_id, subject_id, cohort_id, semester_id, valid_from, valid_to, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &grant.id,
            &grant.grantee_id,
            &grant.class_id,
            &grant.subject_id,
            &grant.cohort_id,
            &grant.semester_id,
            db::format_time(grant.valid_from),
            db::format_time(grant.valid_to),
            grant.status.as_str(),
            db::format_time(now),
        ),
    )?;
    Ok(grant)
}

pub fn get_grant(conn: &Connection, id: &str) -> GradeResult<PermissionGrant> {
    let sql = format!("SELECT {} FROM permission_grants WHERE id = ?", GRANT_COLUMNS);
    conn.query_row(&sql, [id], grant_from_row)
        .optional()?
        .ok_or_else(|| GradeError::not_found("permission grant", id))
}

pub fn revoke_grant(conn: &Connection, id: &str, now: DateTime<Utc>) -> GradeResult<PermissionGrant> {
    let grant = get_grant(conn, id)?;
    if grant.status == GrantStatus::Revoked {
        return Err(GradeError::guard("grant is already revoked"));
    }
    conn.execute(
        "UPDATE permission_grants SET status = 'revoked', revoked_at = ? WHERE id = ?",
        (db::format_time(now), id),
    )?;
    get_grant(conn, id)
}

pub fn list_grants(conn: &Connection, grantee_id: &str) -> GradeResult<Vec<PermissionGrant>> {
    let sql = format!(
        "SELECT {} FROM permission_grants WHERE grantee_id = ? ORDER BY valid_from, id",
        GRANT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([grantee_id], grant_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Grants that apply right now: status active and `now` inside the window.
pub fn effective_grants(
    conn: &Connection,
    grantee_id: &str,
    now: DateTime<Utc>,
) -> GradeResult<Vec<PermissionGrant>> {
    Ok(list_grants(conn, grantee_id)?
        .into_iter()
        .filter(|g| g.status == GrantStatus::Active && g.in_window(now))
        .collect())
}

pub fn clauses_for(conn: &Connection, grantee_id: &str, now: DateTime<Utc>) -> GradeResult<Vec<ScopeClause>> {
    let mut out: Vec<ScopeClause> = Vec::new();
    for g in effective_grants(conn, grantee_id, now)? {
        let c = g.clause();
        if !out.contains(&c) {
            out.push(c);
        }
    }
    Ok(out)
}

/// Whether any effective grant covers the tuple. Used before an enrollment exists.
pub fn scope_allows(
    conn: &Connection,
    grantee_id: &str,
    class_id: &str,
    subject_id: &str,
    cohort_id: &str,
    semester_id: &str,
    now: DateTime<Utc>,
) -> GradeResult<bool> {
    Ok(clauses_for(conn, grantee_id, now)?
        .iter()
        .any(|c| c.matches(class_id, subject_id, cohort_id, semester_id)))
}

pub fn enrollment_in_scope(
    conn: &Connection,
    grantee_id: &str,
    enrollment: &Enrollment,
    now: DateTime<Utc>,
) -> GradeResult<bool> {
    if !enrollment.active {
        return Ok(false);
    }
    scope_allows(
        conn,
        grantee_id,
        &enrollment.class_id,
        &enrollment.subject_id,
        &enrollment.cohort_id,
        &enrollment.semester_id,
        now,
    )
}

/// All active enrollments the grantee may act on.
pub fn resolve_enrollments(
    conn: &Connection,
    grantee_id: &str,
    now: DateTime<Utc>,
) -> GradeResult<Vec<Enrollment>> {
    let clauses = clauses_for(conn, grantee_id, now)?;
    if clauses.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT id, student_id, class_id, subject_id, cohort_id, semester_id, attempt, active
         FROM enrollments WHERE active = 1 AND (",
    );
    let mut binds: Vec<Value> = Vec::new();
    for (i, c) in clauses.iter().enumerate() {
        if i > 0 {
            sql.push_str(" OR ");
        }
        c.push_sql(&mut sql, &mut binds);
    }
    sql.push_str(") ORDER BY semester_id, class_id, subject_id, student_id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(Enrollment {
                id: r.get(0)?,
                student_id: r.get(1)?,
                class_id: r.get(2)?,
                subject_id: r.get(3)?,
                cohort_id: r.get(4)?,
                semester_id: r.get(5)?,
                attempt: r.get(6)?,
                active: r.get::<_, i64>(7)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Periodic sweep: marks active grants whose window has closed as expired.
pub fn expire_grants(conn: &Connection, now: DateTime<Utc>) -> GradeResult<usize> {
    let n = conn.execute(
        "UPDATE permission_grants SET status = 'expired' WHERE status = 'active' AND valid_to < ?",
        [db::format_time(now)],
    )?;
    if n > 0 {
        tracing::info!(expired = n, "permission grants expired");
    }
    Ok(n)
}
