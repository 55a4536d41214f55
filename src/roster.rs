use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{GradeError, GradeResult};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub code: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedEntity {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Semester {
    pub id: String,
    pub name: String,
    pub academic_year: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentKey {
    pub student_id: String,
    pub class_id: String,
    pub subject_id: String,
    pub cohort_id: String,
    pub attempt: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub subject_id: String,
    pub cohort_id: String,
    pub semester_id: String,
    pub attempt: i64,
    pub active: bool,
}

const ENROLLMENT_COLUMNS: &str =
    "id, student_id, class_id, subject_id, cohort_id, semester_id, attempt, active";

fn enrollment_from_row(row: &Row<'_>) -> rusqlite::Result<Enrollment> {
    Ok(Enrollment {
        id: row.get(0)?,
        student_id: row.get(1)?,
        class_id: row.get(2)?,
        subject_id: row.get(3)?,
        cohort_id: row.get(4)?,
        semester_id: row.get(5)?,
        attempt: row.get(6)?,
        active: row.get::<_, i64>(7)? != 0,
    })
}

fn require_name(field: &str, value: &str) -> GradeResult<String> {
    let v = value.trim();
    if v.is_empty() {
        return Err(GradeError::validation(format!("{} must not be empty", field)));
    }
    Ok(v.to_string())
}

pub fn create_student(conn: &Connection, code: &str, full_name: &str) -> GradeResult<Student> {
    let s = Student {
        id: Uuid::new_v4().to_string(),
        code: require_name("code", code)?,
        full_name: require_name("fullName", full_name)?,
    };
    conn.execute(
        "INSERT INTO students(id, code, full_name) VALUES(?, ?, ?)",
        (&s.id, &s.code, &s.full_name),
    )?;
    Ok(s)
}

pub fn get_student(conn: &Connection, id: &str) -> GradeResult<Student> {
    conn.query_row(
        "SELECT id, code, full_name FROM students WHERE id = ?",
        [id],
        |r| {
            Ok(Student {
                id: r.get(0)?,
                code: r.get(1)?,
                full_name: r.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| GradeError::not_found("student", id))
}

pub fn list_students(conn: &Connection) -> GradeResult<Vec<Student>> {
    let mut stmt = conn.prepare("SELECT id, code, full_name FROM students ORDER BY code")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Student {
                id: r.get(0)?,
                code: r.get(1)?,
                full_name: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn create_subject(conn: &Connection, code: &str, name: &str) -> GradeResult<Subject> {
    let s = Subject {
        id: Uuid::new_v4().to_string(),
        code: require_name("code", code)?,
        name: require_name("name", name)?,
    };
    conn.execute(
        "INSERT INTO subjects(id, code, name) VALUES(?, ?, ?)",
        (&s.id, &s.code, &s.name),
    )?;
    Ok(s)
}

pub fn get_subject(conn: &Connection, id: &str) -> GradeResult<Subject> {
    conn.query_row(
        "SELECT id, code, name FROM subjects WHERE id = ?",
        [id],
        |r| {
            Ok(Subject {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| GradeError::not_found("subject", id))
}

pub fn list_subjects(conn: &Connection) -> GradeResult<Vec<Subject>> {
    let mut stmt = conn.prepare("SELECT id, code, name FROM subjects ORDER BY code")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Subject {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Classes and cohorts share the same (id, name) shape.
#[derive(Debug, Clone, Copy)]
pub enum NamedTable {
    Class,
    Cohort,
}

impl NamedTable {
    fn table(self) -> &'static str {
        match self {
            Self::Class => "classes",
            Self::Cohort => "cohorts",
        }
    }

    fn entity(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Cohort => "cohort",
        }
    }
}

pub fn create_named(conn: &Connection, kind: NamedTable, name: &str) -> GradeResult<NamedEntity> {
    let e = NamedEntity {
        id: Uuid::new_v4().to_string(),
        name: require_name("name", name)?,
    };
    let sql = format!("INSERT INTO {}(id, name) VALUES(?, ?)", kind.table());
    conn.execute(&sql, (&e.id, &e.name))?;
    Ok(e)
}

pub fn get_named(conn: &Connection, kind: NamedTable, id: &str) -> GradeResult<NamedEntity> {
    let sql = format!("SELECT id, name FROM {} WHERE id = ?", kind.table());
    conn.query_row(&sql, [id], |r| {
        Ok(NamedEntity {
            id: r.get(0)?,
            name: r.get(1)?,
        })
    })
    .optional()?
    .ok_or_else(|| GradeError::not_found(kind.entity(), id))
}

pub fn list_named(conn: &Connection, kind: NamedTable) -> GradeResult<Vec<NamedEntity>> {
    let sql = format!("SELECT id, name FROM {} ORDER BY name", kind.table());
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(NamedEntity {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn create_semester(conn: &Connection, name: &str, academic_year: &str) -> GradeResult<Semester> {
    let s = Semester {
        id: Uuid::new_v4().to_string(),
        name: require_name("name", name)?,
        academic_year: require_name("academicYear", academic_year)?,
    };
    conn.execute(
        "INSERT INTO semesters(id, name, academic_year) VALUES(?, ?, ?)",
        (&s.id, &s.name, &s.academic_year),
    )?;
    Ok(s)
}

pub fn get_semester(conn: &Connection, id: &str) -> GradeResult<Semester> {
    conn.query_row(
        "SELECT id, name, academic_year FROM semesters WHERE id = ?",
        [id],
        |r| {
            Ok(Semester {
                id: r.get(0)?,
                name: r.get(1)?,
                academic_year: r.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| GradeError::not_found("semester", id))
}

pub fn list_semesters(conn: &Connection) -> GradeResult<Vec<Semester>> {
    let mut stmt =
        conn.prepare("SELECT id, name, academic_year FROM semesters ORDER BY academic_year, name")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Semester {
                id: r.get(0)?,
                name: r.get(1)?,
                academic_year: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_enrollment(conn: &Connection, id: &str) -> GradeResult<Enrollment> {
    let sql = format!("SELECT {} FROM enrollments WHERE id = ?", ENROLLMENT_COLUMNS);
    conn.query_row(&sql, [id], enrollment_from_row)
        .optional()?
        .ok_or_else(|| GradeError::not_found("enrollment", id))
}

/// Finds the enrollment for `key`, creating it in `semester_id` when absent.
/// The referenced student, class, subject and cohort must exist.
pub fn lookup_or_create_enrollment(
    conn: &Connection,
    key: &EnrollmentKey,
    semester_id: &str,
    now: &str,
) -> GradeResult<Enrollment> {
    let sql = format!(
        "SELECT {} FROM enrollments
         WHERE student_id = ? AND class_id = ? AND subject_id = ? AND cohort_id = ? AND attempt = ?",
        ENROLLMENT_COLUMNS
    );
    let existing = conn
        .query_row(
            &sql,
            (
                &key.student_id,
                &key.class_id,
                &key.subject_id,
                &key.cohort_id,
                key.attempt,
            ),
            enrollment_from_row,
        )
        .optional()?;
    if let Some(e) = existing {
        return Ok(e);
    }

    get_student(conn, &key.student_id)?;
    get_named(conn, NamedTable::Class, &key.class_id)?;
    get_subject(conn, &key.subject_id)?;
    get_named(conn, NamedTable::Cohort, &key.cohort_id)?;
    get_semester(conn, semester_id)?;

    let e = Enrollment {
        id: Uuid::new_v4().to_string(),
        student_id: key.student_id.clone(),
        class_id: key.class_id.clone(),
        subject_id: key.subject_id.clone(),
        cohort_id: key.cohort_id.clone(),
        semester_id: semester_id.to_string(),
        attempt: key.attempt,
        active: true,
    };
    conn.execute(
        "INSERT INTO enrollments(id, student_id, class_id, subject_id, cohort_id, semester_id, attempt, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &e.id,
            &e.student_id,
            &e.class_id,
            &e.subject_id,
            &e.cohort_id,
            &e.semester_id,
            e.attempt,
            now,
        ),
    )?;
    tracing::debug!(enrollment_id = %e.id, student_id = %e.student_id, "enrollment created");
    Ok(e)
}

pub fn set_enrollment_active(conn: &Connection, id: &str, active: bool) -> GradeResult<Enrollment> {
    let changed = conn.execute(
        "UPDATE enrollments SET active = ? WHERE id = ?",
        (active as i64, id),
    )?;
    if changed == 0 {
        return Err(GradeError::not_found("enrollment", id));
    }
    get_enrollment(conn, id)
}
