use serde_json::json;
use thiserror::Error;

/// Failure taxonomy shared by every grading operation.
#[derive(Debug, Error)]
pub enum GradeError {
    #[error("{message}")]
    Validation {
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("{entity} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    StateGuard(String),

    /// Reserved for compare-and-swap on `grades.version`, which is not enforced yet.
    #[allow(dead_code)]
    #[error("grade {grade_id} changed concurrently (expected version {expected}, found {found})")]
    ConcurrencyConflict {
        grade_id: String,
        expected: i64,
        found: i64,
    },

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type GradeResult<T> = Result<T, GradeError>;

impl GradeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn validation_with(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::Validation {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn guard(message: impl Into<String>) -> Self {
        Self::StateGuard(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::StateGuard(_) => "state_guard_violation",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::Db(_) | Self::Json(_) => "db_error",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Validation { details, .. } => details.clone(),
            Self::NotFound { entity, id } => Some(json!({ "entity": entity, "id": id })),
            Self::ConcurrencyConflict {
                grade_id,
                expected,
                found,
            } => Some(json!({
                "gradeId": grade_id,
                "expectedVersion": expected,
                "foundVersion": found
            })),
            _ => None,
        }
    }

    /// Row-level error object used by bulk operations.
    pub fn to_row_json(&self, row: serde_json::Value) -> serde_json::Value {
        let mut obj = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Some(map) = obj.as_object_mut() {
            if let Some(r) = row.as_object() {
                for (k, v) in r {
                    map.insert(k.clone(), v.clone());
                }
            }
            if let Some(d) = self.details() {
                map.insert("details".into(), d);
            }
        }
        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(GradeError::validation("x").code(), "validation_error");
        assert_eq!(GradeError::not_found("grade", "g1").code(), "not_found");
        assert_eq!(GradeError::guard("nope").code(), "state_guard_violation");
        assert_eq!(GradeError::not_found("grade", "g1").to_string(), "grade not found");
    }

    #[test]
    fn row_json_merges_row_keys() {
        let e = GradeError::validation_with("score out of range", json!({ "value": 11.0 }));
        let v = e.to_row_json(json!({ "index": 3 }));
        assert_eq!(v["index"], 3);
        assert_eq!(v["code"], "validation_error");
        assert_eq!(v["details"]["value"], 11.0);
    }
}
