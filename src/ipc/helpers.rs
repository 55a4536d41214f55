use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::GradeError;
use crate::ipc::error::{err, grade_err};
use crate::lifecycle::Actor;

/// Handler-level failure, rendered into the error envelope at the end.
pub enum HandlerErr {
    Params(String),
    Grade(GradeError),
    Other {
        code: &'static str,
        message: String,
        details: Option<Value>,
    },
}

impl HandlerErr {
    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::Params(message.into())
    }

    pub fn response(self, id: &str) -> Value {
        match self {
            Self::Params(m) => err(id, "bad_params", m, None),
            Self::Grade(e) => grade_err(id, &e),
            Self::Other {
                code,
                message,
                details,
            } => err(id, code, message, details),
        }
    }
}

impl From<GradeError> for HandlerErr {
    fn from(e: GradeError) -> Self {
        Self::Grade(e)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        Self::Grade(GradeError::Db(e))
    }
}

impl From<anyhow::Error> for HandlerErr {
    fn from(e: anyhow::Error) -> Self {
        Self::Other {
            code: "db_error",
            message: e.to_string(),
            details: None,
        }
    }
}

pub type HandlerResult = Result<Value, HandlerErr>;

pub fn req_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(HandlerErr::bad_params(format!("missing {}", key))),
    }
}

pub fn opt_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub fn parse_actor(params: &Value) -> Result<Actor, HandlerErr> {
    let raw = params
        .get("actor")
        .ok_or_else(|| HandlerErr::bad_params("missing actor"))?;
    let actor: Actor = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid actor: {}", e)))?;
    if actor.id.trim().is_empty() {
        return Err(HandlerErr::bad_params("actor.id must not be empty"));
    }
    Ok(actor)
}

pub fn require_admin(actor: &Actor, what: &str) -> Result<(), HandlerErr> {
    if actor.is_admin() {
        return Ok(());
    }
    Err(GradeError::guard(format!("{} requires an administrator", what)).into())
}

pub fn parse_ids(params: &Value, key: &str, max: usize) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("missing {}[]", key)));
    };
    if arr.len() > max {
        return Err(HandlerErr::Other {
            code: "too_many_items",
            message: format!("{} exceeds max items: {} > {}", key, arr.len(), max),
            details: Some(json!({ "count": arr.len(), "max": max })),
        });
    }
    arr.iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| HandlerErr::bad_params(format!("{}[{}] must be a string", key, i)))
        })
        .collect()
}

pub fn parse_field<T: DeserializeOwned>(params: &Value, key: &str) -> Result<T, HandlerErr> {
    let raw = params
        .get(key)
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid {}: {}", key, e)))
}

/// Resolution time: `params.at` when supplied (RFC 3339), else the wall clock.
pub fn parse_at(params: &Value) -> Result<DateTime<Utc>, HandlerErr> {
    match opt_str(params, "at") {
        None => Ok(Utc::now()),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| HandlerErr::bad_params(format!("invalid at: {}", e))),
    }
}

pub fn to_json<T: Serialize>(v: &T) -> HandlerResult {
    serde_json::to_value(v).map_err(|e| HandlerErr::Grade(GradeError::Json(e)))
}
