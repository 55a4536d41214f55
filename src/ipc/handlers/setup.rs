use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Limits,
    Permissions,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "limits" => Some(Self::Limits),
            "permissions" => Some(Self::Permissions),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Limits => "setup.limits",
            Self::Permissions => "setup.permissions",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Limits => json!({
            "maxBulkRows": 5000,
            "maxBatchIds": 1000
        }),
        SetupSection::Permissions => json!({
            "expireSweepOnOpen": true
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Limits => match k.as_str() {
                "maxBulkRows" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 20000)?));
                }
                "maxBatchIds" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 5000)?));
                }
                _ => return Err(format!("unknown limits field: {}", k)),
            },
            SetupSection::Permissions => match k.as_str() {
                "expireSweepOnOpen" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown permissions field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            for (k, v) in saved_obj {
                let mut one = Map::new();
                one.insert(k.clone(), v.clone());
                let _ = merge_section_patch(section, &mut current, &one);
            }
        }
    }
    Ok(current)
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_bulk_rows: usize,
    pub max_batch_ids: usize,
}

pub fn limits(conn: &rusqlite::Connection) -> anyhow::Result<Limits> {
    let v = load_section(conn, SetupSection::Limits)?;
    let get = |k: &str, d: u64| v.get(k).and_then(|x| x.as_u64()).unwrap_or(d) as usize;
    Ok(Limits {
        max_bulk_rows: get("maxBulkRows", 5000),
        max_batch_ids: get("maxBatchIds", 1000),
    })
}

pub fn expire_sweep_on_open(conn: &rusqlite::Connection) -> anyhow::Result<bool> {
    let v = load_section(conn, SetupSection::Permissions)?;
    Ok(v.get("expireSweepOnOpen")
        .and_then(|x| x.as_bool())
        .unwrap_or(true))
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let limits = match load_section(conn, SetupSection::Limits) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_error", e.to_string(), None),
    };
    let permissions = match load_section(conn, SetupSection::Permissions) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_error", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "limits": limits,
            "permissions": permissions
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_error", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_error", e.to_string(), None);
    }
    tracing::info!(section = section_raw, "setup updated");
    ok(&req.id, json!({ "ok": true, section_raw: current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_patch_is_range_checked() {
        let mut cur = default_section(SetupSection::Limits);
        let patch = json!({ "maxBulkRows": 0 });
        assert!(merge_section_patch(SetupSection::Limits, &mut cur, patch.as_object().unwrap()).is_err());
        let patch = json!({ "maxBulkRows": 10, "maxBatchIds": 3 });
        merge_section_patch(SetupSection::Limits, &mut cur, patch.as_object().unwrap()).unwrap();
        assert_eq!(cur["maxBulkRows"], 10);
        assert_eq!(cur["maxBatchIds"], 3);
    }

    #[test]
    fn saved_limits_override_defaults() {
        let conn = db::open_memory();
        assert_eq!(limits(&conn).unwrap().max_bulk_rows, 5000);
        db::settings_set_json(&conn, "setup.limits", &json!({ "maxBulkRows": 2, "bogus": 1 })).unwrap();
        let l = limits(&conn).unwrap();
        assert_eq!(l.max_bulk_rows, 2);
        assert_eq!(l.max_batch_ids, 1000);
        assert!(expire_sweep_on_open(&conn).unwrap());
    }
}
