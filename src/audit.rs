use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use crate::error::GradeResult;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub entity: String,
    pub entity_id: String,
    pub action: String,
    pub actor_id: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub at: String,
}

/// Appends a before/after snapshot. Rows are never updated or deleted.
#[allow(clippy::too_many_arguments)]
pub fn append<B: Serialize, A: Serialize>(
    conn: &Connection,
    entity: &str,
    entity_id: &str,
    action: &str,
    actor_id: &str,
    before: Option<&B>,
    after: Option<&A>,
    at: &str,
) -> GradeResult<String> {
    let id = Uuid::new_v4().to_string();
    let before_json = before.map(serde_json::to_string).transpose()?;
    let after_json = after.map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO audit_log(id, entity, entity_id, action, actor_id, before_json, after_json, at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            entity,
            entity_id,
            action,
            actor_id,
            before_json,
            after_json,
            at,
        ),
    )?;
    Ok(id)
}

pub fn list(conn: &Connection, entity: &str, entity_id: &str) -> GradeResult<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, entity, entity_id, action, actor_id, before_json, after_json, at
         FROM audit_log WHERE entity = ? AND entity_id = ? ORDER BY seq",
    )?;
    let raw = stmt
        .query_map((entity, entity_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, Option<String>>(6)?,
                r.get::<_, String>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(raw.len());
    for (id, entity, entity_id, action, actor_id, before, after, at) in raw {
        out.push(AuditEntry {
            id,
            entity,
            entity_id,
            action,
            actor_id,
            before: before.as_deref().map(serde_json::from_str).transpose()?,
            after: after.as_deref().map(serde_json::from_str).transpose()?,
            at,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;

    #[test]
    fn entries_come_back_in_append_order() {
        let conn = db::open_memory();
        append(&conn, "grade", "g1", "create", "u1", None::<&()>, Some(&json!({"v": 1})), "t1")
            .expect("append");
        append(
            &conn,
            "grade",
            "g1",
            "update",
            "u1",
            Some(&json!({"v": 1})),
            Some(&json!({"v": 2})),
            "t2",
        )
        .expect("append");
        append(&conn, "grade", "g2", "create", "u1", None::<&()>, Some(&json!({})), "t3")
            .expect("append");

        let entries = list(&conn, "grade", "g1").expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "create");
        assert!(entries[0].before.is_none());
        assert_eq!(entries[1].before, Some(json!({"v": 1})));
        assert_eq!(entries[1].after, Some(json!({"v": 2})));
    }
}
