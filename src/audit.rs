use rusqlite::Connection;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::db;

/// Append one entry. Entries are write-once: nothing in the application
/// updates or deletes audit_log rows. Callers that log field edits skip the
/// call entirely when the diff is empty; marker actions (RESET_VERIFICATION,
/// DEDUP_DELETE) pass an empty map and are still recorded.
pub fn append(
    conn: &Connection,
    student_id: &str,
    student_name: &str,
    actor_email: &str,
    action: &str,
    changes: &Map<String, Value>,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO audit_log(id, student_id, student_name, actor_email, action, changes, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            student_id,
            student_name,
            actor_email,
            action,
            serde_json::to_string(changes)?,
            db::now_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn list(conn: &Connection, student_id: Option<&str>) -> anyhow::Result<Vec<Value>> {
    let mut out = Vec::new();
    let mut push_row = |id: String,
                        sid: String,
                        name: String,
                        actor: String,
                        action: String,
                        changes: String,
                        created: String|
     -> anyhow::Result<()> {
        let changes: Value = serde_json::from_str(&changes).unwrap_or_else(|_| json!({}));
        out.push(json!({
            "id": id,
            "studentId": sid,
            "studentName": name,
            "actorEmail": actor,
            "action": action,
            "changes": changes,
            "createdAt": created,
        }));
        Ok(())
    };

    match student_id {
        Some(sid) => {
            let mut stmt = conn.prepare(
                "SELECT id, student_id, student_name, actor_email, action, changes, created_at
                 FROM audit_log WHERE student_id = ? ORDER BY created_at DESC",
            )?;
            let mut rows = stmt.query([sid])?;
            while let Some(row) = rows.next()? {
                push_row(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                )?;
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, student_id, student_name, actor_email, action, changes, created_at
                 FROM audit_log ORDER BY created_at DESC",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                push_row(
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                )?;
            }
        }
    }
    Ok(out)
}
