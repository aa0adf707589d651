use rusqlite::Connection;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::audit;
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::guard::{linked_student_id, require_admin, require_auth};
use crate::ipc::params::{get_optional_str, get_required_object, get_required_str};
use crate::ipc::types::{AppState, Request};
use crate::student::{self, Student, SELF_SERVICE_FIELDS};
use crate::workflow::ACTIVE_STATUSES;

fn active_status_sql_list() -> String {
    ACTIVE_STATUSES
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn handle_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    if let Err(e) = require_admin(conn, &req.params) {
        return e.response(&req.id);
    }

    // Correlated subquery so the dashboard can flag in-flight requests
    // without a second round trip.
    let sql = format!(
        "SELECT
           s.id, s.nisn, s.nama, s.is_verified, s.verified_at, s.updated_at,
           EXISTS(
             SELECT 1 FROM change_requests cr
             WHERE cr.student_id = s.id AND cr.status IN ({})
           ) AS has_active_request
         FROM students s
         ORDER BY s.nama, s.nisn",
        active_status_sql_list()
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "nisn": row.get::<_, String>(1)?,
                "nama": row.get::<_, String>(2)?,
                "isVerified": row.get::<_, i64>(3)? != 0,
                "verifiedAt": row.get::<_, Option<String>>(4)?,
                "updatedAt": row.get::<_, String>(5)?,
                "hasActiveRequest": row.get::<_, i64>(6)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_failed", e.to_string(), None),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let identity = match require_auth(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let found = if let Some(id) = get_optional_str(&req.params, "studentId") {
        student::get(conn, &id)
    } else if let Some(nisn) = get_optional_str(&req.params, "nisn") {
        student::get_by_nisn(conn, &nisn)
    } else {
        match linked_student_id(&identity) {
            Ok(own) => student::get(conn, &own),
            Err(e) => return e.response(&req.id),
        }
    };

    let s = match found {
        Ok(Some(s)) => s,
        Ok(None) => return HandlerErr::not_found("student not found").response(&req.id),
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };

    if identity.role != crate::auth::Role::Admin && identity.student_id.as_deref() != Some(s.id.as_str()) {
        return HandlerErr::forbidden("students may only read their own record").response(&req.id);
    }
    ok(&req.id, json!({ "student": s.to_json() }))
}

fn handle_create(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    if let Err(e) = require_admin(conn, &req.params) {
        return e.response(&req.id);
    }
    let data = match get_required_object(&req.params, "data") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let now = db::now_rfc3339();
    let mut s = Student::blank(Uuid::new_v4().to_string(), &now);
    if let Err(msg) = s.apply_patch(data) {
        return err(&req.id, "bad_params", msg, None);
    }
    if s.nisn.is_empty() || s.nama.is_empty() {
        return err(&req.id, "bad_params", "data must include nisn and nama", None);
    }

    match student::get_by_nisn(conn, &s.nisn) {
        Ok(Some(existing)) => {
            return HandlerErr::conflict(format!(
                "a student with NISN {} already exists",
                s.nisn
            ))
            .with_details(json!({ "studentId": existing.id }))
            .response(&req.id)
        }
        Ok(None) => {}
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    }

    if let Err(e) = student::insert(conn, &s) {
        return err(&req.id, "db_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "student": s.to_json() }))
}

fn handle_update(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let identity = match require_admin(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let patch = match get_required_object(&req.params, "patch") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let before = match student::get(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return HandlerErr::not_found("student not found").response(&req.id),
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };

    match apply_audited_update(conn, &before, patch, &identity.email, "UPDATE") {
        Ok(changes) => ok(&req.id, json!({ "changed": changes.len(), "changes": changes })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_update_contact(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let identity = match require_auth(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match linked_student_id(&identity) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let patch = match get_required_object(&req.params, "patch") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    for key in patch.keys() {
        if !SELF_SERVICE_FIELDS.contains(&key.as_str()) {
            return err(
                &req.id,
                "forbidden",
                format!("field {} cannot be changed without a change request", key),
                None,
            );
        }
    }

    let before = match student::get(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return HandlerErr::not_found("student not found").response(&req.id),
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };

    match apply_audited_update(conn, &before, patch, &identity.email, "UPDATE_CONTACT") {
        Ok(changes) => ok(&req.id, json!({ "changed": changes.len() })),
        Err(e) => e.response(&req.id),
    }
}

/// Shared write path for direct edits: typed patch, diff, save + one audit
/// entry in a single transaction. A no-op patch writes nothing at all.
fn apply_audited_update(
    conn: &Connection,
    before: &Student,
    patch: &Map<String, Value>,
    actor_email: &str,
    action: &str,
) -> Result<Map<String, Value>, HandlerErr> {
    let mut after = before.clone();
    after
        .apply_patch(patch)
        .map_err(HandlerErr::bad_params)?;

    let changes = Student::diff(before, &after);
    if changes.is_empty() {
        return Ok(changes);
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::storage)?;
    student::save_fields(&tx, &after, &db::now_rfc3339()).map_err(HandlerErr::storage)?;
    audit::append(&tx, &after.id, &after.nama, actor_email, action, &changes)
        .map_err(HandlerErr::storage)?;
    tx.commit().map_err(HandlerErr::storage)?;
    Ok(changes)
}

fn handle_verify(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let identity = match require_auth(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match linked_student_id(&identity) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let now = db::now_rfc3339();
    let n = match conn.execute(
        "UPDATE students SET is_verified = 1, verified_at = ? WHERE id = ?",
        rusqlite::params![now, student_id],
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    if n == 0 {
        return HandlerErr::not_found("student not found").response(&req.id);
    }
    ok(&req.id, json!({ "verifiedAt": now }))
}

fn handle_reset_verification(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let identity = match require_admin(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let s = match student::get(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return HandlerErr::not_found("student not found").response(&req.id),
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE students SET is_verified = 0, verified_at = NULL WHERE id = ?",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_failed", e.to_string(), None);
    }
    if let Err(e) = audit::append(
        &tx,
        &s.id,
        &s.nama,
        &identity.email,
        "RESET_VERIFICATION",
        &Map::new(),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

/// Delete one student row and everything that references it. Audit entries
/// stay: the log has no foreign key on purpose.
fn delete_student_rows(conn: &Connection, student_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET student_id = NULL WHERE student_id = ?",
        [student_id],
    )?;
    conn.execute(
        "DELETE FROM change_requests WHERE student_id = ?",
        [student_id],
    )?;
    conn.execute("DELETE FROM exam_scores WHERE student_id = ?", [student_id])?;
    conn.execute("DELETE FROM students WHERE id = ?", [student_id])?;
    Ok(())
}

fn handle_dedup(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let identity = match require_admin(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let apply = req
        .params
        .get("apply")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let dup_nisns: Result<Vec<String>, _> = conn
        .prepare("SELECT nisn FROM students GROUP BY nisn HAVING COUNT(*) > 1 ORDER BY nisn")
        .and_then(|mut stmt| {
            stmt.query_map([], |r| r.get::<_, String>(0))
                .and_then(|it| it.collect())
        });
    let dup_nisns = match dup_nisns {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };

    // Per NISN group: keep the most recently touched row, drop the rest.
    let mut groups = Vec::new();
    let mut doomed: Vec<(String, String)> = Vec::new();
    for nisn in &dup_nisns {
        let rows: Result<Vec<(String, String)>, _> = conn
            .prepare(
                "SELECT id, nama FROM students WHERE nisn = ?
                 ORDER BY updated_at DESC, created_at DESC, id",
            )
            .and_then(|mut stmt| {
                stmt.query_map([nisn], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
                    .and_then(|it| it.collect())
            });
        let rows = match rows {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
        };
        let keep = rows[0].0.clone();
        let delete_ids: Vec<String> = rows[1..].iter().map(|(id, _)| id.clone()).collect();
        doomed.extend(rows[1..].iter().cloned());
        groups.push(json!({
            "nisn": nisn,
            "keepId": keep,
            "deleteIds": delete_ids,
        }));
    }

    if !apply {
        return ok(
            &req.id,
            json!({ "groups": groups, "wouldDelete": doomed.len(), "applied": false }),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    for (id, nama) in &doomed {
        if let Err(e) = delete_student_rows(&tx, id) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_failed",
                e.to_string(),
                Some(json!({ "studentId": id })),
            );
        }
        if let Err(e) = audit::append(&tx, id, nama, &identity.email, "DEDUP_DELETE", &Map::new())
        {
            let _ = tx.rollback();
            return err(&req.id, "db_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "groups": groups, "deleted": doomed.len(), "applied": true }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_list(state, req)),
        "students.get" => Some(handle_get(state, req)),
        "students.create" => Some(handle_create(state, req)),
        "students.update" => Some(handle_update(state, req)),
        "students.updateContact" => Some(handle_update_contact(state, req)),
        "students.verify" => Some(handle_verify(state, req)),
        "students.resetVerification" => Some(handle_reset_verification(state, req)),
        "students.dedup" => Some(handle_dedup(state, req)),
        _ => None,
    }
}
