use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::Role;
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::guard::{linked_student_id, require_admin, require_auth};
use crate::ipc::params::{get_optional_str, get_required_str};
use crate::ipc::types::{AppState, Request};
use crate::student;

const EXAM_KINDS: &[&str] = &["tka", "pdss"];

fn handle_upsert(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    if let Err(e) = require_admin(conn, &req.params) {
        return e.response(&req.id);
    }
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let exam_kind = match get_required_str(&req.params, "examKind") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(e) => return e.response(&req.id),
    };
    if !EXAM_KINDS.contains(&exam_kind.as_str()) {
        return err(&req.id, "bad_params", "examKind must be tka or pdss", None);
    }
    let subject = match get_required_str(&req.params, "subject") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let score = match req.params.get("score").and_then(|v| v.as_f64()) {
        Some(v) if (0.0..=100.0).contains(&v) => v,
        Some(_) => return err(&req.id, "bad_params", "score must be within 0..=100", None),
        None => return err(&req.id, "bad_params", "missing score", None),
    };

    match student::get(conn, &student_id) {
        Ok(Some(_)) => {}
        Ok(None) => return HandlerErr::not_found("student not found").response(&req.id),
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    }

    let now = db::now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO exam_scores(id, student_id, exam_kind, subject, score, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, exam_kind, subject)
         DO UPDATE SET score = excluded.score, updated_at = excluded.updated_at",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            student_id,
            exam_kind,
            subject,
            score,
            now
        ],
    ) {
        return err(&req.id, "db_failed", e.to_string(), None);
    }

    let row = conn
        .query_row(
            "SELECT id, score, updated_at FROM exam_scores
             WHERE student_id = ? AND exam_kind = ? AND subject = ?",
            rusqlite::params![student_id, exam_kind, subject],
            |r| {
                Ok(json!({
                    "scoreId": r.get::<_, String>(0)?,
                    "score": r.get::<_, f64>(1)?,
                    "updatedAt": r.get::<_, String>(2)?,
                }))
            },
        )
        .optional();
    match row {
        Ok(Some(v)) => ok(&req.id, v),
        Ok(None) => err(&req.id, "db_failed", "upserted score row missing", None),
        Err(e) => err(&req.id, "db_failed", e.to_string(), None),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let identity = match require_auth(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match identity.role {
        Role::Admin => match get_required_str(&req.params, "studentId") {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        },
        Role::Student => {
            let own = match linked_student_id(&identity) {
                Ok(v) => v,
                Err(e) => return e.response(&req.id),
            };
            if let Some(asked) = get_optional_str(&req.params, "studentId") {
                if asked != own {
                    return HandlerErr::forbidden("students may only read their own scores")
                        .response(&req.id);
                }
            }
            own
        }
    };

    let mut stmt = match conn.prepare(
        "SELECT id, exam_kind, subject, score, updated_at FROM exam_scores
         WHERE student_id = ? ORDER BY exam_kind, subject",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "examKind": r.get::<_, String>(1)?,
                "subject": r.get::<_, String>(2)?,
                "score": r.get::<_, f64>(3)?,
                "updatedAt": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(scores) => ok(&req.id, json!({ "scores": scores })),
        Err(e) => err(&req.id, "db_failed", e.to_string(), None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    if let Err(e) = require_admin(conn, &req.params) {
        return e.response(&req.id);
    }
    let score_id = match get_required_str(&req.params, "scoreId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match conn.execute("DELETE FROM exam_scores WHERE id = ?", [&score_id]) {
        Ok(0) => HandlerErr::not_found("score not found").response(&req.id),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "scores.upsert" => Some(handle_upsert(state, req)),
        "scores.list" => Some(handle_list(state, req)),
        "scores.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
