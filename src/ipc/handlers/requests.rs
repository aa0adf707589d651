use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::audit;
use crate::auth::Role;
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::guard::{linked_student_id, require_admin, require_auth};
use crate::ipc::params::{get_optional_str, get_required_object, get_required_str};
use crate::ipc::types::{AppState, Request};
use crate::student::{self, Student};
use crate::workflow::{self, AdminAction, RequestStatus, ACTIVE_STATUSES};

struct ChangeRequestRow {
    id: String,
    student_id: String,
    status: RequestStatus,
    reason: String,
    original_data: Value,
    proposed_changes: Option<Value>,
    admin_notes: Option<String>,
    created_at: String,
    updated_at: String,
}

const SELECT_COLS: &str = "id, student_id, status, reason, original_data, proposed_changes, \
     admin_notes, created_at, updated_at";

fn from_row(row: &Row) -> rusqlite::Result<ChangeRequestRow> {
    let status_raw: String = row.get(2)?;
    let status = RequestStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unrecognized request status: {}", status_raw).into(),
        )
    })?;
    let original_raw: String = row.get(4)?;
    let proposed_raw: Option<String> = row.get(5)?;
    Ok(ChangeRequestRow {
        id: row.get(0)?,
        student_id: row.get(1)?,
        status,
        reason: row.get(3)?,
        original_data: serde_json::from_str(&original_raw).unwrap_or(Value::Null),
        proposed_changes: proposed_raw.and_then(|s| serde_json::from_str(&s).ok()),
        admin_notes: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl ChangeRequestRow {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "studentId": self.student_id,
            "status": self.status.as_str(),
            "reason": self.reason,
            "originalData": self.original_data,
            "proposedChanges": self.proposed_changes,
            "adminNotes": self.admin_notes,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

fn get_request(conn: &Connection, id: &str) -> Result<ChangeRequestRow, HandlerErr> {
    let sql = format!("SELECT {} FROM change_requests WHERE id = ?", SELECT_COLS);
    conn.query_row(&sql, [id], from_row)
        .optional()
        .map_err(HandlerErr::storage)?
        .ok_or_else(|| HandlerErr::not_found("change request not found"))
}

fn active_status_sql_list() -> String {
    ACTIVE_STATUSES
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn handle_create(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let identity = match require_auth(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let reason = match get_required_str(&req.params, "reason") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    // Students file for themselves; an admin may file on a student's behalf.
    let student_id = match identity.role {
        Role::Admin => match get_required_str(&req.params, "studentId") {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        },
        Role::Student => match linked_student_id(&identity) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        },
    };

    let snapshot = match student::get(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return HandlerErr::not_found("student not found").response(&req.id),
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };

    // Existence check and insert share one transaction so two racing creates
    // cannot both slip past the at-most-one-active invariant.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    let active_sql = format!(
        "SELECT id FROM change_requests WHERE student_id = ? AND status IN ({}) LIMIT 1",
        active_status_sql_list()
    );
    let active: Option<String> = match tx
        .query_row(&active_sql, [&student_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_failed", e.to_string(), None);
        }
    };
    if let Some(existing) = active {
        let _ = tx.rollback();
        return HandlerErr::conflict("an active change request already exists for this student")
            .with_details(json!({ "requestId": existing }))
            .response(&req.id);
    }

    let now = db::now_rfc3339();
    let request_id = Uuid::new_v4().to_string();
    let original = match serde_json::to_string(&snapshot.to_json()) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_failed", e.to_string(), None);
        }
    };
    if let Err(e) = tx.execute(
        "INSERT INTO change_requests(
            id, student_id, status, reason, original_data, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            request_id,
            student_id,
            RequestStatus::Requested.as_str(),
            reason,
            original,
            now,
            now,
        ],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_failed", e.to_string(), None);
    }

    match get_request(conn, &request_id) {
        Ok(row) => ok(&req.id, json!({ "request": row.to_json() })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    if let Err(e) = require_admin(conn, &req.params) {
        return e.response(&req.id);
    }

    let sql = format!(
        "SELECT {} FROM change_requests ORDER BY updated_at DESC",
        SELECT_COLS
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(requests) => ok(
            &req.id,
            json!({ "requests": requests.iter().map(|r| r.to_json()).collect::<Vec<_>>() }),
        ),
        Err(e) => err(&req.id, "db_failed", e.to_string(), None),
    }
}

fn handle_action(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let identity = match require_admin(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let request_id = match get_required_str(&req.params, "requestId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let action = match get_required_str(&req.params, "action") {
        Ok(raw) => match AdminAction::parse(&raw) {
            Some(a) => a,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "action must be approve_edit, validate, or reject",
                    None,
                )
            }
        },
        Err(e) => return e.response(&req.id),
    };
    let notes = get_optional_str(&req.params, "notes");

    let request = match get_request(conn, &request_id) {
        Ok(r) => r,
        Err(e) => return e.response(&req.id),
    };
    let next = match workflow::apply_action(request.status, action) {
        Ok(n) => n,
        Err(e) => return HandlerErr::invalid_transition(e.to_string()).response(&req.id),
    };

    let now = db::now_rfc3339();
    let result = match action {
        AdminAction::ApproveEdit => conn
            .execute(
                "UPDATE change_requests SET status = ?, updated_at = ? WHERE id = ?",
                rusqlite::params![next.as_str(), now, request.id],
            )
            .map(|_| ())
            .map_err(HandlerErr::storage),
        AdminAction::Reject => conn
            .execute(
                "UPDATE change_requests SET status = ?, admin_notes = ?, updated_at = ? WHERE id = ?",
                rusqlite::params![next.as_str(), notes, now, request.id],
            )
            .map(|_| ())
            .map_err(HandlerErr::storage),
        AdminAction::Validate => validate_request(conn, &request, next, &identity.email, &now),
    };

    match result {
        Ok(()) => ok(&req.id, json!({ "requestId": request.id, "status": next.as_str() })),
        Err(e) => e.response(&req.id),
    }
}

/// Commit the proposed changes: student-row overwrite, audit entry, and the
/// request-status flip land in one transaction, so a crash can't leave the
/// student updated while the request still says review.
fn validate_request(
    conn: &Connection,
    request: &ChangeRequestRow,
    next: RequestStatus,
    actor_email: &str,
    now: &str,
) -> Result<(), HandlerErr> {
    let before = student::get(conn, &request.student_id)
        .map_err(HandlerErr::storage)?
        .ok_or_else(|| HandlerErr::not_found("student for this request no longer exists"))?;

    let empty = Map::new();
    let proposed = request
        .proposed_changes
        .as_ref()
        .and_then(|v| v.as_object())
        .unwrap_or(&empty);

    let mut after = before.clone();
    after
        .apply_patch(proposed)
        .map_err(HandlerErr::bad_params)?;
    let changes = Student::diff(&before, &after);

    let tx = conn.unchecked_transaction().map_err(HandlerErr::storage)?;
    student::save_fields(&tx, &after, now).map_err(HandlerErr::storage)?;
    if !changes.is_empty() {
        audit::append(&tx, &after.id, &after.nama, actor_email, "VALIDATE", &changes)
            .map_err(HandlerErr::storage)?;
    }
    tx.execute(
        "UPDATE change_requests SET status = ?, updated_at = ? WHERE id = ?",
        rusqlite::params![next.as_str(), now, request.id],
    )
    .map_err(HandlerErr::storage)?;
    tx.commit().map_err(HandlerErr::storage)?;
    Ok(())
}

fn handle_submit(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let identity = match require_auth(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let request_id = match get_required_str(&req.params, "requestId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let data = match get_required_object(&req.params, "data") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let request = match get_request(conn, &request_id) {
        Ok(r) => r,
        Err(e) => return e.response(&req.id),
    };
    if identity.student_id.as_deref() != Some(request.student_id.as_str()) {
        return HandlerErr::forbidden("only the requesting student may submit changes")
            .response(&req.id);
    }
    if !workflow::submit_allowed(request.status) {
        return HandlerErr::invalid_transition(format!(
            "submit is not allowed while the request is {}",
            request.status.as_str()
        ))
        .response(&req.id);
    }

    // Validate the field map against the live record before storing it, so
    // review never sees a patch that cannot apply.
    let current = match student::get(conn, &request.student_id) {
        Ok(Some(s)) => s,
        Ok(None) => {
            return HandlerErr::not_found("student for this request no longer exists")
                .response(&req.id)
        }
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    let mut probe = current.clone();
    if let Err(msg) = probe.apply_patch(data) {
        return err(&req.id, "bad_params", msg, None);
    }

    let raw = match serde_json::to_string(&Value::Object(data.clone())) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    if let Err(e) = conn.execute(
        "UPDATE change_requests SET status = ?, proposed_changes = ?, updated_at = ? WHERE id = ?",
        rusqlite::params![
            RequestStatus::Review.as_str(),
            raw,
            db::now_rfc3339(),
            request.id
        ],
    ) {
        return err(&req.id, "db_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "requestId": request.id, "status": RequestStatus::Review.as_str() }),
    )
}

fn handle_status(state: &mut AppState, req: &Request) -> Value {
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
                    return HandlerErr::forbidden("students may only query their own request")
                        .response(&req.id);
                }
            }
            own
        }
    };

    let sql = format!(
        "SELECT {} FROM change_requests WHERE student_id = ? ORDER BY created_at DESC LIMIT 1",
        SELECT_COLS
    );
    let row = match conn.query_row(&sql, [&student_id], from_row).optional() {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({ "request": row.map(|r| r.to_json()) }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "requests.create" => Some(handle_create(state, req)),
        "requests.list" => Some(handle_list(state, req)),
        "requests.action" => Some(handle_action(state, req)),
        "requests.submit" => Some(handle_submit(state, req)),
        "requests.status" => Some(handle_status(state, req)),
        _ => None,
    }
}
