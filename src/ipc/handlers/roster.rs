use std::path::PathBuf;

use rusqlite::Connection;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::audit;
use crate::db;
use crate::import::{self, RosterRow};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::guard::require_admin;
use crate::ipc::params::{get_optional_str, get_required_str};
use crate::ipc::types::{AppState, Request};
use crate::student::{self, Student};
use crate::xlsx;

fn read_roster(path: &str) -> Result<import::RosterParse, HandlerErr> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        HandlerErr::upstream(e.to_string()).with_details(json!({ "path": path }))
    })?;
    import::parse_roster(&text)
        .map_err(|msg| HandlerErr::bad_params(msg).with_details(json!({ "path": path })))
}

fn row_patch(row: &RosterRow) -> Map<String, Value> {
    let mut patch = Map::new();
    for (k, v) in &row.fields {
        patch.insert(k.clone(), Value::String(v.clone()));
    }
    patch
}

fn handle_import_preview(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    if let Err(e) = require_admin(conn, &req.params) {
        return e.response(&req.id);
    }
    let in_path = match get_required_str(&req.params, "path") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let parsed = match read_roster(&in_path) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut matched = 0usize;
    let mut new_count = 0usize;
    let mut preview_rows = Vec::new();
    for row in &parsed.rows {
        let nisn = row.value("nisn").unwrap_or_default();
        let existing = match student::get_by_nisn(conn, nisn) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
        };
        match existing {
            Some(current) => {
                matched += 1;
                let mut probe = current.clone();
                let would_change = match probe.apply_patch(&row_patch(row)) {
                    Ok(()) => Student::diff(&current, &probe).len(),
                    Err(_) => 0,
                };
                preview_rows.push(json!({
                    "line": row.line_no,
                    "nisn": nisn,
                    "nama": row.value("nama"),
                    "status": "matched",
                    "matchedStudentId": current.id,
                    "wouldChange": would_change,
                }));
            }
            None => {
                new_count += 1;
                preview_rows.push(json!({
                    "line": row.line_no,
                    "nisn": nisn,
                    "nama": row.value("nama"),
                    "status": "new",
                }));
            }
        }
    }

    ok(
        &req.id,
        json!({
            "path": in_path,
            "rowsTotal": parsed.rows_total,
            "rowsParsed": parsed.rows.len(),
            "matched": matched,
            "new": new_count,
            "invalid": parsed.warnings.len(),
            "warnings": parsed.warnings,
            "previewRows": preview_rows,
        }),
    )
}

fn handle_import_apply(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let identity = match require_admin(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let in_path = match get_required_str(&req.params, "path") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let mode = get_optional_str(&req.params, "mode").unwrap_or_else(|| "upsert".to_string());
    if mode != "upsert" && mode != "insert_only" {
        return err(&req.id, "bad_params", "mode must be upsert or insert_only", None);
    }
    let parsed = match read_roster(&in_path) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    let mut created = 0usize;
    let mut updated = 0usize;
    let mut unchanged = 0usize;
    let mut skipped = 0usize;
    for row in &parsed.rows {
        match apply_row(&tx, row, &mode, &identity.email) {
            Ok(RowOutcome::Created) => created += 1,
            Ok(RowOutcome::Updated) => updated += 1,
            Ok(RowOutcome::Unchanged) => unchanged += 1,
            Ok(RowOutcome::Skipped) => skipped += 1,
            Err(e) => {
                let _ = tx.rollback();
                return e.with_details(json!({ "line": row.line_no })).response(&req.id);
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "path": in_path,
            "mode": mode,
            "created": created,
            "updated": updated,
            "unchanged": unchanged,
            "skipped": skipped,
            "invalid": parsed.warnings.len(),
            "warnings": parsed.warnings,
        }),
    )
}

enum RowOutcome {
    Created,
    Updated,
    Unchanged,
    Skipped,
}

fn apply_row(
    conn: &Connection,
    row: &RosterRow,
    mode: &str,
    actor_email: &str,
) -> Result<RowOutcome, HandlerErr> {
    let nisn = row.value("nisn").unwrap_or_default();
    let patch = row_patch(row);
    let existing = student::get_by_nisn(conn, nisn).map_err(HandlerErr::storage)?;

    match existing {
        Some(before) => {
            if mode == "insert_only" {
                return Ok(RowOutcome::Skipped);
            }
            let mut after = before.clone();
            after.apply_patch(&patch).map_err(HandlerErr::bad_params)?;
            let changes = Student::diff(&before, &after);
            if changes.is_empty() {
                return Ok(RowOutcome::Unchanged);
            }
            student::save_fields(conn, &after, &db::now_rfc3339())
                .map_err(HandlerErr::storage)?;
            audit::append(conn, &after.id, &after.nama, actor_email, "IMPORT", &changes)
                .map_err(HandlerErr::storage)?;
            Ok(RowOutcome::Updated)
        }
        None => {
            let now = db::now_rfc3339();
            let mut s = Student::blank(Uuid::new_v4().to_string(), &now);
            s.apply_patch(&patch).map_err(HandlerErr::bad_params)?;
            student::insert(conn, &s).map_err(HandlerErr::storage)?;
            let mut changes = Map::new();
            for (k, v) in &row.fields {
                changes.insert(k.clone(), json!({ "old": null, "new": v }));
            }
            audit::append(conn, &s.id, &s.nama, actor_email, "IMPORT", &changes)
                .map_err(HandlerErr::storage)?;
            Ok(RowOutcome::Created)
        }
    }
}

fn handle_export_xlsx(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    if let Err(e) = require_admin(conn, &req.params) {
        return e.response(&req.id);
    }
    let out_path = match get_required_str(&req.params, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e.response(&req.id),
    };

    let students = match student::list(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    match xlsx::export_students(&students, &out_path) {
        Ok(rows) => ok(
            &req.id,
            json!({
                "path": out_path.to_string_lossy(),
                "rowsExported": rows,
            }),
        ),
        Err(e) => err(
            &req.id,
            "upstream_failed",
            e.to_string(),
            Some(json!({ "path": out_path.to_string_lossy() })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "roster.importPreview" => Some(handle_import_preview(state, req)),
        "roster.importApply" => Some(handle_import_apply(state, req)),
        "roster.exportXlsx" => Some(handle_export_xlsx(state, req)),
        _ => None,
    }
}
