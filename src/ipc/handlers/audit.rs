use serde_json::json;

use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::guard::require_admin;
use crate::ipc::params::get_optional_str;
use crate::ipc::types::{AppState, Request};

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    if let Err(e) = require_admin(conn, &req.params) {
        return e.response(&req.id);
    }
    let student_id = get_optional_str(&req.params, "studentId");

    match audit::list(conn, student_id.as_deref()) {
        Ok(entries) => ok(&req.id, json!({ "entries": entries })),
        Err(e) => err(&req.id, "db_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
