//! The one place gated handlers resolve their caller. Every operation that
//! needs a role goes through here; no handler parses tokens on its own.

use rusqlite::Connection;
use serde_json::Value;

use crate::auth::{self, Identity, Role};
use crate::db;
use crate::ipc::error::HandlerErr;

pub fn require_auth(conn: &Connection, params: &Value) -> Result<Identity, HandlerErr> {
    let token = params
        .get("token")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::unauthorized("missing token"))?;

    match auth::authenticate(conn, token, db::now_unix()) {
        Ok(Some(identity)) => Ok(identity),
        Ok(None) => Err(HandlerErr::unauthorized("invalid or expired token")),
        Err(e) => Err(HandlerErr::storage(e)),
    }
}

pub fn require_admin(conn: &Connection, params: &Value) -> Result<Identity, HandlerErr> {
    let identity = require_auth(conn, params)?;
    if identity.role != Role::Admin {
        return Err(HandlerErr::forbidden("admin role required"));
    }
    Ok(identity)
}

/// The student record the caller is linked to; NotFound when the account has
/// no linked record (admin accounts, or students created without a link).
pub fn linked_student_id(identity: &Identity) -> Result<String, HandlerErr> {
    identity
        .student_id
        .clone()
        .ok_or_else(|| HandlerErr::not_found("no student record is linked to this account"))
}
