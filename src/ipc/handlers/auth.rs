use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::auth::{self, Role};
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::guard::{require_admin, require_auth};
use crate::ipc::params::{get_optional_str, get_required_str};
use crate::ipc::types::{AppState, Request};
use crate::student;

const MIN_PASSWORD_LEN: usize = 8;

fn handle_bootstrap(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let email = match get_required_str(&req.params, "email") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let password = match req.params.get("password").and_then(|v| v.as_str()) {
        Some(v) if v.len() >= MIN_PASSWORD_LEN => v.to_string(),
        Some(_) => {
            return err(
                &req.id,
                "bad_params",
                format!("password must be at least {} characters", MIN_PASSWORD_LEN),
                None,
            )
        }
        None => return err(&req.id, "bad_params", "missing password", None),
    };

    let existing: i64 = match conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    if existing > 0 {
        return HandlerErr::conflict("service already has user accounts").response(&req.id);
    }

    match insert_user(conn, &email, &password, Role::Admin, None) {
        Ok(user_id) => ok(&req.id, json!({ "userId": user_id })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let email = match get_required_str(&req.params, "email") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let password = match req.params.get("password").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing password", None),
    };

    let verified = match auth::verify_login(conn, &email, &password) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    let Some((user_id, role, student_id)) = verified else {
        return HandlerErr::unauthorized("invalid email or password").response(&req.id);
    };

    match auth::create_session(conn, &user_id, db::now_unix()) {
        Ok(token) => ok(
            &req.id,
            json!({
                "token": token,
                "role": role.as_str(),
                "studentId": student_id,
            }),
        ),
        Err(e) => err(&req.id, "db_failed", e.to_string(), None),
    }
}

fn handle_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let token = match get_required_str(&req.params, "token") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match auth::revoke_session(conn, &token, db::now_unix()) {
        Ok(revoked) => ok(&req.id, json!({ "revoked": revoked })),
        Err(e) => err(&req.id, "db_failed", e.to_string(), None),
    }
}

fn handle_whoami(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let identity = match require_auth(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    ok(
        &req.id,
        json!({
            "userId": identity.user_id,
            "email": identity.email,
            "role": identity.role.as_str(),
            "studentId": identity.student_id,
        }),
    )
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    if let Err(e) = require_admin(conn, &req.params) {
        return e.response(&req.id);
    }
    let email = match get_required_str(&req.params, "email") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let password = match req.params.get("password").and_then(|v| v.as_str()) {
        Some(v) if v.len() >= MIN_PASSWORD_LEN => v.to_string(),
        Some(_) => {
            return err(
                &req.id,
                "bad_params",
                format!("password must be at least {} characters", MIN_PASSWORD_LEN),
                None,
            )
        }
        None => return err(&req.id, "bad_params", "missing password", None),
    };
    let role = match get_required_str(&req.params, "role") {
        Ok(v) => match Role::parse(&v) {
            Some(r) => r,
            None => return err(&req.id, "bad_params", "role must be admin or student", None),
        },
        Err(e) => return e.response(&req.id),
    };
    let student_id = get_optional_str(&req.params, "studentId");

    if student_id.is_some() && role != Role::Student {
        return err(
            &req.id,
            "bad_params",
            "only student accounts can be linked to a student record",
            None,
        );
    }
    if let Some(sid) = student_id.as_deref() {
        match student::get(conn, sid) {
            Ok(Some(_)) => {}
            Ok(None) => return HandlerErr::not_found("student not found").response(&req.id),
            Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
        }
    }

    match insert_user(conn, &email, &password, role, student_id.as_deref()) {
        Ok(user_id) => {
            // Keep the reverse link on the student row so snapshots show it.
            if let Some(sid) = student_id.as_deref() {
                if let Err(e) = conn.execute(
                    "UPDATE students SET user_id = ? WHERE id = ?",
                    rusqlite::params![user_id, sid],
                ) {
                    return err(&req.id, "db_failed", e.to_string(), None);
                }
            }
            ok(&req.id, json!({ "userId": user_id }))
        }
        Err(e) => e.response(&req.id),
    }
}

fn insert_user(
    conn: &rusqlite::Connection,
    email: &str,
    password: &str,
    role: Role,
    student_id: Option<&str>,
) -> Result<String, HandlerErr> {
    let taken: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE email = ?", [email], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::storage)?;
    if taken.is_some() {
        return Err(HandlerErr::conflict(format!(
            "an account already exists for {}",
            email
        )));
    }

    let user_id = Uuid::new_v4().to_string();
    let salt = auth::new_salt();
    let hash = auth::hash_password(&salt, password);
    conn.execute(
        "INSERT INTO users(id, email, password_salt, password_hash, role, student_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            user_id,
            email,
            salt.as_slice(),
            hash.as_slice(),
            role.as_str(),
            student_id,
            db::now_rfc3339(),
        ],
    )
    .map_err(HandlerErr::storage)?;
    Ok(user_id)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.bootstrap" => Some(handle_bootstrap(state, req)),
        "auth.login" => Some(handle_login(state, req)),
        "auth.logout" => Some(handle_logout(state, req)),
        "auth.whoami" => Some(handle_whoami(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        _ => None,
    }
}
