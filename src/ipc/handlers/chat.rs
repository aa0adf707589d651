use serde_json::{json, Value};

use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::guard::{require_admin, require_auth};
use crate::ipc::params::get_required_str;
use crate::ipc::types::{AppState, Request};
use crate::llm::{self, ChatConfig};
use crate::student;

const PROVIDER_KEY: &str = "chat.provider";

fn handle_configure(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    if let Err(e) = require_admin(conn, &req.params) {
        return e.response(&req.id);
    }
    let Some(provider) = req.params.get("provider") else {
        return err(&req.id, "bad_params", "missing provider", None);
    };
    if ChatConfig::from_settings(provider).is_none() {
        return err(
            &req.id,
            "bad_params",
            "provider must carry baseUrl, apiKey, and model",
            None,
        );
    }
    match db::settings_set_json(conn, PROVIDER_KEY, provider) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_failed", e.to_string(), None),
    }
}

fn parse_history(params: &Value) -> Result<Vec<(String, String)>, HandlerErr> {
    let Some(raw) = params.get("history") else {
        return Ok(Vec::new());
    };
    let Some(items) = raw.as_array() else {
        return Err(HandlerErr::bad_params("history must be an array"));
    };
    let mut out = Vec::new();
    for item in items {
        let role = item.get("role").and_then(|v| v.as_str());
        let content = item.get("content").and_then(|v| v.as_str());
        match (role, content) {
            (Some(role), Some(content)) if role == "user" || role == "assistant" => {
                out.push((role.to_string(), content.to_string()));
            }
            _ => {
                return Err(HandlerErr::bad_params(
                    "history entries must be {role: user|assistant, content: string}",
                ))
            }
        }
    }
    Ok(out)
}

fn handle_send(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "open a storage workspace first", None);
    };
    let identity = match require_auth(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let message = match get_required_str(&req.params, "message") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let history = match parse_history(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let cfg = match db::settings_get_json(conn, PROVIDER_KEY) {
        Ok(Some(v)) => ChatConfig::from_settings(&v),
        Ok(None) => None,
        Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
    };
    let Some(cfg) = cfg else {
        return HandlerErr::upstream("chat provider is not configured").response(&req.id);
    };

    // Ground the assistant with the caller's own record when one is linked.
    let context = match identity.student_id.as_deref() {
        Some(sid) => match student::get(conn, sid) {
            Ok(Some(s)) => Some(format!(
                "The user is a student with this record:\n{}",
                serde_json::to_string_pretty(&s.to_json()).unwrap_or_default()
            )),
            Ok(None) => None,
            Err(e) => return err(&req.id, "db_failed", e.to_string(), None),
        },
        None => None,
    };

    match llm::chat(&cfg, context.as_deref(), &history, &message) {
        Ok(reply) => ok(&req.id, json!({ "reply": reply })),
        Err(e) => HandlerErr::upstream(e.to_string()).response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "chat.configure" => Some(handle_configure(state, req)),
        "chat.send" => Some(handle_send(state, req)),
        _ => None,
    }
}
