#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_siswadatad");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn siswadatad");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "method {} is not implemented",
            method
        );
    }
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result")
}

/// Expect a failure; returns the error code.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

pub fn open_storage(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &Path,
) {
    let _ = request_ok(
        stdin,
        reader,
        "open",
        "storage.open",
        json!({ "path": workspace.to_string_lossy() }),
    );
}

/// Bootstrap the first admin and log in; returns the session token.
pub fn bootstrap_admin(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "bootstrap",
        "auth.bootstrap",
        json!({ "email": "admin@sekolah.sch.id", "password": "admin-secret-1" }),
    );
    let result = request_ok(
        stdin,
        reader,
        "login-admin",
        "auth.login",
        json!({ "email": "admin@sekolah.sch.id", "password": "admin-secret-1" }),
    );
    result
        .get("token")
        .and_then(|v| v.as_str())
        .expect("admin token")
        .to_string()
}

pub fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin_token: &str,
    nisn: &str,
    nama: &str,
    extra: serde_json::Value,
) -> String {
    let mut data = json!({ "nisn": nisn, "nama": nama });
    if let Some(obj) = extra.as_object() {
        for (k, v) in obj {
            data[k] = v.clone();
        }
    }
    let result = request_ok(
        stdin,
        reader,
        &format!("create-{}", nisn),
        "students.create",
        json!({ "token": admin_token, "data": data }),
    );
    result
        .pointer("/student/id")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

/// Create a student-role account linked to a record and log it in.
pub fn student_login(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin_token: &str,
    email: &str,
    student_id: &str,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        &format!("acct-{}", email),
        "users.create",
        json!({
            "token": admin_token,
            "email": email,
            "password": "student-secret-1",
            "role": "student",
            "studentId": student_id,
        }),
    );
    let result = request_ok(
        stdin,
        reader,
        &format!("login-{}", email),
        "auth.login",
        json!({ "email": email, "password": "student-secret-1" }),
    );
    result
        .get("token")
        .and_then(|v| v.as_str())
        .expect("student token")
        .to_string()
}
