mod test_support;

use serde_json::json;
use test_support::{
    bootstrap_admin, create_student, open_storage, request_err, request_ok, spawn_sidecar,
    student_login, temp_dir,
};

#[test]
fn full_workflow_from_request_to_validate() {
    let workspace = temp_dir("siswadata-workflow-roundtrip");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_storage(&mut stdin, &mut reader, &workspace);
    let admin = bootstrap_admin(&mut stdin, &mut reader);
    let student_id = create_student(
        &mut stdin,
        &mut reader,
        &admin,
        "0051234567",
        "Budi Santoso",
        json!({ "alamat": "Jl. A" }),
    );
    let student = student_login(
        &mut stdin,
        &mut reader,
        &admin,
        "budi@sekolah.sch.id",
        &student_id,
    );

    // Student files the request; the original snapshot is frozen in.
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "requests.create",
        json!({ "token": student, "reason": "alamat salah" }),
    );
    let request_id = created
        .pointer("/request/id")
        .and_then(|v| v.as_str())
        .expect("request id")
        .to_string();
    assert_eq!(
        created.pointer("/request/status").and_then(|v| v.as_str()),
        Some("requested")
    );
    assert_eq!(
        created
            .pointer("/request/originalData/alamat")
            .and_then(|v| v.as_str()),
        Some("Jl. A")
    );

    // A second request while the first is active must be refused.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "requests.create",
        json!({ "token": student, "reason": "dobel" }),
    );
    assert_eq!(code, "conflict");

    let acted = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "requests.action",
        json!({ "token": admin, "requestId": request_id, "action": "approve_edit" }),
    );
    assert_eq!(acted.get("status").and_then(|v| v.as_str()), Some("editing"));

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "requests.submit",
        json!({ "token": student, "requestId": request_id, "data": { "alamat": "Jl. B" } }),
    );
    assert_eq!(
        submitted.get("status").and_then(|v| v.as_str()),
        Some("review")
    );

    let validated = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "requests.action",
        json!({ "token": admin, "requestId": request_id, "action": "validate" }),
    );
    assert_eq!(
        validated.get("status").and_then(|v| v.as_str()),
        Some("approved")
    );

    // The proposed field landed; untouched fields stayed put.
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.get",
        json!({ "token": admin, "studentId": student_id }),
    );
    assert_eq!(
        fetched.pointer("/student/alamat").and_then(|v| v.as_str()),
        Some("Jl. B")
    );
    assert_eq!(
        fetched.pointer("/student/nama").and_then(|v| v.as_str()),
        Some("Budi Santoso")
    );

    // Terminal request: the student may file again now.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "requests.create",
        json!({ "token": student, "reason": "satu lagi" }),
    );
    assert_eq!(
        again.pointer("/request/status").and_then(|v| v.as_str()),
        Some("requested")
    );
    // And its snapshot reflects the post-validate record.
    assert_eq!(
        again
            .pointer("/request/originalData/alamat")
            .and_then(|v| v.as_str()),
        Some("Jl. B")
    );
}

#[test]
fn validate_writes_one_audit_entry_with_the_diff() {
    let workspace = temp_dir("siswadata-workflow-audit");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_storage(&mut stdin, &mut reader, &workspace);
    let admin = bootstrap_admin(&mut stdin, &mut reader);
    let student_id = create_student(
        &mut stdin,
        &mut reader,
        &admin,
        "0059990001",
        "Siti Aminah",
        json!({ "alamat": "Jl. Lama", "kota": "Bogor" }),
    );
    let student = student_login(
        &mut stdin,
        &mut reader,
        &admin,
        "siti@sekolah.sch.id",
        &student_id,
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "requests.create",
        json!({ "token": student, "reason": "pindah rumah" }),
    );
    let request_id = created
        .pointer("/request/id")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "requests.action",
        json!({ "token": admin, "requestId": request_id, "action": "approve_edit" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "requests.submit",
        json!({
            "token": student,
            "requestId": request_id,
            "data": { "alamat": "Jl. Baru", "kota": "Depok" }
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "requests.action",
        json!({ "token": admin, "requestId": request_id, "action": "validate" }),
    );

    let log = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "audit.list",
        json!({ "token": admin, "studentId": student_id }),
    );
    let entries = log.get("entries").and_then(|v| v.as_array()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].get("action").and_then(|v| v.as_str()),
        Some("VALIDATE")
    );
    let changes = entries[0].get("changes").and_then(|v| v.as_object()).unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes["alamat"]["old"], "Jl. Lama");
    assert_eq!(changes["alamat"]["new"], "Jl. Baru");
    assert_eq!(changes["kota"]["new"], "Depok");
}
