mod test_support;

use serde_json::json;
use test_support::{
    bootstrap_admin, create_student, open_storage, request_err, request_ok, spawn_sidecar,
    student_login, temp_dir,
};

#[test]
fn student_verifies_and_admin_resets() {
    let workspace = temp_dir("siswadata-verify");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_storage(&mut stdin, &mut reader, &workspace);
    let admin = bootstrap_admin(&mut stdin, &mut reader);
    let student_id = create_student(
        &mut stdin,
        &mut reader,
        &admin,
        "0052220001",
        "Gita Permata",
        json!({}),
    );
    let student = student_login(
        &mut stdin,
        &mut reader,
        &admin,
        "gita@sekolah.sch.id",
        &student_id,
    );

    let verified = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.verify",
        json!({ "token": student }),
    );
    assert!(verified.get("verifiedAt").and_then(|v| v.as_str()).is_some());

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.get",
        json!({ "token": student }),
    );
    assert_eq!(
        fetched.pointer("/student/isVerified").and_then(|v| v.as_bool()),
        Some(true)
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.resetVerification",
        json!({ "token": admin, "studentId": student_id }),
    );
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.get",
        json!({ "token": admin, "studentId": student_id }),
    );
    assert_eq!(
        fetched.pointer("/student/isVerified").and_then(|v| v.as_bool()),
        Some(false)
    );
    assert!(fetched.pointer("/student/verifiedAt").unwrap().is_null());

    // The reset is on the record even though no field diff exists.
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
        Some("RESET_VERIFICATION")
    );
}

#[test]
fn contact_self_service_is_limited_and_audited() {
    let workspace = temp_dir("siswadata-contact");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_storage(&mut stdin, &mut reader, &workspace);
    let admin = bootstrap_admin(&mut stdin, &mut reader);
    let student_id = create_student(
        &mut stdin,
        &mut reader,
        &admin,
        "0052220002",
        "Hendra Saputra",
        json!({}),
    );
    let student = student_login(
        &mut stdin,
        &mut reader,
        &admin,
        "hendra@sekolah.sch.id",
        &student_id,
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.updateContact",
        json!({ "token": student, "patch": { "no_hp": "0813555666", "email": "hendra@mail.id" } }),
    );

    // Anything beyond contact fields needs a change request.
    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "students.updateContact",
        json!({ "token": student, "patch": { "nama": "Hendra Baru" } }),
    );
    assert_eq!(code, "forbidden");

    let log = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "audit.list",
        json!({ "token": admin, "studentId": student_id }),
    );
    let entries = log.get("entries").and_then(|v| v.as_array()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].get("action").and_then(|v| v.as_str()),
        Some("UPDATE_CONTACT")
    );
    assert_eq!(
        entries[0].get("actorEmail").and_then(|v| v.as_str()),
        Some("hendra@sekolah.sch.id")
    );
}

#[test]
fn students_cannot_read_other_records_or_admin_surfaces() {
    let workspace = temp_dir("siswadata-acl");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_storage(&mut stdin, &mut reader, &workspace);
    let admin = bootstrap_admin(&mut stdin, &mut reader);
    let first = create_student(
        &mut stdin,
        &mut reader,
        &admin,
        "0052220003",
        "Indra Gunawan",
        json!({}),
    );
    let second = create_student(
        &mut stdin,
        &mut reader,
        &admin,
        "0052220004",
        "Joko Susilo",
        json!({}),
    );
    let student = student_login(
        &mut stdin,
        &mut reader,
        &admin,
        "indra@sekolah.sch.id",
        &first,
    );

    let code = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "students.get",
        json!({ "token": student, "studentId": second }),
    );
    assert_eq!(code, "forbidden");

    for method in ["students.list", "requests.list", "audit.list"] {
        let code = request_err(
            &mut stdin,
            &mut reader,
            &format!("gate-{}", method),
            method,
            json!({ "token": student }),
        );
        assert_eq!(code, "forbidden", "{} must be admin-gated", method);
    }
}
