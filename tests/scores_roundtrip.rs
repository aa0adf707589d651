mod test_support;

use serde_json::json;
use test_support::{
    bootstrap_admin, create_student, open_storage, request_err, request_ok, spawn_sidecar,
    student_login, temp_dir,
};

#[test]
fn upsert_overwrites_and_listing_is_scoped() {
    let workspace = temp_dir("siswadata-scores");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_storage(&mut stdin, &mut reader, &workspace);
    let admin = bootstrap_admin(&mut stdin, &mut reader);
    let first = create_student(
        &mut stdin,
        &mut reader,
        &admin,
        "0055550001",
        "Rudi Hartono",
        json!({}),
    );
    let second = create_student(
        &mut stdin,
        &mut reader,
        &admin,
        "0055550002",
        "Sari Dewi",
        json!({}),
    );

    let inserted = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "scores.upsert",
        json!({
            "token": admin,
            "studentId": first,
            "examKind": "tka",
            "subject": "matematika",
            "score": 78.5
        }),
    );
    let score_id = inserted
        .get("scoreId")
        .and_then(|v| v.as_str())
        .unwrap()
        .to_string();

    // Same (student, exam, subject) overwrites in place.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "scores.upsert",
        json!({
            "token": admin,
            "studentId": first,
            "examKind": "tka",
            "subject": "matematika",
            "score": 91.0
        }),
    );
    assert_eq!(
        updated.get("scoreId").and_then(|v| v.as_str()),
        Some(score_id.as_str())
    );
    assert_eq!(updated.get("score").and_then(|v| v.as_f64()), Some(91.0));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "scores.upsert",
        json!({
            "token": admin,
            "studentId": first,
            "examKind": "pdss",
            "subject": "bahasa indonesia",
            "score": 85.0
        }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "scores.list",
        json!({ "token": admin, "studentId": first }),
    );
    assert_eq!(
        listed.get("scores").and_then(|v| v.as_array()).unwrap().len(),
        2
    );

    // A student sees their own scores and nobody else's.
    let student = student_login(
        &mut stdin,
        &mut reader,
        &admin,
        "rudi@sekolah.sch.id",
        &first,
    );
    let own = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "scores.list",
        json!({ "token": student }),
    );
    assert_eq!(
        own.get("scores").and_then(|v| v.as_array()).unwrap().len(),
        2
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "scores.list",
        json!({ "token": student, "studentId": second }),
    );
    assert_eq!(code, "forbidden");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "scores.upsert",
        json!({
            "token": student,
            "studentId": first,
            "examKind": "tka",
            "subject": "fisika",
            "score": 100.0
        }),
    );
    assert_eq!(code, "forbidden");
}

#[test]
fn upsert_validates_kind_range_and_student() {
    let workspace = temp_dir("siswadata-scores-validate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    open_storage(&mut stdin, &mut reader, &workspace);
    let admin = bootstrap_admin(&mut stdin, &mut reader);
    let student_id = create_student(
        &mut stdin,
        &mut reader,
        &admin,
        "0055550003",
        "Tono Wibowo",
        json!({}),
    );

    let code = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "scores.upsert",
        json!({
            "token": admin,
            "studentId": student_id,
            "examKind": "unbk",
            "subject": "matematika",
            "score": 50.0
        }),
    );
    assert_eq!(code, "bad_params");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "scores.upsert",
        json!({
            "token": admin,
            "studentId": student_id,
            "examKind": "tka",
            "subject": "matematika",
            "score": 120.0
        }),
    );
    assert_eq!(code, "bad_params");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "scores.upsert",
        json!({
            "token": admin,
            "studentId": "missing",
            "examKind": "tka",
            "subject": "matematika",
            "score": 50.0
        }),
    );
    assert_eq!(code, "not_found");

    // Delete closes the loop.
    let inserted = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "scores.upsert",
        json!({
            "token": admin,
            "studentId": student_id,
            "examKind": "tka",
            "subject": "kimia",
            "score": 66.0
        }),
    );
    let score_id = inserted.get("scoreId").and_then(|v| v.as_str()).unwrap();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "scores.delete",
        json!({ "token": admin, "scoreId": score_id }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "scores.delete",
        json!({ "token": admin, "scoreId": score_id }),
    );
    assert_eq!(code, "not_found");
}
