use chrono::{Duration, Utc};
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
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
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

struct Sheet {
    class_id: String,
    subject_id: String,
    cohort_id: String,
    semester_id: String,
    students: Vec<String>,
}

fn admin() -> serde_json::Value {
    json!({ "id": "admin-1", "role": "admin" })
}

fn instructor() -> serde_json::Value {
    json!({ "id": "instructor-1", "role": "instructor" })
}

fn seed(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> Sheet {
    request_ok(
        stdin,
        reader,
        "seed-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let id_of = |v: serde_json::Value| v["id"].as_str().expect("id").to_string();
    let class_id = id_of(request_ok(stdin, reader, "seed-c", "roster.createClass", json!({ "name": "CS-1" })));
    let subject_id = id_of(request_ok(
        stdin,
        reader,
        "seed-s",
        "roster.createSubject",
        json!({ "code": "MATH1", "name": "Calculus" }),
    ));
    let cohort_id = id_of(request_ok(stdin, reader, "seed-k", "roster.createCohort", json!({ "name": "K20" })));
    let semester_id = id_of(request_ok(
        stdin,
        reader,
        "seed-m",
        "roster.createSemester",
        json!({ "name": "HK1", "academicYear": "2025-2026" }),
    ));
    let students = (1..=3)
        .map(|i| {
            id_of(request_ok(
                stdin,
                reader,
                &format!("seed-st{}", i),
                "roster.createStudent",
                json!({ "code": format!("S00{}", i), "fullName": format!("Student {}", i) }),
            ))
        })
        .collect();
    Sheet {
        class_id,
        subject_id,
        cohort_id,
        semester_id,
        students,
    }
}

fn save_rows(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    sheet: &Sheet,
    actor: serde_json::Value,
    rows: serde_json::Value,
) -> serde_json::Value {
    request(
        stdin,
        reader,
        id,
        "grades.bulkSaveScores",
        json!({
            "actor": actor,
            "classId": sheet.class_id,
            "subjectId": sheet.subject_id,
            "cohortId": sheet.cohort_id,
            "semesterId": sheet.semester_id,
            "rows": rows,
        }),
    )
}

fn ids_of(items: &serde_json::Value, field: &str) -> Vec<String> {
    let mut out: Vec<String> = items
        .as_array()
        .expect("array")
        .iter()
        .map(|v| v[field].as_str().expect("string field").to_string())
        .collect();
    out.sort();
    out.dedup();
    out
}

#[test]
fn wildcard_grant_scopes_instructor_until_it_expires() {
    let workspace = temp_dir("gradebook-permissions-scope");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let sheet = seed(&mut stdin, &mut reader, &workspace);

    let refused = save_rows(
        &mut stdin,
        &mut reader,
        "1",
        &sheet,
        instructor(),
        json!([{ "studentId": sheet.students[0], "tx": { "tx1": 8 }, "dk": { "dk1": 6 } }]),
    );
    assert_eq!(error_code(&refused), "batch_rejected");
    assert_eq!(
        refused["error"]["details"]["errors"][0]["code"],
        "state_guard_violation"
    );

    let now = Utc::now();
    let grant = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "permissions.grant",
        json!({
            "actor": admin(),
            "grant": {
                "granteeId": "instructor-1",
                "classId": null,
                "subjectId": sheet.subject_id,
                "semesterId": sheet.semester_id,
                "validFrom": (now - Duration::days(1)).to_rfc3339(),
                "validTo": (now + Duration::days(30)).to_rfc3339()
            }
        }),
    );
    assert_eq!(grant["status"], "active");
    let grant_id = grant["id"].as_str().expect("grant id").to_string();

    let second_class = request_ok(&mut stdin, &mut reader, "3", "roster.createClass", json!({ "name": "CS-2" }));
    let other_subject = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "roster.createSubject",
        json!({ "code": "PHYS1", "name": "Physics" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "roster.enroll",
        json!({
            "studentId": sheet.students[1],
            "classId": second_class["id"],
            "subjectId": sheet.subject_id,
            "cohortId": sheet.cohort_id,
            "semesterId": sheet.semester_id
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "roster.enroll",
        json!({
            "studentId": sheet.students[2],
            "classId": sheet.class_id,
            "subjectId": other_subject["id"],
            "cohortId": sheet.cohort_id,
            "semesterId": sheet.semester_id
        }),
    );

    let saved = save_rows(
        &mut stdin,
        &mut reader,
        "7",
        &sheet,
        instructor(),
        json!([{ "studentId": sheet.students[0], "tx": { "tx1": 8 }, "dk": { "dk1": 6 } }]),
    );
    assert_eq!(saved["ok"], true, "{}", saved);
    let grade_id = saved["result"]["results"][0]["grade"]["id"]
        .as_str()
        .expect("grade id")
        .to_string();

    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "permissions.resolve",
        json!({ "granteeId": "instructor-1" }),
    );
    let enrollments = &resolved["enrollments"];
    assert_eq!(enrollments.as_array().expect("enrollments").len(), 2);
    assert_eq!(ids_of(enrollments, "subjectId"), vec![sheet.subject_id.clone()]);
    let mut classes = vec![
        sheet.class_id.clone(),
        second_class["id"].as_str().expect("class id").to_string(),
    ];
    classes.sort();
    assert_eq!(ids_of(enrollments, "classId"), classes);

    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.submitForReview",
        json!({ "actor": instructor(), "gradeIds": [grade_id] }),
    );
    let approve = request(
        &mut stdin,
        &mut reader,
        "10",
        "grades.approveTxDk",
        json!({ "actor": instructor(), "gradeId": grade_id }),
    );
    assert_eq!(error_code(&approve), "state_guard_violation");

    let visible = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.list",
        json!({ "actor": instructor() }),
    );
    assert_eq!(visible["grades"].as_array().expect("grades").len(), 1);

    let later = (now + Duration::days(31)).to_rfc3339();
    let future = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "permissions.resolve",
        json!({ "granteeId": "instructor-1", "at": later }),
    );
    assert!(future["clauses"].as_array().expect("clauses").is_empty());
    assert!(future["enrollments"].as_array().expect("enrollments").is_empty());

    let revoke = request(
        &mut stdin,
        &mut reader,
        "13",
        "permissions.revoke",
        json!({ "actor": instructor(), "grantId": grant_id }),
    );
    assert_eq!(error_code(&revoke), "state_guard_violation");

    let swept = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "permissions.expireSweep",
        json!({ "at": later }),
    );
    assert_eq!(swept["expired"], 1);
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "permissions.list",
        json!({ "granteeId": "instructor-1" }),
    );
    assert_eq!(listed["grants"][0]["status"], "expired");

    let audit = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "audit.list",
        json!({ "entity": "permission_grant", "entityId": grant_id }),
    );
    assert_eq!(audit["entries"][0]["action"], "grant");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn revoked_grant_no_longer_resolves() {
    let workspace = temp_dir("gradebook-permissions-revoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let sheet = seed(&mut stdin, &mut reader, &workspace);

    let now = Utc::now();
    let grant = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "permissions.grant",
        json!({
            "actor": admin(),
            "grant": {
                "granteeId": "instructor-1",
                "classId": sheet.class_id,
                "subjectId": sheet.subject_id,
                "semesterId": sheet.semester_id,
                "validFrom": (now - Duration::days(1)).to_rfc3339(),
                "validTo": (now + Duration::days(1)).to_rfc3339()
            }
        }),
    );
    let revoked = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "permissions.revoke",
        json!({ "actor": admin(), "grantId": grant["id"] }),
    );
    assert_eq!(revoked["status"], "revoked");

    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "permissions.resolve",
        json!({ "granteeId": "instructor-1" }),
    );
    assert!(resolved["clauses"].as_array().expect("clauses").is_empty());

    let bad_window = request(
        &mut stdin,
        &mut reader,
        "4",
        "permissions.grant",
        json!({
            "actor": admin(),
            "grant": {
                "granteeId": "instructor-1",
                "semesterId": sheet.semester_id,
                "validFrom": now.to_rfc3339(),
                "validTo": (now - Duration::days(1)).to_rfc3339()
            }
        }),
    );
    assert_eq!(error_code(&bad_window), "validation_error");

    drop(stdin);
    let _ = child.wait();
}
