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

fn grade_id_of(saved: &serde_json::Value, index: usize) -> String {
    saved["result"]["results"][index]["grade"]["id"]
        .as_str()
        .expect("grade id")
        .to_string()
}

#[test]
fn scenario_scores_and_double_submit() {
    let workspace = temp_dir("gradebook-lifecycle-scenario");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let sheet = seed(&mut stdin, &mut reader, &workspace);

    let saved = save_rows(
        &mut stdin,
        &mut reader,
        "1",
        &sheet,
        admin(),
        json!([{ "studentId": sheet.students[0], "tx": { "tx1": 8 }, "dk": { "dk1": 6 }, "final": 4 }]),
    );
    assert_eq!(saved["ok"], true, "{}", saved);
    let grade = &saved["result"]["results"][0]["grade"];
    assert_eq!(grade["tbktScore"], 6.67);
    assert_eq!(grade["tbmhScore"], 5.07);
    assert_eq!(grade["classification"], "Average");
    assert_eq!(grade["passed"], true);
    assert_eq!(grade["status"], "DRAFT");
    let grade_id = grade_id_of(&saved, 0);

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.submitForReview",
        json!({ "actor": admin(), "gradeIds": [grade_id] }),
    );
    assert_eq!(submitted["results"][0]["status"], "PENDING_REVIEW");
    assert_eq!(submitted["results"][0]["grade"]["txLocked"], true);
    assert_eq!(
        submitted["results"][0]["eventIds"]
            .as_array()
            .expect("event ids")
            .len(),
        1
    );

    let again = request(
        &mut stdin,
        &mut reader,
        "3",
        "grades.submitForReview",
        json!({ "actor": admin(), "gradeIds": [grade_id] }),
    );
    assert_eq!(error_code(&again), "batch_rejected");
    assert_eq!(
        again["error"]["details"]["errors"][0]["code"],
        "state_guard_violation"
    );

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.history",
        json!({ "gradeId": grade_id }),
    );
    assert_eq!(history["events"].as_array().expect("events").len(), 1);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn gated_final_is_nulled_and_blocks_final_entered() {
    let workspace = temp_dir("gradebook-lifecycle-gated");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let sheet = seed(&mut stdin, &mut reader, &workspace);

    let saved = save_rows(
        &mut stdin,
        &mut reader,
        "1",
        &sheet,
        admin(),
        json!([{ "studentId": sheet.students[0], "tx": { "tx1": 4.5 }, "dk": { "dk1": 4.5 }, "final": 9 }]),
    );
    let grade = &saved["result"]["results"][0]["grade"];
    assert_eq!(grade["tbktScore"], 4.5);
    assert!(grade["finalScore"].is_null());
    assert!(grade["tbmhScore"].is_null());
    assert!(grade["classification"].is_null());
    let grade_id = grade_id_of(&saved, 0);

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.submitForReview",
        json!({ "actor": admin(), "gradeIds": [grade_id] }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.approveTxDk",
        json!({ "actor": admin(), "gradeId": grade_id }),
    );
    let refused = request(
        &mut stdin,
        &mut reader,
        "4",
        "grades.enterFinalScore",
        json!({ "actor": admin(), "gradeId": grade_id, "score": 9 }),
    );
    assert_eq!(error_code(&refused), "state_guard_violation");

    let current = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.get",
        json!({ "gradeId": grade_id }),
    );
    assert_eq!(current["status"], "APPROVED_TX_DK");
    assert!(current["finalScore"].is_null());

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn finalized_grade_is_sealed_until_emergency_unlock() {
    let workspace = temp_dir("gradebook-lifecycle-finalize");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let sheet = seed(&mut stdin, &mut reader, &workspace);

    let saved = save_rows(
        &mut stdin,
        &mut reader,
        "1",
        &sheet,
        admin(),
        json!([{ "studentId": sheet.students[0], "tx": { "tx1": 8 }, "dk": { "dk1": 6 } }]),
    );
    let grade_id = grade_id_of(&saved, 0);
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.submitForReview",
        json!({ "actor": admin(), "gradeIds": [grade_id] }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.approveTxDk",
        json!({ "actor": admin(), "gradeId": grade_id }),
    );
    let entered = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.enterFinalScore",
        json!({ "actor": admin(), "gradeId": grade_id, "score": 4 }),
    );
    assert_eq!(entered["status"], "FINAL_ENTERED");
    let sealed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.finalizeLock",
        json!({ "actor": admin(), "gradeId": grade_id }),
    );
    assert_eq!(sealed["status"], "FINALIZED");
    assert_eq!(sealed["grade"]["finalLocked"], true);

    let edit = request(
        &mut stdin,
        &mut reader,
        "6",
        "grades.enterFinalScore",
        json!({ "actor": admin(), "gradeId": grade_id, "score": 9 }),
    );
    assert_eq!(error_code(&edit), "state_guard_violation");
    let sheet_edit = save_rows(
        &mut stdin,
        &mut reader,
        "7",
        &sheet,
        admin(),
        json!([{ "studentId": sheet.students[0], "tx": { "tx1": 10 } }]),
    );
    assert_eq!(error_code(&sheet_edit), "batch_rejected");

    let can = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.canEdit",
        json!({ "actor": admin(), "gradeId": grade_id }),
    );
    assert_eq!(can["tx"], false);
    assert_eq!(can["dk"], false);
    assert_eq!(can["final"], false);

    let no_reason = request(
        &mut stdin,
        &mut reader,
        "9",
        "grades.emergencyUnlock",
        json!({ "actor": admin(), "gradeId": grade_id, "field": "final" }),
    );
    assert_eq!(error_code(&no_reason), "validation_error");
    let not_admin = request(
        &mut stdin,
        &mut reader,
        "10",
        "grades.emergencyUnlock",
        json!({ "actor": instructor(), "gradeId": grade_id, "field": "final", "reason": "x" }),
    );
    assert_eq!(error_code(&not_admin), "state_guard_violation");

    let unlocked = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grades.emergencyUnlock",
        json!({ "actor": admin(), "gradeId": grade_id, "field": "final", "reason": "appeal upheld" }),
    );
    assert_eq!(unlocked["status"], "FINALIZED");
    assert_eq!(unlocked["grade"]["finalLocked"], false);

    let can = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "grades.canEdit",
        json!({ "actor": admin(), "gradeId": grade_id }),
    );
    assert_eq!(can["final"], true);
    assert_eq!(can["tx"], false);

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "grades.history",
        json!({ "gradeId": grade_id }),
    );
    let events = history["events"].as_array().expect("events");
    let last = events.last().expect("last event");
    assert_eq!(last["kind"], "override");
    assert_eq!(last["fromState"], last["toState"]);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn reject_requires_reason_and_reopens_draft() {
    let workspace = temp_dir("gradebook-lifecycle-reject");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let sheet = seed(&mut stdin, &mut reader, &workspace);

    let saved = save_rows(
        &mut stdin,
        &mut reader,
        "1",
        &sheet,
        admin(),
        json!([{ "studentId": sheet.students[1], "tx": { "tx1": 7 }, "dk": { "dk1": 7 } }]),
    );
    let grade_id = grade_id_of(&saved, 0);
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.submitForReview",
        json!({ "actor": admin(), "gradeIds": [grade_id] }),
    );
    let blank = request(
        &mut stdin,
        &mut reader,
        "3",
        "grades.rejectToDraft",
        json!({ "actor": admin(), "gradeId": grade_id, "reason": "   " }),
    );
    assert_eq!(error_code(&blank), "validation_error");

    let rejected = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.rejectToDraft",
        json!({ "actor": admin(), "gradeId": grade_id, "reason": "dk1 mistyped" }),
    );
    assert_eq!(rejected["status"], "DRAFT");
    assert_eq!(rejected["grade"]["txLocked"], false);
    assert_eq!(rejected["grade"]["dkLocked"], false);

    drop(stdin);
    let _ = child.wait();
}
