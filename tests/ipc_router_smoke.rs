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
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
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

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("schoold-router-smoke");
    let bundle_out = workspace.join("smoke-backup.schoolbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let school = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "schools.create",
        json!({ "name": "Smoke High", "code": "SMK" }),
    );
    let school_id = school
        .get("schoolId")
        .and_then(|v| v.as_str())
        .expect("schoolId")
        .to_string();

    let year = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "academicYears.create",
        json!({
            "schoolId": school_id,
            "name": "2025-26",
            "startDate": "2025-04-01",
            "endDate": "2026-03-31"
        }),
    );
    let year_id = year
        .get("academicYearId")
        .and_then(|v| v.as_str())
        .expect("academicYearId")
        .to_string();

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.create",
        json!({ "schoolId": school_id, "name": "Grade 8", "section": "A" }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let _ = request_ok(&mut stdin, &mut reader, "6", "schools.list", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "classes.list",
        json!({ "schoolId": school_id }),
    );

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({
            "schoolId": school_id,
            "classId": class_id,
            "academicYearId": year_id,
            "firstName": "Smoke",
            "lastName": "Student",
            "admissionNo": "S-001"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.list",
        json!({ "classId": class_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "gradeScales.set",
        json!({
            "schoolId": school_id,
            "bands": [
                { "name": "A", "minPercentage": 80.0, "maxPercentage": 100.0, "gradePoint": 4.0 },
                { "name": "B", "minPercentage": 40.0, "maxPercentage": 79.99, "gradePoint": 3.0 }
            ]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "gradeScales.list",
        json!({ "schoolId": school_id }),
    );

    let exam = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "exams.create",
        json!({
            "schoolId": school_id,
            "academicYearId": year_id,
            "classId": class_id,
            "name": "Term 1",
            "passingPercentage": 40.0,
            "subjects": [
                { "subjectName": "Maths", "maxMarks": 100.0, "passingMarks": 40.0 }
            ]
        }),
    );
    let exam_id = exam
        .get("examId")
        .and_then(|v| v.as_str())
        .expect("examId")
        .to_string();
    let subject_id = exam
        .get("subjects")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("subject id")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "exams.list",
        json!({ "schoolId": school_id, "classId": class_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "marks.enterBatch",
        json!({
            "examSubjectId": subject_id,
            "marks": [{ "studentId": student_id, "marksObtained": 72.0 }]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "results.generate",
        json!({ "examId": exam_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "results.list",
        json!({ "examId": exam_id }),
    );

    let structure = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "feeStructures.create",
        json!({
            "schoolId": school_id,
            "classId": class_id,
            "academicYearId": year_id,
            "name": "Grade 8 fees",
            "items": [
                { "category": "TUITION", "amount": 1000.0, "frequency": "MONTHLY" }
            ]
        }),
    );
    let structure_id = structure
        .get("feeStructureId")
        .and_then(|v| v.as_str())
        .expect("feeStructureId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "feeStructures.list",
        json!({ "schoolId": school_id }),
    );

    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "studentFees.assign",
        json!({ "studentId": student_id, "feeStructureId": structure_id }),
    );
    let student_fee_id = assigned
        .get("studentFeeId")
        .and_then(|v| v.as_str())
        .expect("studentFeeId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "studentFees.get",
        json!({ "studentFeeId": student_fee_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "payments.record",
        json!({ "studentFeeId": student_fee_id, "amount": 500.0 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "payments.list",
        json!({ "studentFeeId": student_fee_id }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "23",
        "holidays.add",
        json!({ "schoolId": school_id, "date": "2025-08-15", "name": "Independence Day" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "24",
        "attendance.bulkMark",
        json!({
            "schoolId": school_id,
            "classId": class_id,
            "date": "2025-08-14",
            "entries": [{ "studentId": student_id, "status": "PRESENT" }]
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "25",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "outPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "26",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "inPath": bundle_out.to_string_lossy()
        }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn duplicate_unique_keys_come_back_as_conflict() {
    let workspace = temp_dir("schoold-conflict");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schools.create",
        json!({ "name": "Twin High", "code": "TWN" }),
    );
    let school_id = school["schoolId"].as_str().expect("schoolId").to_string();

    let dup_school = request(
        &mut stdin,
        &mut reader,
        "3",
        "schools.create",
        json!({ "name": "Other Twin", "code": "TWN" }),
    );
    assert_eq!(dup_school["ok"].as_bool(), Some(false));
    assert_eq!(dup_school["error"]["code"].as_str(), Some("conflict"));

    let year = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "academicYears.create",
        json!({
            "schoolId": school_id,
            "name": "2025-26",
            "startDate": "2025-04-01",
            "endDate": "2026-03-31"
        }),
    );
    let year_id = year["academicYearId"].as_str().expect("yearId").to_string();
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.create",
        json!({ "schoolId": school_id, "name": "Grade 1" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({
            "schoolId": school_id,
            "classId": class_id,
            "academicYearId": year_id,
            "firstName": "One",
            "lastName": "Twin",
            "admissionNo": "T-001"
        }),
    );
    let dup_student = request(
        &mut stdin,
        &mut reader,
        "7",
        "students.create",
        json!({
            "schoolId": school_id,
            "classId": class_id,
            "academicYearId": year_id,
            "firstName": "Two",
            "lastName": "Twin",
            "admissionNo": "T-001"
        }),
    );
    assert_eq!(dup_student["ok"].as_bool(), Some(false));
    assert_eq!(dup_student["error"]["code"].as_str(), Some("conflict"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
