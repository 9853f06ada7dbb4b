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

struct Base {
    school_id: String,
    year_id: String,
    class_id: String,
}

fn setup_base(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> Base {
    let _ = request_ok(
        stdin,
        reader,
        "b1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = request_ok(
        stdin,
        reader,
        "b2",
        "schools.create",
        json!({ "name": "Grade High", "code": "GRD" }),
    );
    let school_id = school["schoolId"].as_str().expect("schoolId").to_string();
    let year = request_ok(
        stdin,
        reader,
        "b3",
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
        stdin,
        reader,
        "b4",
        "classes.create",
        json!({ "schoolId": school_id, "name": "Grade 7" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    Base {
        school_id,
        year_id,
        class_id,
    }
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    base: &Base,
    id: &str,
    admission_no: &str,
) -> String {
    let student = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({
            "schoolId": base.school_id,
            "classId": base.class_id,
            "academicYearId": base.year_id,
            "firstName": "Test",
            "lastName": admission_no,
            "admissionNo": admission_no
        }),
    );
    student["studentId"].as_str().expect("studentId").to_string()
}

#[test]
fn absence_alone_fails_the_exam() {
    let workspace = temp_dir("schoold-absent");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let base = setup_base(&mut stdin, &mut reader, &workspace);
    let present = create_student(&mut stdin, &mut reader, &base, "c1", "P-001");
    let absent = create_student(&mut stdin, &mut reader, &base, "c2", "P-002");

    // Zero thresholds so neither the per-subject rule nor the aggregate rule
    // can fire; only the absence flag can fail a student here.
    let exam = request_ok(
        &mut stdin,
        &mut reader,
        "e1",
        "exams.create",
        json!({
            "schoolId": base.school_id,
            "academicYearId": base.year_id,
            "classId": base.class_id,
            "name": "Retest",
            "passingPercentage": 0.0,
            "subjects": [
                { "subjectName": "Maths", "maxMarks": 100.0, "passingMarks": 0.0 }
            ]
        }),
    );
    let exam_id = exam["examId"].as_str().expect("examId").to_string();
    let subject_id = exam["subjects"][0]["id"].as_str().expect("sid").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "marks.enterBatch",
        json!({
            "examSubjectId": subject_id,
            "marks": [
                { "studentId": present, "marksObtained": 0.0 },
                { "studentId": absent, "isAbsent": true }
            ]
        }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "results.list",
        json!({ "examId": exam_id }),
    );
    let results = listed["results"].as_array().expect("results");
    let absent_row = results
        .iter()
        .find(|r| r["studentId"].as_str() == Some(absent.as_str()))
        .expect("absent row");
    let present_row = results
        .iter()
        .find(|r| r["studentId"].as_str() == Some(present.as_str()))
        .expect("present row");
    assert_eq!(absent_row["status"].as_str(), Some("FAIL"));
    assert_eq!(present_row["status"].as_str(), Some("PASS"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn grade_comes_from_the_matching_band_and_is_null_outside_all_bands() {
    let workspace = temp_dir("schoold-grades");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let base = setup_base(&mut stdin, &mut reader, &workspace);
    let top = create_student(&mut stdin, &mut reader, &base, "c1", "G-001");
    let low = create_student(&mut stdin, &mut reader, &base, "c2", "G-002");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "gradeScales.set",
        json!({
            "schoolId": base.school_id,
            "bands": [
                { "name": "A", "minPercentage": 80.0, "maxPercentage": 100.0, "gradePoint": 4.0 },
                { "name": "B", "minPercentage": 60.0, "maxPercentage": 79.99, "gradePoint": 3.0 }
            ]
        }),
    );

    let exam = request_ok(
        &mut stdin,
        &mut reader,
        "e1",
        "exams.create",
        json!({
            "schoolId": base.school_id,
            "academicYearId": base.year_id,
            "classId": base.class_id,
            "name": "Term 2",
            "passingPercentage": 33.0,
            "subjects": [
                { "subjectName": "English", "maxMarks": 100.0, "passingMarks": 33.0 }
            ]
        }),
    );
    let exam_id = exam["examId"].as_str().expect("examId").to_string();
    let subject_id = exam["subjects"][0]["id"].as_str().expect("sid").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "marks.enterBatch",
        json!({
            "examSubjectId": subject_id,
            "marks": [
                { "studentId": top, "marksObtained": 80.0 },
                { "studentId": low, "marksObtained": 50.0 }
            ]
        }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "results.list",
        json!({ "examId": exam_id }),
    );
    let results = listed["results"].as_array().expect("results");

    let top_row = results
        .iter()
        .find(|r| r["studentId"].as_str() == Some(top.as_str()))
        .expect("top row");
    assert_eq!(top_row["grade"].as_str(), Some("A"), "80% hits the A band's lower edge");
    assert_eq!(top_row["gradePoint"].as_f64(), Some(4.0));

    // 50% falls between the configured bands; grade stays null, no error.
    let low_row = results
        .iter()
        .find(|r| r["studentId"].as_str() == Some(low.as_str()))
        .expect("low row");
    assert!(low_row["grade"].is_null());
    assert!(low_row["gradePoint"].is_null());
    assert_eq!(low_row["status"].as_str(), Some("PASS"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn students_without_any_mark_get_no_result_row() {
    let workspace = temp_dir("schoold-no-marks");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let base = setup_base(&mut stdin, &mut reader, &workspace);
    let marked = create_student(&mut stdin, &mut reader, &base, "c1", "N-001");
    let _unmarked = create_student(&mut stdin, &mut reader, &base, "c2", "N-002");

    let exam = request_ok(
        &mut stdin,
        &mut reader,
        "e1",
        "exams.create",
        json!({
            "schoolId": base.school_id,
            "academicYearId": base.year_id,
            "classId": base.class_id,
            "name": "Quiz",
            "passingPercentage": 33.0,
            "subjects": [
                { "subjectName": "History", "maxMarks": 50.0, "passingMarks": 17.0 }
            ]
        }),
    );
    let exam_id = exam["examId"].as_str().expect("examId").to_string();
    let subject_id = exam["subjects"][0]["id"].as_str().expect("sid").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "marks.enterBatch",
        json!({
            "examSubjectId": subject_id,
            "marks": [{ "studentId": marked, "marksObtained": 40.0 }]
        }),
    );
    let generated = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "results.generate",
        json!({ "examId": exam_id }),
    );
    assert_eq!(generated["resultsComputed"].as_u64(), Some(1));
    assert_eq!(generated["ranked"].as_u64(), Some(1));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "results.list",
        json!({ "examId": exam_id }),
    );
    let results = listed["results"].as_array().expect("results");
    assert_eq!(results.len(), 1, "only the marked student holds a result row");
    assert_eq!(results[0]["percentage"].as_f64(), Some(80.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
