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

struct Assigned {
    student_fee_id: String,
    detail_ids: Vec<String>,
}

/// One student with a half-yearly fee: two installments of 2000 each.
fn setup_assigned_fee(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> Assigned {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = request_ok(
        stdin,
        reader,
        "s2",
        "schools.create",
        json!({ "name": "Direct High", "code": "DIR" }),
    );
    let school_id = school["schoolId"].as_str().expect("schoolId").to_string();
    let year = request_ok(
        stdin,
        reader,
        "s3",
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
        "s4",
        "classes.create",
        json!({ "schoolId": school_id, "name": "Grade 4" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let student = request_ok(
        stdin,
        reader,
        "s5",
        "students.create",
        json!({
            "schoolId": school_id,
            "classId": class_id,
            "academicYearId": year_id,
            "firstName": "Direct",
            "lastName": "Payer",
            "admissionNo": "D-001"
        }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();

    let structure = request_ok(
        stdin,
        reader,
        "s6",
        "feeStructures.create",
        json!({
            "schoolId": school_id,
            "classId": class_id,
            "academicYearId": year_id,
            "name": "Half-yearly tuition",
            "items": [
                { "category": "TUITION", "amount": 2000.0, "frequency": "HALF_YEARLY" }
            ]
        }),
    );
    let structure_id = structure["feeStructureId"].as_str().expect("id").to_string();

    let assigned = request_ok(
        stdin,
        reader,
        "s7",
        "studentFees.assign",
        json!({ "studentId": student_id, "feeStructureId": structure_id }),
    );
    let student_fee_id = assigned["studentFeeId"].as_str().expect("id").to_string();

    let got = request_ok(
        stdin,
        reader,
        "s8",
        "studentFees.get",
        json!({ "studentFeeId": student_fee_id }),
    );
    let detail_ids = got["details"]
        .as_array()
        .expect("details")
        .iter()
        .map(|d| d["id"].as_str().expect("detail id").to_string())
        .collect::<Vec<_>>();
    assert_eq!(detail_ids.len(), 2);

    Assigned {
        student_fee_id,
        detail_ids,
    }
}

#[test]
fn full_direct_payment_marks_only_that_installment_paid() {
    let workspace = temp_dir("schoold-direct-full");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let a = setup_assigned_fee(&mut stdin, &mut reader, &workspace);

    let payment = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "payments.record",
        json!({
            "detailId": a.detail_ids[1],
            "amount": 2000.0,
            "method": "BANK",
            "transactionRef": "TXN-42"
        }),
    );
    let allocations = payment["allocations"].as_array().expect("allocations");
    assert_eq!(allocations.len(), 1);
    assert_eq!(
        allocations[0]["detailId"].as_str(),
        Some(a.detail_ids[1].as_str()),
        "direct payment never spills into other installments"
    );
    assert_eq!(payment["status"].as_str(), Some("PARTIAL"));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "studentFees.get",
        json!({ "studentFeeId": a.student_fee_id }),
    );
    let details = got["details"].as_array().expect("details");
    assert_eq!(details[0]["status"].as_str(), Some("PENDING"));
    assert_eq!(details[1]["status"].as_str(), Some("PAID"));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "payments.list",
        json!({ "studentFeeId": a.student_fee_id, "method": "BANK" }),
    );
    let payments = listed["payments"].as_array().expect("payments");
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0]["transactionRef"].as_str(), Some("TXN-42"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn overpaying_one_installment_is_rejected_without_mutation() {
    let workspace = temp_dir("schoold-direct-overpay");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let a = setup_assigned_fee(&mut stdin, &mut reader, &workspace);

    let rejected = request(
        &mut stdin,
        &mut reader,
        "p1",
        "payments.record",
        json!({ "detailId": a.detail_ids[0], "amount": 2000.01 }),
    );
    assert_eq!(rejected["ok"].as_bool(), Some(false));
    assert_eq!(rejected["error"]["code"].as_str(), Some("bad_params"));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "studentFees.get",
        json!({ "studentFeeId": a.student_fee_id }),
    );
    assert_eq!(got["studentFee"]["paidAmount"].as_f64(), Some(0.0));
    for d in got["details"].as_array().expect("details") {
        assert_eq!(d["paidAmount"].as_f64(), Some(0.0));
        assert_eq!(d["status"].as_str(), Some("PENDING"));
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn partial_then_top_up_settles_the_installment() {
    let workspace = temp_dir("schoold-direct-topup");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let a = setup_assigned_fee(&mut stdin, &mut reader, &workspace);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "payments.record",
        json!({ "detailId": a.detail_ids[0], "amount": 1200.0 }),
    );
    // The remaining 800 is the most a second direct payment may carry.
    let rejected = request(
        &mut stdin,
        &mut reader,
        "p2",
        "payments.record",
        json!({ "detailId": a.detail_ids[0], "amount": 900.0 }),
    );
    assert_eq!(rejected["error"]["code"].as_str(), Some("bad_params"));

    let settled = request_ok(
        &mut stdin,
        &mut reader,
        "p3",
        "payments.record",
        json!({ "detailId": a.detail_ids[0], "amount": 800.0 }),
    );
    assert_eq!(settled["paidAmount"].as_f64(), Some(2000.0));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "studentFees.get",
        json!({ "studentFeeId": a.student_fee_id }),
    );
    let details = got["details"].as_array().expect("details");
    assert_eq!(details[0]["status"].as_str(), Some("PAID"));
    assert_eq!(details[0]["paidAmount"].as_f64(), Some(2000.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn non_positive_amounts_are_rejected() {
    let workspace = temp_dir("schoold-direct-zero");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let a = setup_assigned_fee(&mut stdin, &mut reader, &workspace);

    for (id, amount) in [("p1", 0.0), ("p2", -50.0)] {
        let rejected = request(
            &mut stdin,
            &mut reader,
            id,
            "payments.record",
            json!({ "detailId": a.detail_ids[0], "amount": amount }),
        );
        assert_eq!(rejected["ok"].as_bool(), Some(false));
        assert_eq!(rejected["error"]["code"].as_str(), Some("bad_params"));
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
