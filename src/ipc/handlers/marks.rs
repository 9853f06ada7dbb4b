use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, require_row, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::results;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

const MARKS_BATCH_MAX_ENTRIES: usize = 5000;

struct MarkInput {
    student_id: String,
    marks_obtained: f64,
    is_absent: bool,
    remark: Option<String>,
}

fn parse_mark(raw: &serde_json::Value, index: usize, max_marks: f64) -> Result<MarkInput, HandlerErr> {
    let Some(obj) = raw.as_object() else {
        return Err(HandlerErr::bad_params(format!(
            "mark at index {} must be an object",
            index
        )));
    };
    let student_id = obj
        .get("studentId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("mark at index {} missing studentId", index)))?;
    let is_absent = obj
        .get("isAbsent")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    // Absent rows default to zero marks obtained.
    let marks_obtained = match obj.get("marksObtained").and_then(|v| v.as_f64()) {
        Some(v) => v,
        None if is_absent => 0.0,
        None => {
            return Err(HandlerErr::bad_params(format!(
                "mark at index {} missing marksObtained",
                index
            )))
        }
    };
    if marks_obtained < 0.0 {
        return Err(HandlerErr::bad_params(format!(
            "mark at index {} must not be negative",
            index
        ))
        .with_details(json!({ "marksObtained": marks_obtained })));
    }
    if marks_obtained > max_marks {
        return Err(HandlerErr::bad_params(format!(
            "mark at index {} exceeds subject maxMarks",
            index
        ))
        .with_details(json!({ "marksObtained": marks_obtained, "maxMarks": max_marks })));
    }
    let remark = obj
        .get("remark")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Ok(MarkInput {
        student_id,
        marks_obtained,
        is_absent,
        remark,
    })
}

fn upsert_mark(conn: &Connection, exam_subject_id: &str, mark: &MarkInput) -> Result<(), HandlerErr> {
    let mark_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO student_marks(
            id, exam_subject_id, student_id, marks_obtained, is_absent, remark)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(exam_subject_id, student_id) DO UPDATE SET
           marks_obtained = excluded.marks_obtained,
           is_absent = excluded.is_absent,
           remark = excluded.remark",
        (
            &mark_id,
            exam_subject_id,
            &mark.student_id,
            mark.marks_obtained,
            mark.is_absent as i64,
            &mark.remark,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    Ok(())
}

fn handle_marks_enter_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let exam_subject_id = match get_required_str(&req.params, "examSubjectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(marks_arr) = req.params.get("marks").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing marks[]", None);
    };
    if marks_arr.len() > MARKS_BATCH_MAX_ENTRIES {
        return err(
            &req.id,
            "bad_params",
            "marks batch is too large",
            Some(json!({
                "entries": marks_arr.len(),
                "maxEntries": MARKS_BATCH_MAX_ENTRIES
            })),
        );
    }

    let subject: Option<(String, f64)> = match conn
        .query_row(
            "SELECT exam_id, max_marks FROM exam_subjects WHERE id = ?",
            [&exam_subject_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((exam_id, max_marks)) = subject else {
        return err(&req.id, "not_found", "exam subject not found", None);
    };

    // Validate every entry before touching the database; only unknown
    // students are a partial-success case, invalid values fail the batch.
    let mut parsed = Vec::with_capacity(marks_arr.len());
    for (i, raw) in marks_arr.iter().enumerate() {
        match parse_mark(raw, i, max_marks) {
            Ok(m) => parsed.push(m),
            Err(e) => return e.response(&req.id),
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut entered: usize = 0;
    let mut skipped: Vec<String> = Vec::new();
    let mut affected: HashSet<String> = HashSet::new();

    for mark in &parsed {
        let known: Result<bool, HandlerErr> =
            crate::ipc::helpers::row_exists(&tx, "students", &mark.student_id);
        match known {
            Ok(true) => {}
            Ok(false) => {
                skipped.push(mark.student_id.clone());
                continue;
            }
            Err(e) => return e.response(&req.id),
        }
        if let Err(e) = upsert_mark(&tx, &exam_subject_id, mark) {
            return e.response(&req.id);
        }
        affected.insert(mark.student_id.clone());
        entered += 1;
    }

    let summary = match results::recompute_exam_results(&tx, &exam_id, Some(&affected)) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "examId": exam_id,
            "entered": entered,
            "skipped": skipped,
            "resultsComputed": summary.computed,
            "ranked": summary.ranked
        }),
    )
}

fn handle_results_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let exam_id = match get_required_str(&req.params, "examId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_row(conn, "exams", &exam_id, "exam") {
        return e.response(&req.id);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let summary = match results::recompute_exam_results(&tx, &exam_id, None) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "examId": exam_id,
            "resultsComputed": summary.computed,
            "skippedNoMarks": summary.skipped_no_marks,
            "ranked": summary.ranked
        }),
    )
}

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "results": [] }));
    };

    let exam_id = match get_required_str(&req.params, "examId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_row(conn, "exams", &exam_id, "exam") {
        return e.response(&req.id);
    }

    let mut stmt = match conn.prepare(
        "SELECT r.student_id, s.first_name, s.last_name,
                r.total_marks, r.max_marks, r.percentage,
                r.grade, r.grade_point, r.status, r.rank
         FROM student_results r
         JOIN students s ON s.id = r.student_id
         WHERE r.exam_id = ?
         ORDER BY r.rank",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&exam_id], |row| {
            let student_id: String = row.get(0)?;
            let first: String = row.get(1)?;
            let last: String = row.get(2)?;
            let total_marks: f64 = row.get(3)?;
            let max_marks: f64 = row.get(4)?;
            let percentage: f64 = row.get(5)?;
            let grade: Option<String> = row.get(6)?;
            let grade_point: Option<f64> = row.get(7)?;
            let status: String = row.get(8)?;
            let rank: Option<i64> = row.get(9)?;
            Ok(json!({
                "studentId": student_id,
                "studentName": format!("{}, {}", last, first),
                "totalMarks": total_marks,
                "maxMarks": max_marks,
                "percentage": percentage,
                "grade": grade,
                "gradePoint": grade_point,
                "status": status,
                "rank": rank
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(results) => ok(&req.id, json!({ "results": results })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.enterBatch" => Some(handle_marks_enter_batch(state, req)),
        "results.generate" => Some(handle_results_generate(state, req)),
        "results.list" => Some(handle_results_list(state, req)),
        _ => None,
    }
}
