use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, require_row, row_exists, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ATTENDANCE_STATUSES: [&str; 4] = ["PRESENT", "ABSENT", "LATE", "HALF_DAY"];
const HOLIDAY_STATUS: &str = "HOLIDAY";

fn parse_iso_date(raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params("date must be YYYY-MM-DD"))
}

fn handle_holidays_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school_id = match get_required_str(&req.params, "schoolId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let date = match get_required_str(&req.params, "date") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = parse_iso_date(&date) {
        return e.response(&req.id);
    }
    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    if let Err(e) = require_row(conn, "schools", &school_id, "school") {
        return e.response(&req.id);
    }

    let holiday_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO holidays(id, school_id, date, name) VALUES(?, ?, ?, ?)
         ON CONFLICT(school_id, date) DO UPDATE SET name = excluded.name",
        (&holiday_id, &school_id, &date, &name),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "date": date, "name": name }))
}

fn is_holiday(conn: &Connection, school_id: &str, date: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT name FROM holidays WHERE school_id = ? AND date = ?",
        (school_id, date),
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn upsert_attendance(
    conn: &Connection,
    school_id: &str,
    class_id: &str,
    student_id: &str,
    date: &str,
    status: &str,
) -> Result<(), HandlerErr> {
    let record_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendance_records(id, school_id, class_id, student_id, date, status)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_id, student_id, date) DO UPDATE SET
           status = excluded.status",
        (&record_id, school_id, class_id, student_id, date, status),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    Ok(())
}

fn handle_attendance_bulk_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school_id = match get_required_str(&req.params, "schoolId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let date = match get_required_str(&req.params, "date") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = parse_iso_date(&date) {
        return e.response(&req.id);
    }
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing entries[]", None);
    };

    for (table, id, what) in [
        ("schools", school_id.as_str(), "school"),
        ("classes", class_id.as_str(), "class"),
    ] {
        if let Err(e) = require_row(conn, table, id, what) {
            return e.response(&req.id);
        }
    }

    let holiday = match is_holiday(conn, &school_id, &date) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // On a holiday the submitted statuses are ignored wholesale; every
    // student in the batch is recorded as HOLIDAY.
    let mut parsed: Vec<(String, String)> = Vec::with_capacity(entries.len());
    for (i, raw) in entries.iter().enumerate() {
        let Some(obj) = raw.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("entry at index {} must be an object", i),
                None,
            );
        };
        let Some(student_id) = obj.get("studentId").and_then(|v| v.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                format!("entry at index {} missing studentId", i),
                None,
            );
        };
        let status = if holiday.is_some() {
            HOLIDAY_STATUS.to_string()
        } else {
            let raw_status = obj
                .get("status")
                .and_then(|v| v.as_str())
                .map(|s| s.to_ascii_uppercase());
            let Some(raw_status) = raw_status else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("entry at index {} missing status", i),
                    None,
                );
            };
            if !ATTENDANCE_STATUSES.contains(&raw_status.as_str()) {
                return err(
                    &req.id,
                    "bad_params",
                    format!("entry at index {} has unknown status", i),
                    Some(json!({ "status": raw_status })),
                );
            }
            raw_status
        };
        parsed.push((student_id.to_string(), status));
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut marked: usize = 0;
    let mut skipped: Vec<String> = Vec::new();
    for (student_id, status) in &parsed {
        match row_exists(&tx, "students", student_id) {
            Ok(true) => {}
            Ok(false) => {
                skipped.push(student_id.clone());
                continue;
            }
            Err(e) => return e.response(&req.id),
        }
        if let Err(e) = upsert_attendance(&tx, &school_id, &class_id, student_id, &date, status) {
            return e.response(&req.id);
        }
        marked += 1;
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "date": date,
            "marked": marked,
            "skipped": skipped,
            "holiday": holiday
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "holidays.add" => Some(handle_holidays_add(state, req)),
        "attendance.bulkMark" => Some(handle_attendance_bulk_mark(state, req)),
        _ => None,
    }
}
