use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_f64, get_optional_str, get_required_f64, get_required_str, require_row, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

/// Every supported exam list filter, spelled out. Absent fields do not
/// constrain the query.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ExamListFilter {
    class_id: Option<String>,
    academic_year_id: Option<String>,
    exam_type: Option<String>,
}

struct SubjectInput {
    subject_name: String,
    max_marks: f64,
    passing_marks: f64,
    is_optional: bool,
}

fn parse_subject(raw: &serde_json::Value, index: usize) -> Result<SubjectInput, HandlerErr> {
    let Some(obj) = raw.as_object() else {
        return Err(HandlerErr::bad_params(format!(
            "subject at index {} must be an object",
            index
        )));
    };
    let subject_name = obj
        .get("subjectName")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            HandlerErr::bad_params(format!("subject at index {} missing subjectName", index))
        })?;
    let max_marks = get_required_f64(raw, "maxMarks")?;
    let passing_marks = get_required_f64(raw, "passingMarks")?;
    if max_marks <= 0.0 {
        return Err(HandlerErr::bad_params(format!(
            "subject {} must have maxMarks > 0",
            subject_name
        )));
    }
    if passing_marks < 0.0 || passing_marks > max_marks {
        return Err(HandlerErr::bad_params(format!(
            "subject {} passingMarks must lie within [0, maxMarks]",
            subject_name
        )));
    }
    let is_optional = obj
        .get("isOptional")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    Ok(SubjectInput {
        subject_name,
        max_marks,
        passing_marks,
        is_optional,
    })
}

fn insert_subject(
    conn: &Connection,
    exam_id: &str,
    subject: &SubjectInput,
) -> Result<String, HandlerErr> {
    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO exam_subjects(
            id, exam_id, subject_name, max_marks, passing_marks, is_optional)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &subject_id,
            exam_id,
            &subject.subject_name,
            subject.max_marks,
            subject.passing_marks,
            subject.is_optional as i64,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    Ok(subject_id)
}

fn handle_exams_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school_id = match get_required_str(&req.params, "schoolId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let academic_year_id = match get_required_str(&req.params, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match get_required_str(&req.params, "name") {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        Ok(_) => return err(&req.id, "bad_params", "name must not be empty", None),
        Err(e) => return e.response(&req.id),
    };
    let exam_type = get_optional_str(&req.params, "examType").unwrap_or_else(|| "TERM".to_string());
    let start_date = get_optional_str(&req.params, "startDate");
    let end_date = get_optional_str(&req.params, "endDate");
    let passing_percentage = get_optional_f64(&req.params, "passingPercentage").unwrap_or(33.0);
    if !(0.0..=100.0).contains(&passing_percentage) {
        return err(
            &req.id,
            "bad_params",
            "passingPercentage must lie within [0, 100]",
            None,
        );
    }

    for (table, id, what) in [
        ("schools", school_id.as_str(), "school"),
        ("academic_years", academic_year_id.as_str(), "academic year"),
        ("classes", class_id.as_str(), "class"),
    ] {
        if let Err(e) = require_row(conn, table, id, what) {
            return e.response(&req.id);
        }
    }

    let mut subjects = Vec::new();
    if let Some(arr) = req.params.get("subjects").and_then(|v| v.as_array()) {
        for (i, raw) in arr.iter().enumerate() {
            match parse_subject(raw, i) {
                Ok(s) => subjects.push(s),
                Err(e) => return e.response(&req.id),
            }
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let exam_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO exams(
            id, school_id, academic_year_id, class_id, name, exam_type,
            start_date, end_date, passing_percentage)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &exam_id,
            &school_id,
            &academic_year_id,
            &class_id,
            &name,
            &exam_type,
            &start_date,
            &end_date,
            passing_percentage,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    let mut subject_ids = Vec::with_capacity(subjects.len());
    for subject in &subjects {
        match insert_subject(&tx, &exam_id, subject) {
            Ok(id) => subject_ids.push(json!({
                "id": id,
                "subjectName": subject.subject_name
            })),
            Err(e) => return e.response(&req.id),
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "examId": exam_id, "subjects": subject_ids }),
    )
}

fn handle_exam_subjects_add(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let subject = match parse_subject(&req.params, 0) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };

    match insert_subject(conn, &exam_id, &subject) {
        Ok(subject_id) => ok(&req.id, json!({ "examSubjectId": subject_id })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_exams_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "exams": [] }));
    };

    let school_id = match get_required_str(&req.params, "schoolId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let filter: ExamListFilter = match serde_json::from_value(req.params.clone()) {
        Ok(f) => f,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };

    let mut sql = String::from(
        "SELECT
           e.id, e.name, e.exam_type, e.class_id, e.academic_year_id,
           e.start_date, e.end_date, e.passing_percentage,
           (SELECT COUNT(*) FROM exam_subjects es WHERE es.exam_id = e.id) AS subject_count
         FROM exams e
         WHERE e.school_id = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(school_id)];
    if let Some(class_id) = filter.class_id {
        sql.push_str(" AND e.class_id = ?");
        binds.push(Value::Text(class_id));
    }
    if let Some(year_id) = filter.academic_year_id {
        sql.push_str(" AND e.academic_year_id = ?");
        binds.push(Value::Text(year_id));
    }
    if let Some(exam_type) = filter.exam_type {
        sql.push_str(" AND e.exam_type = ?");
        binds.push(Value::Text(exam_type));
    }
    sql.push_str(" ORDER BY e.start_date, e.name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map(params_from_iter(binds), |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let exam_type: String = row.get(2)?;
            let class_id: String = row.get(3)?;
            let academic_year_id: String = row.get(4)?;
            let start_date: Option<String> = row.get(5)?;
            let end_date: Option<String> = row.get(6)?;
            let passing_percentage: f64 = row.get(7)?;
            let subject_count: i64 = row.get(8)?;
            Ok(json!({
                "id": id,
                "name": name,
                "examType": exam_type,
                "classId": class_id,
                "academicYearId": academic_year_id,
                "startDate": start_date,
                "endDate": end_date,
                "passingPercentage": passing_percentage,
                "subjectCount": subject_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(exams) => ok(&req.id, json!({ "exams": exams })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.create" => Some(handle_exams_create(state, req)),
        "exams.list" => Some(handle_exams_list(state, req)),
        "examSubjects.add" => Some(handle_exam_subjects_add(state, req)),
        _ => None,
    }
}
