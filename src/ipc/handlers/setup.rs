use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_str, get_required_f64, get_required_str, insert_err_code, require_row, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn handle_schools_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match get_required_str(&req.params, "name") {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        Ok(_) => return err(&req.id, "bad_params", "name must not be empty", None),
        Err(e) => return e.response(&req.id),
    };
    let code = match get_required_str(&req.params, "code") {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        Ok(_) => return err(&req.id, "bad_params", "code must not be empty", None),
        Err(e) => return e.response(&req.id),
    };

    let school_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO schools(id, name, code) VALUES(?, ?, ?)",
        (&school_id, &name, &code),
    ) {
        return err(
            &req.id,
            insert_err_code(&e),
            e.to_string(),
            Some(json!({ "table": "schools", "code": code })),
        );
    }

    ok(&req.id, json!({ "schoolId": school_id, "name": name, "code": code }))
}

fn handle_schools_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "schools": [] }));
    };

    // Counts via correlated subqueries to avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.name,
           s.code,
           (SELECT COUNT(*) FROM classes c WHERE c.school_id = s.id) AS class_count,
           (SELECT COUNT(*) FROM students st WHERE st.school_id = s.id) AS student_count
         FROM schools s
         ORDER BY s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let code: String = row.get(2)?;
            let class_count: i64 = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "code": code,
                "classCount": class_count,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(schools) => ok(&req.id, json!({ "schools": schools })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn parse_iso_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

fn handle_academic_years_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school_id = match get_required_str(&req.params, "schoolId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let start_raw = match get_required_str(&req.params, "startDate") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let end_raw = match get_required_str(&req.params, "endDate") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let start = match parse_iso_date(&start_raw, "startDate") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let end = match parse_iso_date(&end_raw, "endDate") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if end <= start {
        return err(&req.id, "bad_params", "endDate must be after startDate", None);
    }

    if let Err(e) = require_row(conn, "schools", &school_id, "school") {
        return e.response(&req.id);
    }

    let year_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO academic_years(id, school_id, name, start_date, end_date)
         VALUES(?, ?, ?, ?, ?)",
        (&year_id, &school_id, &name, &start_raw, &end_raw),
    ) {
        return err(&req.id, insert_err_code(&e), e.to_string(), None);
    }

    ok(&req.id, json!({ "academicYearId": year_id, "name": name }))
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school_id = match get_required_str(&req.params, "schoolId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match get_required_str(&req.params, "name") {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        Ok(_) => return err(&req.id, "bad_params", "name must not be empty", None),
        Err(e) => return e.response(&req.id),
    };
    let section = get_optional_str(&req.params, "section").unwrap_or_default();

    if let Err(e) = require_row(conn, "schools", &school_id, "school") {
        return e.response(&req.id);
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, school_id, name, section) VALUES(?, ?, ?, ?)",
        (&class_id, &school_id, &name, &section),
    ) {
        return err(
            &req.id,
            insert_err_code(&e),
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(
        &req.id,
        json!({ "classId": class_id, "name": name, "section": section }),
    )
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    let school_id = match get_required_str(&req.params, "schoolId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.section,
           (SELECT COUNT(*) FROM students st WHERE st.current_class_id = c.id) AS student_count
         FROM classes c
         WHERE c.school_id = ?
         ORDER BY c.name, c.section",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&school_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let section: String = row.get(2)?;
            let student_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "section": section,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let academic_year_id = match get_required_str(&req.params, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let first_name = match get_required_str(&req.params, "firstName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let last_name = match get_required_str(&req.params, "lastName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let admission_no = match get_required_str(&req.params, "admissionNo") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    for (table, id, what) in [
        ("schools", school_id.as_str(), "school"),
        ("classes", class_id.as_str(), "class"),
        ("academic_years", academic_year_id.as_str(), "academic year"),
    ] {
        if let Err(e) = require_row(conn, table, id, what) {
            return e.response(&req.id);
        }
    }

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(
            id, school_id, current_class_id, academic_year_id,
            first_name, last_name, admission_no, active)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &school_id,
            &class_id,
            &academic_year_id,
            &first_name,
            &last_name,
            &admission_no,
            active as i64,
        ),
    ) {
        return err(
            &req.id,
            insert_err_code(&e),
            e.to_string(),
            Some(json!({ "table": "students", "admissionNo": admission_no })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, first_name, last_name, admission_no, active
         FROM students
         WHERE current_class_id = ?
         ORDER BY last_name, first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&class_id], |row| {
            let id: String = row.get(0)?;
            let first: String = row.get(1)?;
            let last: String = row.get(2)?;
            let admission_no: String = row.get(3)?;
            let active: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "firstName": first,
                "lastName": last,
                "admissionNo": admission_no,
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

struct BandInput {
    name: String,
    min_percentage: f64,
    max_percentage: f64,
    grade_point: f64,
}

fn parse_band(raw: &serde_json::Value, index: usize) -> Result<BandInput, HandlerErr> {
    let Some(obj) = raw.as_object() else {
        return Err(HandlerErr::bad_params(format!(
            "band at index {} must be an object",
            index
        )));
    };
    let name = obj
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("band at index {} missing name", index)))?;
    let min_percentage = get_required_f64(raw, "minPercentage")?;
    let max_percentage = get_required_f64(raw, "maxPercentage")?;
    let grade_point = get_required_f64(raw, "gradePoint")?;
    if min_percentage > max_percentage {
        return Err(HandlerErr::bad_params(format!(
            "band {} has minPercentage > maxPercentage",
            name
        )));
    }
    if min_percentage < 0.0 || max_percentage > 100.0 {
        return Err(HandlerErr::bad_params(format!(
            "band {} must lie within [0, 100]",
            name
        )));
    }
    Ok(BandInput {
        name,
        min_percentage,
        max_percentage,
        grade_point,
    })
}

fn replace_grade_bands(
    conn: &Connection,
    school_id: &str,
    bands: &[BandInput],
) -> Result<usize, HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    tx.execute("DELETE FROM grade_scales WHERE school_id = ?", [school_id])
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    for band in bands {
        let band_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO grade_scales(
                id, school_id, name, min_percentage, max_percentage, grade_point, active)
             VALUES(?, ?, ?, ?, ?, ?, 1)",
            (
                &band_id,
                school_id,
                &band.name,
                band.min_percentage,
                band.max_percentage,
                band.grade_point,
            ),
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    }

    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    Ok(bands.len())
}

fn handle_grade_scales_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school_id = match get_required_str(&req.params, "schoolId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(bands_arr) = req.params.get("bands").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing bands[]", None);
    };

    if let Err(e) = require_row(conn, "schools", &school_id, "school") {
        return e.response(&req.id);
    }

    let mut bands = Vec::with_capacity(bands_arr.len());
    for (i, raw) in bands_arr.iter().enumerate() {
        match parse_band(raw, i) {
            Ok(b) => bands.push(b),
            Err(e) => return e.response(&req.id),
        }
    }

    match replace_grade_bands(conn, &school_id, &bands) {
        Ok(count) => ok(&req.id, json!({ "bandCount": count })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_grade_scales_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "bands": [] }));
    };

    let school_id = match get_required_str(&req.params, "schoolId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT name, min_percentage, max_percentage, grade_point, active
         FROM grade_scales
         WHERE school_id = ?
         ORDER BY min_percentage DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&school_id], |row| {
            let name: String = row.get(0)?;
            let min: f64 = row.get(1)?;
            let max: f64 = row.get(2)?;
            let gp: f64 = row.get(3)?;
            let active: i64 = row.get(4)?;
            Ok(json!({
                "name": name,
                "minPercentage": min,
                "maxPercentage": max,
                "gradePoint": gp,
                "active": active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(bands) => ok(&req.id, json!({ "bands": bands })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schools.create" => Some(handle_schools_create(state, req)),
        "schools.list" => Some(handle_schools_list(state, req)),
        "academicYears.create" => Some(handle_academic_years_create(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "gradeScales.set" => Some(handle_grade_scales_set(state, req)),
        "gradeScales.list" => Some(handle_grade_scales_list(state, req)),
        _ => None,
    }
}
