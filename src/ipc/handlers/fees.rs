use crate::fees::{expand_items, structure_total, FeeItem, Frequency};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_f64, get_optional_i64, get_required_f64, get_required_str, insert_err_code,
    require_row, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::results::round2;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn parse_item(raw: &serde_json::Value, index: usize) -> Result<FeeItem, HandlerErr> {
    let Some(obj) = raw.as_object() else {
        return Err(HandlerErr::bad_params(format!(
            "item at index {} must be an object",
            index
        )));
    };
    let category = obj
        .get("category")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("item at index {} missing category", index)))?;
    let amount = get_required_f64(raw, "amount")?;
    if amount <= 0.0 {
        return Err(HandlerErr::bad_params(format!(
            "item {} must have amount > 0",
            category
        )));
    }
    let freq_raw = obj
        .get("frequency")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params(format!("item {} missing frequency", category)))?;
    let frequency = Frequency::parse(freq_raw).ok_or_else(|| {
        HandlerErr::bad_params(format!(
            "item {} frequency must be one of MONTHLY, QUARTERLY, HALF_YEARLY, YEARLY, ONE_TIME",
            category
        ))
        .with_details(json!({ "frequency": freq_raw }))
    })?;
    Ok(FeeItem {
        category,
        amount,
        frequency,
    })
}

fn handle_fee_structures_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let name = match get_required_str(&req.params, "name") {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        Ok(_) => return err(&req.id, "bad_params", "name must not be empty", None),
        Err(e) => return e.response(&req.id),
    };
    let due_day = get_optional_i64(&req.params, "dueDay").unwrap_or(10);
    if !(1..=31).contains(&due_day) {
        return err(&req.id, "bad_params", "dueDay must lie within [1, 31]", None);
    }
    let late_fee_amount = get_optional_f64(&req.params, "lateFeeAmount").unwrap_or(0.0);
    let grace_period_days = get_optional_i64(&req.params, "gracePeriodDays").unwrap_or(0);
    if late_fee_amount < 0.0 || grace_period_days < 0 {
        return err(
            &req.id,
            "bad_params",
            "lateFeeAmount and gracePeriodDays must not be negative",
            None,
        );
    }

    let Some(items_arr) = req.params.get("items").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing items[]", None);
    };
    if items_arr.is_empty() {
        return err(&req.id, "bad_params", "items[] must not be empty", None);
    }

    for (table, id, what) in [
        ("schools", school_id.as_str(), "school"),
        ("classes", class_id.as_str(), "class"),
        ("academic_years", academic_year_id.as_str(), "academic year"),
    ] {
        if let Err(e) = require_row(conn, table, id, what) {
            return e.response(&req.id);
        }
    }

    let mut items = Vec::with_capacity(items_arr.len());
    for (i, raw) in items_arr.iter().enumerate() {
        match parse_item(raw, i) {
            Ok(it) => items.push(it),
            Err(e) => return e.response(&req.id),
        }
    }

    // The declared total is fixed at creation; installment generation must
    // reproduce exactly this figure per assignment.
    let total_amount = structure_total(&items);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let structure_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO fee_structures(
            id, school_id, class_id, academic_year_id, name,
            due_day, late_fee_amount, grace_period_days, total_amount)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &structure_id,
            &school_id,
            &class_id,
            &academic_year_id,
            &name,
            due_day,
            late_fee_amount,
            grace_period_days,
            total_amount,
        ),
    ) {
        return err(
            &req.id,
            insert_err_code(&e),
            e.to_string(),
            Some(json!({ "table": "fee_structures" })),
        );
    }

    for item in &items {
        let item_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO fee_structure_items(id, fee_structure_id, category, amount, frequency)
             VALUES(?, ?, ?, ?, ?)",
            (
                &item_id,
                &structure_id,
                &item.category,
                item.amount,
                item.frequency.as_str(),
            ),
        ) {
            return err(&req.id, insert_err_code(&e), e.to_string(), None);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "feeStructureId": structure_id,
            "totalAmount": total_amount,
            "itemCount": items.len()
        }),
    )
}

fn handle_fee_structures_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "feeStructures": [] }));
    };

    let school_id = match get_required_str(&req.params, "schoolId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT
           f.id, f.class_id, f.academic_year_id, f.name, f.due_day,
           f.late_fee_amount, f.grace_period_days, f.total_amount,
           (SELECT COUNT(*) FROM fee_structure_items i WHERE i.fee_structure_id = f.id)
         FROM fee_structures f
         WHERE f.school_id = ?
         ORDER BY f.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&school_id], |row| {
            let id: String = row.get(0)?;
            let class_id: String = row.get(1)?;
            let academic_year_id: String = row.get(2)?;
            let name: String = row.get(3)?;
            let due_day: i64 = row.get(4)?;
            let late_fee_amount: f64 = row.get(5)?;
            let grace_period_days: i64 = row.get(6)?;
            let total_amount: f64 = row.get(7)?;
            let item_count: i64 = row.get(8)?;
            Ok(json!({
                "id": id,
                "classId": class_id,
                "academicYearId": academic_year_id,
                "name": name,
                "dueDay": due_day,
                "lateFeeAmount": late_fee_amount,
                "gracePeriodDays": grace_period_days,
                "totalAmount": total_amount,
                "itemCount": item_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(structures) => ok(&req.id, json!({ "feeStructures": structures })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn load_structure_items(
    conn: &Connection,
    structure_id: &str,
) -> Result<Vec<FeeItem>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT category, amount, frequency
             FROM fee_structure_items
             WHERE fee_structure_id = ?
             ORDER BY rowid",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let raw_items = stmt
        .query_map([structure_id], |r| {
            let category: String = r.get(0)?;
            let amount: f64 = r.get(1)?;
            let frequency: String = r.get(2)?;
            Ok((category, amount, frequency))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut items = Vec::with_capacity(raw_items.len());
    for (category, amount, frequency) in raw_items {
        let frequency = Frequency::parse(&frequency).ok_or_else(|| {
            HandlerErr::db(
                "db_query_failed",
                format!("stored frequency is invalid: {}", frequency),
            )
        })?;
        items.push(FeeItem {
            category,
            amount,
            frequency,
        });
    }
    Ok(items)
}

fn handle_student_fees_assign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let structure_id = match get_required_str(&req.params, "feeStructureId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let discount_amount = get_optional_f64(&req.params, "discountAmount").unwrap_or(0.0);
    if discount_amount < 0.0 {
        return err(&req.id, "bad_params", "discountAmount must not be negative", None);
    }

    if let Err(e) = require_row(conn, "students", &student_id, "student") {
        return e.response(&req.id);
    }

    let structure: Option<(String, i64, f64)> = match conn
        .query_row(
            "SELECT academic_year_id, due_day, total_amount FROM fee_structures WHERE id = ?",
            [&structure_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((academic_year_id, due_day, declared_total)) = structure else {
        return err(&req.id, "not_found", "fee structure not found", None);
    };
    if discount_amount > declared_total {
        return err(
            &req.id,
            "bad_params",
            "discountAmount exceeds the structure total",
            None,
        );
    }

    let already: Option<String> = match conn
        .query_row(
            "SELECT id FROM student_fees WHERE student_id = ? AND fee_structure_id = ?",
            (&student_id, &structure_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(existing) = already {
        return err(
            &req.id,
            "conflict",
            "fee structure already assigned to student",
            Some(json!({ "studentFeeId": existing })),
        );
    }

    let year_start_raw: Option<String> = match conn
        .query_row(
            "SELECT start_date FROM academic_years WHERE id = ?",
            [&academic_year_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(year_start_raw) = year_start_raw else {
        return err(&req.id, "not_found", "academic year not found", None);
    };
    let year_start = match NaiveDate::parse_from_str(&year_start_raw, "%Y-%m-%d") {
        Ok(v) => v,
        Err(_) => {
            return err(
                &req.id,
                "db_query_failed",
                "stored academic year start date is invalid",
                Some(json!({ "startDate": year_start_raw })),
            )
        }
    };

    let items = match load_structure_items(conn, &structure_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let planned = match expand_items(&items, year_start, due_day as u32) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let total_amount = round2(planned.iter().map(|p| p.amount).sum());
    let balance_amount = round2(total_amount - discount_amount);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let student_fee_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO student_fees(
            id, student_id, fee_structure_id, academic_year_id,
            total_amount, discount_amount, paid_amount, balance_amount, status)
         VALUES(?, ?, ?, ?, ?, ?, 0, ?, 'PENDING')",
        (
            &student_fee_id,
            &student_id,
            &structure_id,
            &academic_year_id,
            total_amount,
            discount_amount,
            balance_amount,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    for p in &planned {
        let detail_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO student_fee_details(
                id, student_fee_id, category, period_label, amount,
                paid_amount, due_date, status)
             VALUES(?, ?, ?, ?, ?, 0, ?, 'PENDING')",
            (
                &detail_id,
                &student_fee_id,
                &p.category,
                &p.period_label,
                p.amount,
                p.due_date.format("%Y-%m-%d").to_string(),
            ),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "studentFeeId": student_fee_id,
            "totalAmount": total_amount,
            "balanceAmount": balance_amount,
            "detailCount": planned.len()
        }),
    )
}

fn handle_student_fees_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_fee_id = match get_required_str(&req.params, "studentFeeId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let parent = match conn
        .query_row(
            "SELECT student_id, fee_structure_id, academic_year_id,
                    total_amount, discount_amount, paid_amount, balance_amount, status
             FROM student_fees WHERE id = ?",
            [&student_fee_id],
            |r| {
                Ok(json!({
                    "id": student_fee_id,
                    "studentId": r.get::<_, String>(0)?,
                    "feeStructureId": r.get::<_, String>(1)?,
                    "academicYearId": r.get::<_, String>(2)?,
                    "totalAmount": r.get::<_, f64>(3)?,
                    "discountAmount": r.get::<_, f64>(4)?,
                    "paidAmount": r.get::<_, f64>(5)?,
                    "balanceAmount": r.get::<_, f64>(6)?,
                    "status": r.get::<_, String>(7)?
                }))
            },
        )
        .optional()
    {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "student fee not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, category, period_label, amount, paid_amount, due_date, status
         FROM student_fee_details
         WHERE student_fee_id = ?
         ORDER BY due_date, rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let details = stmt
        .query_map([&student_fee_id], |row| {
            let id: String = row.get(0)?;
            let category: String = row.get(1)?;
            let period_label: String = row.get(2)?;
            let amount: f64 = row.get(3)?;
            let paid_amount: f64 = row.get(4)?;
            let due_date: String = row.get(5)?;
            let status: String = row.get(6)?;
            Ok(json!({
                "id": id,
                "category": category,
                "periodLabel": period_label,
                "amount": amount,
                "paidAmount": paid_amount,
                "dueDate": due_date,
                "status": status
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match details {
        Ok(details) => ok(&req.id, json!({ "studentFee": parent, "details": details })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "feeStructures.create" => Some(handle_fee_structures_create(state, req)),
        "feeStructures.list" => Some(handle_fee_structures_list(state, req)),
        "studentFees.assign" => Some(handle_student_fees_assign(state, req)),
        "studentFees.get" => Some(handle_student_fees_get(state, req)),
        _ => None,
    }
}
