use crate::fees::{
    allocation_plan, apply_to_detail, next_receipt_no, outstanding_details, recompute_student_fee,
    AllocationSlice,
};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_f64, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::{NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

const MONEY_EPS: f64 = 1e-6;

/// Every supported payment list filter, spelled out.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PaymentListFilter {
    student_fee_id: Option<String>,
    method: Option<String>,
}

struct PaymentRow {
    id: String,
    receipt_no: String,
    paid_at: String,
}

fn insert_payment(
    conn: &Connection,
    student_fee_id: &str,
    amount: f64,
    method: &str,
    transaction_ref: Option<&str>,
    paid_on: NaiveDate,
    slices: &[AllocationSlice],
) -> Result<PaymentRow, HandlerErr> {
    let payment_id = Uuid::new_v4().to_string();
    let receipt_no = next_receipt_no(paid_on);
    let paid_at = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO fee_payments(
            id, student_fee_id, amount, method, transaction_ref, receipt_no, paid_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &payment_id,
            student_fee_id,
            amount,
            method,
            transaction_ref,
            &receipt_no,
            &paid_at,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e))?;

    for slice in slices {
        let split_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO fee_payment_details(id, fee_payment_id, student_fee_detail_id, amount)
             VALUES(?, ?, ?, ?)",
            (&split_id, &payment_id, &slice.detail_id, slice.amount),
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
    }

    Ok(PaymentRow {
        id: payment_id,
        receipt_no,
        paid_at,
    })
}

fn parse_paid_on(params: &serde_json::Value) -> Result<NaiveDate, HandlerErr> {
    match params.get("paidDate").and_then(|v| v.as_str()) {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| HandlerErr::bad_params("paidDate must be YYYY-MM-DD")),
        None => Ok(Utc::now().date_naive()),
    }
}

fn handle_payments_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let amount = match get_required_f64(&req.params, "amount") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if amount <= 0.0 {
        return err(
            &req.id,
            "bad_params",
            "amount must be > 0",
            Some(json!({ "amount": amount })),
        );
    }
    let method = get_optional_str(&req.params, "method").unwrap_or_else(|| "CASH".to_string());
    let transaction_ref = get_optional_str(&req.params, "transactionRef");
    let paid_on = match parse_paid_on(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // A named installment means a direct payment; otherwise the amount is
    // auto-allocated oldest-first across the parent's outstanding rows.
    if let Some(detail_id) = get_optional_str(&req.params, "detailId") {
        record_direct(
            conn,
            &req.id,
            &detail_id,
            amount,
            &method,
            transaction_ref.as_deref(),
            paid_on,
        )
    } else {
        let student_fee_id = match get_required_str(&req.params, "studentFeeId") {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
        record_auto(
            conn,
            &req.id,
            &student_fee_id,
            amount,
            &method,
            transaction_ref.as_deref(),
            paid_on,
        )
    }
}

fn record_direct(
    conn: &Connection,
    req_id: &str,
    detail_id: &str,
    amount: f64,
    method: &str,
    transaction_ref: Option<&str>,
    paid_on: NaiveDate,
) -> serde_json::Value {
    let detail: Option<(String, f64, f64)> = match conn
        .query_row(
            "SELECT student_fee_id, amount, paid_amount FROM student_fee_details WHERE id = ?",
            [detail_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(req_id, "db_query_failed", e.to_string(), None),
    };
    let Some((student_fee_id, detail_amount, detail_paid)) = detail else {
        return err(req_id, "not_found", "fee installment not found", None);
    };

    let remaining = detail_amount - detail_paid;
    if amount > remaining + MONEY_EPS {
        return err(
            req_id,
            "bad_params",
            "amount exceeds the installment's remaining balance",
            Some(json!({ "amount": amount, "remaining": remaining })),
        );
    }

    // Installment amounts sum to the undiscounted total, so on a discounted
    // fee the parent balance is the tighter cap. balance_amount never goes
    // negative.
    let parent_balance: f64 = match conn.query_row(
        "SELECT balance_amount FROM student_fees WHERE id = ?",
        [&student_fee_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(req_id, "db_query_failed", e.to_string(), None),
    };
    if amount > parent_balance + MONEY_EPS {
        return err(
            req_id,
            "bad_params",
            "amount exceeds the fee's remaining balance",
            Some(json!({ "amount": amount, "balance": parent_balance })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(req_id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = apply_to_detail(&tx, detail_id, amount) {
        return err(req_id, "db_query_failed", e.to_string(), None);
    }
    let slices = vec![AllocationSlice {
        detail_id: detail_id.to_string(),
        amount,
    }];
    let payment = match insert_payment(
        &tx,
        &student_fee_id,
        amount,
        method,
        transaction_ref,
        paid_on,
        &slices,
    ) {
        Ok(p) => p,
        Err(e) => return e.response(req_id),
    };
    let aggregates = match recompute_student_fee(&tx, &student_fee_id) {
        Ok(a) => a,
        Err(e) => return err(req_id, "db_query_failed", e.to_string(), None),
    };

    if let Err(e) = tx.commit() {
        return err(req_id, "db_tx_failed", e.to_string(), None);
    }

    ok(
        req_id,
        json!({
            "paymentId": payment.id,
            "receiptNo": payment.receipt_no,
            "paidAt": payment.paid_at,
            "allocations": [{ "detailId": detail_id, "amount": amount }],
            "paidAmount": aggregates.paid_amount,
            "balanceAmount": aggregates.balance_amount,
            "status": aggregates.status
        }),
    )
}

fn record_auto(
    conn: &Connection,
    req_id: &str,
    student_fee_id: &str,
    amount: f64,
    method: &str,
    transaction_ref: Option<&str>,
    paid_on: NaiveDate,
) -> serde_json::Value {
    let parent_balance: Option<f64> = match conn
        .query_row(
            "SELECT balance_amount FROM student_fees WHERE id = ?",
            [student_fee_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(req_id, "db_query_failed", e.to_string(), None),
    };
    let Some(parent_balance) = parent_balance else {
        return err(req_id, "not_found", "student fee not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(req_id, "db_tx_failed", e.to_string(), None),
    };

    let outstanding = match outstanding_details(&tx, student_fee_id) {
        Ok(v) => v,
        Err(e) => return err(req_id, "db_query_failed", e.to_string(), None),
    };
    // Installment remainders sum to the undiscounted total; the parent balance
    // already nets out the discount and is the binding cap. balance_amount
    // never goes negative.
    let total_outstanding: f64 = outstanding.iter().map(|d| d.remaining).sum();
    let payable = total_outstanding.min(parent_balance);
    if amount > payable + MONEY_EPS {
        return err(
            req_id,
            "bad_params",
            "amount exceeds the total outstanding balance",
            Some(json!({ "amount": amount, "outstanding": payable })),
        );
    }

    let ordered: Vec<(String, f64)> = outstanding
        .into_iter()
        .map(|d| (d.id, d.remaining))
        .collect();
    let plan = allocation_plan(&ordered, amount);

    for slice in &plan {
        if let Err(e) = apply_to_detail(&tx, &slice.detail_id, slice.amount) {
            return err(req_id, "db_query_failed", e.to_string(), None);
        }
    }

    let payment = match insert_payment(
        &tx,
        student_fee_id,
        amount,
        method,
        transaction_ref,
        paid_on,
        &plan,
    ) {
        Ok(p) => p,
        Err(e) => return e.response(req_id),
    };
    let aggregates = match recompute_student_fee(&tx, student_fee_id) {
        Ok(a) => a,
        Err(e) => return err(req_id, "db_query_failed", e.to_string(), None),
    };

    if let Err(e) = tx.commit() {
        return err(req_id, "db_tx_failed", e.to_string(), None);
    }

    let allocations: Vec<serde_json::Value> = plan
        .iter()
        .map(|s| json!({ "detailId": s.detail_id, "amount": s.amount }))
        .collect();

    ok(
        req_id,
        json!({
            "paymentId": payment.id,
            "receiptNo": payment.receipt_no,
            "paidAt": payment.paid_at,
            "allocations": allocations,
            "paidAmount": aggregates.paid_amount,
            "balanceAmount": aggregates.balance_amount,
            "status": aggregates.status
        }),
    )
}

fn handle_payments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "payments": [] }));
    };

    let filter: PaymentListFilter = match serde_json::from_value(req.params.clone()) {
        Ok(f) => f,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };

    let mut sql = String::from(
        "SELECT id, student_fee_id, amount, method, transaction_ref, receipt_no, paid_at
         FROM fee_payments
         WHERE 1 = 1",
    );
    let mut binds: Vec<Value> = Vec::new();
    if let Some(student_fee_id) = filter.student_fee_id {
        sql.push_str(" AND student_fee_id = ?");
        binds.push(Value::Text(student_fee_id));
    }
    if let Some(method) = filter.method {
        sql.push_str(" AND method = ?");
        binds.push(Value::Text(method));
    }
    sql.push_str(" ORDER BY paid_at, rowid");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map(params_from_iter(binds), |row| {
            let id: String = row.get(0)?;
            let student_fee_id: String = row.get(1)?;
            let amount: f64 = row.get(2)?;
            let method: String = row.get(3)?;
            let transaction_ref: Option<String> = row.get(4)?;
            let receipt_no: String = row.get(5)?;
            let paid_at: String = row.get(6)?;
            Ok(json!({
                "id": id,
                "studentFeeId": student_fee_id,
                "amount": amount,
                "method": method,
                "transactionRef": transaction_ref,
                "receiptNo": receipt_no,
                "paidAt": paid_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(payments) => ok(&req.id, json!({ "payments": payments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "payments.record" => Some(handle_payments_record(state, req)),
        "payments.list" => Some(handle_payments_list(state, req)),
        _ => None,
    }
}
