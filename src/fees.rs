use anyhow::anyhow;
use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::results::round2;

const MONEY_EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Monthly,
    Quarterly,
    HalfYearly,
    Yearly,
    OneTime,
}

impl Frequency {
    pub fn parse(s: &str) -> Option<Frequency> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MONTHLY" => Some(Frequency::Monthly),
            "QUARTERLY" => Some(Frequency::Quarterly),
            "HALF_YEARLY" => Some(Frequency::HalfYearly),
            "YEARLY" => Some(Frequency::Yearly),
            "ONE_TIME" => Some(Frequency::OneTime),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Monthly => "MONTHLY",
            Frequency::Quarterly => "QUARTERLY",
            Frequency::HalfYearly => "HALF_YEARLY",
            Frequency::Yearly => "YEARLY",
            Frequency::OneTime => "ONE_TIME",
        }
    }

    /// Billing periods per academic year.
    pub fn periods(&self) -> u32 {
        match self {
            Frequency::Monthly => 12,
            Frequency::Quarterly => 4,
            Frequency::HalfYearly => 2,
            Frequency::Yearly | Frequency::OneTime => 1,
        }
    }

    fn month_step(&self) -> u32 {
        match self {
            Frequency::Monthly => 1,
            Frequency::Quarterly => 3,
            Frequency::HalfYearly => 6,
            Frequency::Yearly | Frequency::OneTime => 12,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeeItem {
    pub category: String,
    pub amount: f64,
    pub frequency: Frequency,
}

#[derive(Debug, Clone)]
pub struct PlannedInstallment {
    pub category: String,
    pub period_label: String,
    pub amount: f64,
    pub due_date: NaiveDate,
}

/// Declared annual total of a structure: each item's amount times its number
/// of billing periods. Installment generation must reproduce exactly this sum.
pub fn structure_total(items: &[FeeItem]) -> f64 {
    round2(
        items
            .iter()
            .map(|it| it.amount * it.frequency.periods() as f64)
            .sum(),
    )
}

fn days_in_month(year: i32, month: u32) -> anyhow::Result<u32> {
    let (ny, nm) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let first_of_next = NaiveDate::from_ymd_opt(ny, nm, 1)
        .ok_or_else(|| anyhow!("invalid month {}-{}", year, month))?;
    let last = first_of_next
        .pred_opt()
        .ok_or_else(|| anyhow!("invalid month {}-{}", year, month))?;
    Ok(last.day())
}

fn add_months(year: i32, month: u32, offset: u32) -> (i32, u32) {
    let zero_based = (month - 1) + offset;
    (year + (zero_based / 12) as i32, (zero_based % 12) + 1)
}

/// Expand a structure's items into dated installments across the academic
/// year starting at `year_start`. One row per billing period per category;
/// the due day is clamped to the length of the target month.
pub fn expand_items(
    items: &[FeeItem],
    year_start: NaiveDate,
    due_day: u32,
) -> anyhow::Result<Vec<PlannedInstallment>> {
    let mut planned = Vec::new();
    for item in items {
        let step = item.frequency.month_step();
        for i in 0..item.frequency.periods() {
            let (year, month) = add_months(year_start.year(), year_start.month(), i * step);
            let day = due_day.clamp(1, days_in_month(year, month)?);
            let due_date = NaiveDate::from_ymd_opt(year, month, day)
                .ok_or_else(|| anyhow!("invalid due date {}-{}-{}", year, month, day))?;
            planned.push(PlannedInstallment {
                category: item.category.clone(),
                period_label: format!("{:04}-{:02}", year, month),
                amount: round2(item.amount),
                due_date,
            });
        }
    }
    Ok(planned)
}

/// One slice of an auto-allocated payment.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationSlice {
    pub detail_id: String,
    pub amount: f64,
}

/// Greedy oldest-first allocation: settle each outstanding installment in
/// order, capping the last touched one at its remaining balance. Callers
/// reject amounts exceeding the total outstanding before asking for a plan.
pub fn allocation_plan(outstanding: &[(String, f64)], amount: f64) -> Vec<AllocationSlice> {
    let mut left = amount;
    let mut slices = Vec::new();
    for (detail_id, remaining) in outstanding {
        if left <= MONEY_EPS {
            break;
        }
        if *remaining <= MONEY_EPS {
            continue;
        }
        let applied = left.min(*remaining);
        slices.push(AllocationSlice {
            detail_id: detail_id.clone(),
            amount: round2(applied),
        });
        left -= applied;
    }
    slices
}

#[derive(Debug, Clone)]
pub struct OutstandingDetail {
    pub id: String,
    pub remaining: f64,
}

/// Non-fully-paid installments, oldest due date first.
pub fn outstanding_details(
    conn: &Connection,
    student_fee_id: &str,
) -> anyhow::Result<Vec<OutstandingDetail>> {
    let mut stmt = conn.prepare(
        "SELECT id, amount - paid_amount
         FROM student_fee_details
         WHERE student_fee_id = ? AND amount - paid_amount > ?
         ORDER BY due_date, rowid",
    )?;
    let rows = stmt
        .query_map((student_fee_id, MONEY_EPS), |r| {
            Ok(OutstandingDetail {
                id: r.get(0)?,
                remaining: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Apply one slice to an installment and refresh its status.
pub fn apply_to_detail(conn: &Connection, detail_id: &str, amount: f64) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE student_fee_details
         SET paid_amount = paid_amount + ?,
             status = CASE WHEN paid_amount + ? >= amount - ? THEN 'PAID' ELSE 'PARTIAL' END
         WHERE id = ?",
        (amount, amount, MONEY_EPS, detail_id),
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FeeAggregates {
    pub total_amount: f64,
    pub discount_amount: f64,
    pub paid_amount: f64,
    pub balance_amount: f64,
    pub status: String,
}

/// Recompute the parent row from the sum of its installments' states.
/// WAIVED is an administrative override and survives recomputation.
pub fn recompute_student_fee(
    conn: &Connection,
    student_fee_id: &str,
) -> anyhow::Result<FeeAggregates> {
    let parent: Option<(f64, f64, String)> = conn
        .query_row(
            "SELECT total_amount, discount_amount, status FROM student_fees WHERE id = ?",
            [student_fee_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((total_amount, discount_amount, prev_status)) = parent else {
        anyhow::bail!("student fee not found: {}", student_fee_id);
    };

    let paid_amount: f64 = conn.query_row(
        "SELECT COALESCE(SUM(paid_amount), 0) FROM student_fee_details WHERE student_fee_id = ?",
        [student_fee_id],
        |r| r.get(0),
    )?;
    let paid_amount = round2(paid_amount);
    let balance_amount = round2(total_amount - discount_amount - paid_amount);

    let status = if prev_status == "WAIVED" {
        "WAIVED".to_string()
    } else if balance_amount <= MONEY_EPS {
        "PAID".to_string()
    } else if paid_amount > MONEY_EPS {
        "PARTIAL".to_string()
    } else {
        "PENDING".to_string()
    };

    conn.execute(
        "UPDATE student_fees SET paid_amount = ?, balance_amount = ?, status = ? WHERE id = ?",
        (paid_amount, balance_amount, &status, student_fee_id),
    )?;

    Ok(FeeAggregates {
        total_amount,
        discount_amount,
        paid_amount,
        balance_amount,
        status,
    })
}

/// Receipt numbers are generated once per payment and never rewritten.
pub fn next_receipt_no(paid_on: NaiveDate) -> String {
    let tail = Uuid::new_v4().simple().to_string();
    format!(
        "RCP-{:04}{:02}{:02}-{}",
        paid_on.year(),
        paid_on.month(),
        paid_on.day(),
        &tail[..8].to_ascii_uppercase()
    )
}
