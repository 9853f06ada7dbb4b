use rusqlite::{Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Marks/percentages are stored rounded to 2 decimals.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub const STATUS_PASS: &str = "PASS";
pub const STATUS_FAIL: &str = "FAIL";

/// Failing any one subject fails the exam overall, regardless of the
/// aggregate percentage. Absence in any subject does the same.
pub fn overall_status(
    has_absent: bool,
    has_failed_subject: bool,
    percentage: f64,
    passing_percentage: f64,
) -> &'static str {
    if has_absent || has_failed_subject || percentage < passing_percentage {
        STATUS_FAIL
    } else {
        STATUS_PASS
    }
}

#[derive(Debug, Clone)]
pub struct GradeBand {
    pub name: String,
    pub min_percentage: f64,
    pub max_percentage: f64,
    pub grade_point: f64,
}

/// Inclusive band match. No matching band is not an error; the result row
/// simply carries no grade.
pub fn pick_grade(bands: &[GradeBand], percentage: f64) -> Option<&GradeBand> {
    bands
        .iter()
        .find(|b| percentage >= b.min_percentage && percentage <= b.max_percentage)
}

#[derive(Debug, Clone)]
struct SubjectDef {
    id: String,
    max_marks: f64,
    passing_marks: f64,
}

#[derive(Debug, Clone, Copy)]
struct MarkCell {
    marks_obtained: f64,
    is_absent: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecomputeSummary {
    pub computed: usize,
    pub skipped_no_marks: usize,
    pub ranked: usize,
}

/// Recompute result rows for one exam and reassign ranks across the whole
/// cohort. `only_students` limits the per-student recompute to the students
/// touched by the current write; the rank pass always covers every result row
/// of the exam. Callers are expected to hold an open transaction.
pub fn recompute_exam_results(
    conn: &Connection,
    exam_id: &str,
    only_students: Option<&HashSet<String>>,
) -> anyhow::Result<RecomputeSummary> {
    let exam: Option<(String, f64)> = conn
        .query_row(
            "SELECT school_id, passing_percentage FROM exams WHERE id = ?",
            [exam_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((school_id, passing_percentage)) = exam else {
        anyhow::bail!("exam not found: {}", exam_id);
    };

    let mut subj_stmt = conn.prepare(
        "SELECT id, max_marks, passing_marks FROM exam_subjects WHERE exam_id = ? ORDER BY rowid",
    )?;
    let subjects: Vec<SubjectDef> = subj_stmt
        .query_map([exam_id], |r| {
            Ok(SubjectDef {
                id: r.get(0)?,
                max_marks: r.get(1)?,
                passing_marks: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut mark_stmt = conn.prepare(
        "SELECT m.exam_subject_id, m.student_id, m.marks_obtained, m.is_absent
         FROM student_marks m
         JOIN exam_subjects s ON s.id = m.exam_subject_id
         WHERE s.exam_id = ?",
    )?;
    let mut marks: HashMap<(String, String), MarkCell> = HashMap::new();
    let mut marked_students: HashSet<String> = HashSet::new();
    let mark_rows = mark_stmt.query_map([exam_id], |r| {
        let subject_id: String = r.get(0)?;
        let student_id: String = r.get(1)?;
        let marks_obtained: f64 = r.get(2)?;
        let is_absent: i64 = r.get(3)?;
        Ok((subject_id, student_id, marks_obtained, is_absent != 0))
    })?;
    for row in mark_rows {
        let (subject_id, student_id, marks_obtained, is_absent) = row?;
        marked_students.insert(student_id.clone());
        marks.insert(
            (subject_id, student_id),
            MarkCell {
                marks_obtained,
                is_absent,
            },
        );
    }

    let bands = load_active_grade_bands(conn, &school_id)?;

    let mut targets: Vec<String> = match only_students {
        Some(set) => marked_students
            .iter()
            .filter(|s| set.contains(*s))
            .cloned()
            .collect(),
        None => marked_students.iter().cloned().collect(),
    };
    targets.sort();

    let mut summary = RecomputeSummary::default();

    for student_id in &targets {
        let mut total_marks = 0.0;
        let mut max_marks = 0.0;
        let mut counted = 0usize;
        let mut has_absent = false;
        let mut has_failed_subject = false;

        for subj in &subjects {
            let Some(cell) = marks.get(&(subj.id.clone(), student_id.clone())) else {
                continue;
            };
            counted += 1;
            total_marks += cell.marks_obtained;
            max_marks += subj.max_marks;
            if cell.is_absent {
                has_absent = true;
            }
            if cell.marks_obtained < subj.passing_marks {
                has_failed_subject = true;
            }
        }

        // No contributing subjects: leave no trace rather than writing a
        // zero-denominator row.
        if counted == 0 {
            summary.skipped_no_marks += 1;
            continue;
        }

        let percentage = if max_marks > 0.0 {
            round2(total_marks / max_marks * 100.0)
        } else {
            0.0
        };
        let status = overall_status(has_absent, has_failed_subject, percentage, passing_percentage);
        let grade = pick_grade(&bands, percentage);

        let result_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO student_results(
                id, exam_id, student_id, total_marks, max_marks, percentage,
                grade, grade_point, status, rank)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
             ON CONFLICT(exam_id, student_id) DO UPDATE SET
               total_marks = excluded.total_marks,
               max_marks = excluded.max_marks,
               percentage = excluded.percentage,
               grade = excluded.grade,
               grade_point = excluded.grade_point,
               status = excluded.status",
            (
                &result_id,
                exam_id,
                student_id,
                round2(total_marks),
                max_marks,
                percentage,
                grade.map(|g| g.name.clone()),
                grade.map(|g| g.grade_point),
                status,
            ),
        )?;
        summary.computed += 1;
    }

    summary.ranked = assign_ranks(conn, exam_id)?;
    Ok(summary)
}

/// Full-cohort rank rewrite: every result row of the exam gets its 1-based
/// position in percentage-descending order. O(N) per call, bounded by roster
/// size. Tie order follows the fetch (rowid) and carries no product meaning.
pub fn assign_ranks(conn: &Connection, exam_id: &str) -> anyhow::Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT id FROM student_results WHERE exam_id = ? ORDER BY percentage DESC, rowid",
    )?;
    let ids: Vec<String> = stmt
        .query_map([exam_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    for (i, id) in ids.iter().enumerate() {
        conn.execute(
            "UPDATE student_results SET rank = ? WHERE id = ?",
            ((i + 1) as i64, id),
        )?;
    }
    Ok(ids.len())
}

fn load_active_grade_bands(conn: &Connection, school_id: &str) -> anyhow::Result<Vec<GradeBand>> {
    let mut stmt = conn.prepare(
        "SELECT name, min_percentage, max_percentage, grade_point
         FROM grade_scales
         WHERE school_id = ? AND active = 1
         ORDER BY min_percentage DESC",
    )?;
    let bands = stmt
        .query_map([school_id], |r| {
            Ok(GradeBand {
                name: r.get(0)?,
                min_percentage: r.get(1)?,
                max_percentage: r.get(2)?,
                grade_point: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(bands)
}
