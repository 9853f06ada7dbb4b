use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("school.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_academic_years_school ON academic_years(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            section TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, name, section)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_school ON classes(school_id)",
        [],
    )?;

    // current_class_id is an explicit current-enrollment pointer; a student is
    // never located by scanning historical enrollment rows.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            current_class_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            admission_no TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(current_class_id) REFERENCES classes(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(school_id, admission_no)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_school ON students(school_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(current_class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_scales(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            min_percentage REAL NOT NULL,
            max_percentage REAL NOT NULL,
            grade_point REAL NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_scales_school ON grade_scales(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            exam_type TEXT NOT NULL DEFAULT 'TERM',
            start_date TEXT,
            end_date TEXT,
            passing_percentage REAL NOT NULL DEFAULT 33.0,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_school ON exams(school_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_class ON exams(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_subjects(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            subject_name TEXT NOT NULL,
            max_marks REAL NOT NULL,
            passing_marks REAL NOT NULL,
            is_optional INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            UNIQUE(exam_id, subject_name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_subjects_exam ON exam_subjects(exam_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_marks(
            id TEXT PRIMARY KEY,
            exam_subject_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            marks_obtained REAL NOT NULL DEFAULT 0,
            is_absent INTEGER NOT NULL DEFAULT 0,
            remark TEXT,
            FOREIGN KEY(exam_subject_id) REFERENCES exam_subjects(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(exam_subject_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_marks_subject ON student_marks(exam_subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_marks_student ON student_marks(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_results(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            total_marks REAL NOT NULL,
            max_marks REAL NOT NULL,
            percentage REAL NOT NULL,
            grade TEXT,
            grade_point REAL,
            status TEXT NOT NULL,
            rank INTEGER,
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(exam_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_results_exam ON student_results(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_results_student ON student_results(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_structures(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            name TEXT NOT NULL,
            due_day INTEGER NOT NULL DEFAULT 10,
            late_fee_amount REAL NOT NULL DEFAULT 0,
            grace_period_days INTEGER NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(class_id, academic_year_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_structures_school ON fee_structures(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_structure_items(
            id TEXT PRIMARY KEY,
            fee_structure_id TEXT NOT NULL,
            category TEXT NOT NULL,
            amount REAL NOT NULL,
            frequency TEXT NOT NULL,
            FOREIGN KEY(fee_structure_id) REFERENCES fee_structures(id),
            UNIQUE(fee_structure_id, category)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_structure_items_structure
         ON fee_structure_items(fee_structure_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_fees(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            fee_structure_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            total_amount REAL NOT NULL,
            discount_amount REAL NOT NULL DEFAULT 0,
            paid_amount REAL NOT NULL DEFAULT 0,
            balance_amount REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(fee_structure_id) REFERENCES fee_structures(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            UNIQUE(student_id, fee_structure_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_fees_student ON student_fees(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_fee_details(
            id TEXT PRIMARY KEY,
            student_fee_id TEXT NOT NULL,
            category TEXT NOT NULL,
            period_label TEXT NOT NULL,
            amount REAL NOT NULL,
            paid_amount REAL NOT NULL DEFAULT 0,
            due_date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            FOREIGN KEY(student_fee_id) REFERENCES student_fees(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_fee_details_fee
         ON student_fee_details(student_fee_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_fee_details_due
         ON student_fee_details(student_fee_id, due_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_payments(
            id TEXT PRIMARY KEY,
            student_fee_id TEXT NOT NULL,
            amount REAL NOT NULL,
            method TEXT NOT NULL,
            transaction_ref TEXT,
            receipt_no TEXT NOT NULL UNIQUE,
            paid_at TEXT NOT NULL,
            FOREIGN KEY(student_fee_id) REFERENCES student_fees(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_payments_fee ON fee_payments(student_fee_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_payment_details(
            id TEXT PRIMARY KEY,
            fee_payment_id TEXT NOT NULL,
            student_fee_detail_id TEXT NOT NULL,
            amount REAL NOT NULL,
            FOREIGN KEY(fee_payment_id) REFERENCES fee_payments(id),
            FOREIGN KEY(student_fee_detail_id) REFERENCES student_fee_details(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_payment_details_payment
         ON fee_payment_details(fee_payment_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS holidays(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            date TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            UNIQUE(school_id, date)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(class_id, student_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_class_date
         ON attendance_records(class_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance_records(student_id)",
        [],
    )?;

    // Workspaces created before external gateway refs were recorded lack the
    // transaction_ref column. Add it if needed.
    ensure_fee_payments_transaction_ref(&conn)?;

    Ok(conn)
}

fn ensure_fee_payments_transaction_ref(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "fee_payments", "transaction_ref")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE fee_payments ADD COLUMN transaction_ref TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
