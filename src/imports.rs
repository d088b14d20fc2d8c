use rusqlite::{Connection, OptionalExtension, Transaction};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

pub const DEFAULT_MAX_IMPORT_ROWS: usize = 1000;

const USER_HEADERS: [&str; 6] = [
    "username",
    "email",
    "password",
    "role",
    "first_name",
    "last_name",
];
const ENROLLMENT_HEADERS: [&str; 2] = ["batch_code", "course_code"];

pub const ROLES: [&str; 3] = ["admin", "teacher", "student"];

/// Whole-file rejection: no row is classified, nothing touches the database.
#[derive(Debug)]
pub enum ImportError {
    Empty,
    TooManyRows { limit: usize, actual: usize },
    MissingHeaders { missing: Vec<String> },
    Db(rusqlite::Error),
}

#[derive(Serialize)]
pub struct ImportSummary {
    pub total: usize,
    pub created: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Serialize)]
pub struct RowEntry {
    pub row: usize,
    pub values: Map<String, Value>,
    pub message: String,
}

#[derive(Serialize)]
pub struct ImportResults {
    pub success: Vec<RowEntry>,
    pub skipped: Vec<RowEntry>,
    pub errors: Vec<RowEntry>,
}

#[derive(Serialize)]
pub struct ImportReport {
    pub success: bool,
    pub message: String,
    pub summary: ImportSummary,
    pub results: ImportResults,
}

// Terminal classification of one data row. Invalid rows never reach the
// transaction; Skipped is a collision with persisted data; Error is a row
// that was well-formed but not satisfiable (or a per-row storage failure).
enum Outcome {
    Created(String),
    Skipped(String),
    Invalid(String),
    Error(String),
}

struct RawRow {
    row_no: usize,
    fields: HashMap<String, String>,
    values: Map<String, Value>,
}

impl RawRow {
    fn get(&self, key: &str) -> &str {
        self.fields.get(key).map(|s| s.as_str()).unwrap_or("")
    }

    fn opt(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }
}

// Typed row shapes, produced only after the header check and local
// validation both pass.
struct UserRow {
    username: String,
    email: String,
    password: String,
    role: String,
    first_name: String,
    last_name: String,
    batch_code: Option<String>,
}

struct EnrollmentRow {
    batch_code: String,
    course_code: String,
}

struct GradeRow {
    username: Option<String>,
    email: Option<String>,
    grade: f64,
    feedback: Option<String>,
}

pub fn normalize_key(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

pub fn looks_like_email(s: &str) -> bool {
    if s.contains(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains('@')
}

/// Salted sha-256 digest, stored as `sha256$<salt>$<hex>`.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().to_string();
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b"$");
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sha256${}${}", salt, hex)
}

/// Field-level checks shared by `users.create` and the user import. Returns
/// every violation, not just the first.
pub fn validate_user_fields(
    username: &str,
    email: &str,
    password: &str,
    role: &str,
    first_name: &str,
    last_name: &str,
    batch_code: Option<&str>,
) -> Vec<String> {
    let mut messages = Vec::new();
    if username.is_empty() {
        messages.push("username is required".to_string());
    } else if username.len() > 64 {
        messages.push("username must be at most 64 characters".to_string());
    } else if username.contains(char::is_whitespace) {
        messages.push("username must not contain spaces".to_string());
    }
    if email.is_empty() {
        messages.push("email is required".to_string());
    } else if !looks_like_email(email) {
        messages.push(format!("'{}' is not a valid email address", email));
    }
    if password.is_empty() {
        messages.push("password is required".to_string());
    } else if password.len() < 6 {
        messages.push("password must be at least 6 characters".to_string());
    }
    if role.is_empty() {
        messages.push("role is required".to_string());
    } else if !ROLES.contains(&normalize_key(role).as_str()) {
        messages.push(format!("role must be one of: {}", ROLES.join(", ")));
    }
    if first_name.is_empty() {
        messages.push("first_name is required".to_string());
    } else if first_name.len() > 100 {
        messages.push("first_name must be at most 100 characters".to_string());
    }
    if last_name.is_empty() {
        messages.push("last_name is required".to_string());
    } else if last_name.len() > 100 {
        messages.push("last_name must be at most 100 characters".to_string());
    }
    if normalize_key(role) == "student" && batch_code.is_none() {
        messages.push("batch_code is required for student rows".to_string());
    }
    messages
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

// Header is file line 1; data rows report their original 1-based file line,
// so the first data row is row 2 even when blank lines are skipped.
fn parse_table(text: &str) -> (Vec<String>, Vec<RawRow>) {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let headers: Vec<String> = parse_csv_record(lines[0])
        .into_iter()
        .map(|h| normalize_key(&h))
        .collect();

    let mut rows = Vec::new();
    for (line_no, raw_line) in lines.iter().enumerate().skip(1) {
        if raw_line.trim().is_empty() {
            continue;
        }
        let record = parse_csv_record(raw_line);
        let mut fields = HashMap::new();
        let mut values = Map::new();
        for (i, header) in headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            let value = record.get(i).map(|s| s.trim()).unwrap_or("");
            fields.insert(header.clone(), value.to_string());
            values.insert(header.clone(), Value::String(value.to_string()));
        }
        rows.push(RawRow {
            row_no: line_no + 1,
            fields,
            values,
        });
    }
    (headers, rows)
}

fn require_headers(headers: &[String], required: &[&str]) -> Result<(), ImportError> {
    let missing: Vec<String> = required
        .iter()
        .filter(|h| !headers.iter().any(|have| have == *h))
        .map(|h| h.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ImportError::MissingHeaders { missing })
    }
}

fn admit(rows: &[RawRow], max_rows: usize) -> Result<(), ImportError> {
    if rows.is_empty() {
        return Err(ImportError::Empty);
    }
    if rows.len() > max_rows {
        return Err(ImportError::TooManyRows {
            limit: max_rows,
            actual: rows.len(),
        });
    }
    Ok(())
}

fn build_report(rows: Vec<RawRow>, outcomes: Vec<Outcome>) -> ImportReport {
    let total = rows.len();
    let mut created = 0usize;
    let mut skipped = 0usize;
    let mut errors = 0usize;
    let mut results = ImportResults {
        success: Vec::new(),
        skipped: Vec::new(),
        errors: Vec::new(),
    };

    for (raw, outcome) in rows.into_iter().zip(outcomes) {
        let (list, message) = match outcome {
            Outcome::Created(m) => {
                created += 1;
                (&mut results.success, m)
            }
            Outcome::Skipped(m) => {
                skipped += 1;
                (&mut results.skipped, m)
            }
            Outcome::Invalid(m) | Outcome::Error(m) => {
                errors += 1;
                (&mut results.errors, m)
            }
        };
        list.push(RowEntry {
            row: raw.row_no,
            values: raw.values,
            message,
        });
    }

    let success = created > 0;
    let message = if success {
        format!("imported {} of {} row(s)", created, total)
    } else {
        "no rows were imported".to_string()
    };
    ImportReport {
        success,
        message,
        summary: ImportSummary {
            total,
            created,
            skipped,
            errors,
        },
        results,
    }
}

fn commit_or_rollback(tx: Transaction, created: usize) -> Result<(), ImportError> {
    // All-or-nothing on zero success: a run that lands nothing must leave no
    // side effects behind.
    if created > 0 {
        tx.commit().map_err(ImportError::Db)
    } else {
        tx.rollback().map_err(ImportError::Db)
    }
}

pub fn run_user_import(
    conn: &Connection,
    text: &str,
    max_rows: usize,
) -> Result<ImportReport, ImportError> {
    let (headers, rows) = parse_table(text);
    require_headers(&headers, &USER_HEADERS)?;
    admit(&rows, max_rows)?;

    let mut outcomes: Vec<Option<Outcome>> = (0..rows.len()).map(|_| None).collect();
    let mut staged: Vec<(usize, UserRow)> = Vec::new();
    // Natural keys are reserved only by rows that are otherwise valid; a row
    // rejected for another reason does not poison a later row's key.
    let mut seen_usernames: HashMap<String, usize> = HashMap::new();
    let mut seen_emails: HashMap<String, usize> = HashMap::new();

    for (idx, raw) in rows.iter().enumerate() {
        let username = raw.get("username");
        let email = raw.get("email");
        let batch_code = raw.opt("batch_code");
        let mut messages = validate_user_fields(
            username,
            email,
            raw.get("password"),
            raw.get("role"),
            raw.get("first_name"),
            raw.get("last_name"),
            batch_code,
        );
        if messages.is_empty() {
            if let Some(first) = seen_usernames.get(&normalize_key(username)) {
                messages.push(format!(
                    "duplicate username '{}' in file (first used at row {})",
                    username, first
                ));
            }
            if let Some(first) = seen_emails.get(&normalize_key(email)) {
                messages.push(format!(
                    "duplicate email '{}' in file (first used at row {})",
                    email, first
                ));
            }
        }
        if messages.is_empty() {
            seen_usernames.insert(normalize_key(username), raw.row_no);
            seen_emails.insert(normalize_key(email), raw.row_no);
            staged.push((
                idx,
                UserRow {
                    username: username.to_string(),
                    email: email.to_string(),
                    password: raw.get("password").to_string(),
                    role: normalize_key(raw.get("role")),
                    first_name: raw.get("first_name").to_string(),
                    last_name: raw.get("last_name").to_string(),
                    batch_code: batch_code.map(|s| s.to_string()),
                },
            ));
        } else {
            outcomes[idx] = Some(Outcome::Invalid(messages.join("; ")));
        }
    }

    let tx = conn.unchecked_transaction().map_err(ImportError::Db)?;
    let mut created = 0usize;
    for (idx, row) in &staged {
        let outcome = match persist_user_row(&tx, row) {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Error(format!("row processing failed: {}", e)),
        };
        if matches!(outcome, Outcome::Created(_)) {
            created += 1;
        }
        outcomes[*idx] = Some(outcome);
    }
    commit_or_rollback(tx, created)?;

    let outcomes = outcomes
        .into_iter()
        .map(|o| o.unwrap_or_else(|| Outcome::Error("row was never classified".to_string())))
        .collect();
    Ok(build_report(rows, outcomes))
}

fn persist_user_row(tx: &Transaction, row: &UserRow) -> rusqlite::Result<Outcome> {
    let username_taken = tx
        .query_row(
            "SELECT 1 FROM users WHERE username = ? COLLATE NOCASE",
            [&row.username],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if username_taken {
        return Ok(Outcome::Skipped(format!(
            "username '{}' already exists",
            row.username
        )));
    }
    let email_taken = tx
        .query_row(
            "SELECT 1 FROM users WHERE email = ? COLLATE NOCASE",
            [&row.email],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if email_taken {
        return Ok(Outcome::Skipped(format!(
            "email '{}' already exists",
            row.email
        )));
    }

    let batch_id = match &row.batch_code {
        Some(code) => {
            let found: Option<String> = tx
                .query_row(
                    "SELECT id FROM batches WHERE code = ? COLLATE NOCASE",
                    [code],
                    |r| r.get(0),
                )
                .optional()?;
            match found {
                Some(id) => Some(id),
                None => {
                    return Ok(Outcome::Error(format!("batch code '{}' not found", code)));
                }
            }
        }
        None => None,
    };

    tx.execute(
        "INSERT INTO users(id, username, email, password_hash, role, first_name, last_name, batch_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &row.username,
            &row.email,
            hash_password(&row.password),
            &row.role,
            &row.first_name,
            &row.last_name,
            batch_id.as_deref(),
            chrono::Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(Outcome::Created("user created".to_string()))
}

pub fn run_enrollment_import(
    conn: &Connection,
    text: &str,
    max_rows: usize,
) -> Result<ImportReport, ImportError> {
    let (headers, rows) = parse_table(text);
    require_headers(&headers, &ENROLLMENT_HEADERS)?;
    admit(&rows, max_rows)?;

    let mut outcomes: Vec<Option<Outcome>> = (0..rows.len()).map(|_| None).collect();
    let mut staged: Vec<(usize, EnrollmentRow)> = Vec::new();
    let mut seen_pairs: HashMap<String, usize> = HashMap::new();

    for (idx, raw) in rows.iter().enumerate() {
        let batch_code = raw.get("batch_code");
        let course_code = raw.get("course_code");
        let mut messages = Vec::new();
        if batch_code.is_empty() {
            messages.push("batch_code is required".to_string());
        }
        if course_code.is_empty() {
            messages.push("course_code is required".to_string());
        }
        if messages.is_empty() {
            let pair = format!(
                "{}|{}",
                normalize_key(batch_code),
                normalize_key(course_code)
            );
            if let Some(first) = seen_pairs.get(&pair) {
                messages.push(format!(
                    "duplicate enrollment '{}'/'{}' in file (first used at row {})",
                    batch_code, course_code, first
                ));
            } else {
                seen_pairs.insert(pair, raw.row_no);
            }
        }
        if messages.is_empty() {
            staged.push((
                idx,
                EnrollmentRow {
                    batch_code: batch_code.to_string(),
                    course_code: course_code.to_string(),
                },
            ));
        } else {
            outcomes[idx] = Some(Outcome::Invalid(messages.join("; ")));
        }
    }

    let tx = conn.unchecked_transaction().map_err(ImportError::Db)?;
    let mut created = 0usize;
    for (idx, row) in &staged {
        let outcome = match persist_enrollment_row(&tx, row) {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Error(format!("row processing failed: {}", e)),
        };
        if matches!(outcome, Outcome::Created(_)) {
            created += 1;
        }
        outcomes[*idx] = Some(outcome);
    }
    commit_or_rollback(tx, created)?;

    let outcomes = outcomes
        .into_iter()
        .map(|o| o.unwrap_or_else(|| Outcome::Error("row was never classified".to_string())))
        .collect();
    Ok(build_report(rows, outcomes))
}

fn persist_enrollment_row(tx: &Transaction, row: &EnrollmentRow) -> rusqlite::Result<Outcome> {
    let batch_id: Option<String> = tx
        .query_row(
            "SELECT id FROM batches WHERE code = ? COLLATE NOCASE",
            [&row.batch_code],
            |r| r.get(0),
        )
        .optional()?;
    let Some(batch_id) = batch_id else {
        return Ok(Outcome::Error(format!(
            "batch code '{}' not found",
            row.batch_code
        )));
    };
    let course_id: Option<String> = tx
        .query_row(
            "SELECT id FROM courses WHERE code = ? COLLATE NOCASE",
            [&row.course_code],
            |r| r.get(0),
        )
        .optional()?;
    let Some(course_id) = course_id else {
        return Ok(Outcome::Error(format!(
            "course code '{}' not found",
            row.course_code
        )));
    };

    let already = tx
        .query_row(
            "SELECT 1 FROM batch_courses WHERE batch_id = ? AND course_id = ?",
            (&batch_id, &course_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if already {
        return Ok(Outcome::Skipped(format!(
            "batch '{}' is already enrolled in course '{}'",
            row.batch_code, row.course_code
        )));
    }

    tx.execute(
        "INSERT INTO batch_courses(id, batch_id, course_id) VALUES(?, ?, ?)",
        (Uuid::new_v4().to_string(), &batch_id, &course_id),
    )?;
    Ok(Outcome::Created("enrollment created".to_string()))
}

/// Grade upload for one assignment. Rows identify the student by username,
/// email, or both; when both are present they must name the same student.
pub fn run_grade_import(
    conn: &Connection,
    assignment_id: &str,
    text: &str,
    max_rows: usize,
) -> Result<ImportReport, ImportError> {
    let (headers, rows) = parse_table(text);
    require_headers(&headers, &["grade"])?;
    if !headers.iter().any(|h| h == "username" || h == "email") {
        return Err(ImportError::MissingHeaders {
            missing: vec!["username or email".to_string()],
        });
    }
    admit(&rows, max_rows)?;

    let mut outcomes: Vec<Option<Outcome>> = (0..rows.len()).map(|_| None).collect();
    let mut staged: Vec<(usize, GradeRow)> = Vec::new();
    let mut seen_usernames: HashMap<String, usize> = HashMap::new();
    let mut seen_emails: HashMap<String, usize> = HashMap::new();

    for (idx, raw) in rows.iter().enumerate() {
        let username = raw.opt("username");
        let email = raw.opt("email");
        let mut messages = Vec::new();
        if username.is_none() && email.is_none() {
            messages.push("a username or email identifier is required".to_string());
        }
        let grade_raw = raw.get("grade");
        let grade = match grade_raw.parse::<f64>() {
            Ok(g) if (0.0..=100.0).contains(&g) => Some(g),
            _ => {
                messages.push(format!(
                    "grade '{}' must be a number between 0 and 100",
                    grade_raw
                ));
                None
            }
        };
        if messages.is_empty() {
            // Duplicate detection keys on both identifier columns so the same
            // student cannot slip through once under each identifier type.
            if let Some(u) = username {
                if let Some(first) = seen_usernames.get(&normalize_key(u)) {
                    messages.push(format!(
                        "duplicate username '{}' in file (first used at row {})",
                        u, first
                    ));
                }
            }
            if let Some(e) = email {
                if let Some(first) = seen_emails.get(&normalize_key(e)) {
                    messages.push(format!(
                        "duplicate email '{}' in file (first used at row {})",
                        e, first
                    ));
                }
            }
        }
        if messages.is_empty() {
            if let Some(u) = username {
                seen_usernames.insert(normalize_key(u), raw.row_no);
            }
            if let Some(e) = email {
                seen_emails.insert(normalize_key(e), raw.row_no);
            }
            staged.push((
                idx,
                GradeRow {
                    username: username.map(|s| s.to_string()),
                    email: email.map(|s| s.to_string()),
                    grade: grade.unwrap_or(0.0),
                    feedback: raw.opt("feedback").map(|s| s.to_string()),
                },
            ));
        } else {
            outcomes[idx] = Some(Outcome::Invalid(messages.join("; ")));
        }
    }

    let tx = conn.unchecked_transaction().map_err(ImportError::Db)?;
    let mut created = 0usize;
    for (idx, row) in &staged {
        let outcome = match persist_grade_row(&tx, assignment_id, row) {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Error(format!("row processing failed: {}", e)),
        };
        if matches!(outcome, Outcome::Created(_)) {
            created += 1;
        }
        outcomes[*idx] = Some(outcome);
    }
    commit_or_rollback(tx, created)?;

    let outcomes = outcomes
        .into_iter()
        .map(|o| o.unwrap_or_else(|| Outcome::Error("row was never classified".to_string())))
        .collect();
    Ok(build_report(rows, outcomes))
}

fn find_user_by(
    tx: &Transaction,
    column: &str,
    value: &str,
) -> rusqlite::Result<Option<(String, String)>> {
    let sql = format!(
        "SELECT id, role FROM users WHERE {} = ? COLLATE NOCASE",
        column
    );
    tx.query_row(&sql, [value], |r| Ok((r.get(0)?, r.get(1)?)))
        .optional()
}

fn persist_grade_row(
    tx: &Transaction,
    assignment_id: &str,
    row: &GradeRow,
) -> rusqlite::Result<Outcome> {
    let by_username = match &row.username {
        Some(u) => {
            let found = find_user_by(tx, "username", u)?;
            if found.is_none() {
                return Ok(Outcome::Error(format!("username '{}' not found", u)));
            }
            found
        }
        None => None,
    };
    let by_email = match &row.email {
        Some(e) => {
            let found = find_user_by(tx, "email", e)?;
            if found.is_none() {
                return Ok(Outcome::Error(format!("email '{}' not found", e)));
            }
            found
        }
        None => None,
    };
    let (user_id, role) = match (by_username, by_email) {
        (Some(u), Some(e)) => {
            if u.0 != e.0 {
                return Ok(Outcome::Error(
                    "username and email identify different users".to_string(),
                ));
            }
            u
        }
        (Some(u), None) => u,
        (None, Some(e)) => e,
        (None, None) => {
            return Ok(Outcome::Error(
                "a username or email identifier is required".to_string(),
            ));
        }
    };
    if role != "student" {
        return Ok(Outcome::Error(format!(
            "user '{}' is not a student",
            row.username
                .as_deref()
                .or(row.email.as_deref())
                .unwrap_or("?")
        )));
    }

    let submission_id: Option<String> = tx
        .query_row(
            "SELECT id FROM submissions WHERE assignment_id = ? AND student_id = ?",
            (assignment_id, &user_id),
            |r| r.get(0),
        )
        .optional()?;
    let Some(submission_id) = submission_id else {
        return Ok(Outcome::Error(format!(
            "no submission from '{}' for this assignment",
            row.username
                .as_deref()
                .or(row.email.as_deref())
                .unwrap_or("?")
        )));
    };

    tx.execute(
        "UPDATE submissions SET grade = ?, feedback = COALESCE(?, feedback) WHERE id = ?",
        (row.grade, row.feedback.as_deref(), &submission_id),
    )?;
    Ok(Outcome::Created("grade recorded".to_string()))
}
