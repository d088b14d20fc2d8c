use crate::store::{cleanup_files, FileStore};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

/// One guarded or cascaded relationship tally, recomputed immediately before
/// every delete decision.
#[derive(Debug)]
pub struct DependencyCount {
    pub relation: &'static str,
    pub label: &'static str,
    pub count: i64,
}

#[derive(Debug)]
pub enum DeleteError {
    NotFound(&'static str),
    Blocked(Vec<DependencyCount>),
    Db(rusqlite::Error),
}

impl From<rusqlite::Error> for DeleteError {
    fn from(e: rusqlite::Error) -> Self {
        DeleteError::Db(e)
    }
}

pub struct CascadeOutcome {
    pub rows_deleted: usize,
    pub files_attempted: usize,
}

pub struct BulkItemError {
    pub id: String,
    pub reason: String,
}

pub struct BulkOutcome {
    pub deleted: Vec<String>,
    pub errors: Vec<BulkItemError>,
}

type Guard = (&'static str, &'static str, &'static str);

// Policy table: which live relationships block a delete, per entity type.
// Course deletion is a hard guard; the cascade-with-warning variant that
// drifted into one admin entry point of the old system was dropped.
const BATCH_GUARDS: &[Guard] = &[
    (
        "enrollments",
        "course enrollment",
        "SELECT COUNT(*) FROM batch_courses WHERE batch_id = ?",
    ),
    (
        "students",
        "student",
        "SELECT COUNT(*) FROM users WHERE batch_id = ?",
    ),
];

const COURSE_GUARDS: &[Guard] = &[
    (
        "assignments",
        "assignment",
        "SELECT COUNT(*) FROM assignments WHERE course_id = ?",
    ),
    (
        "materials",
        "course material",
        "SELECT COUNT(*) FROM materials WHERE course_id = ?",
    ),
    (
        "enrollments",
        "batch enrollment",
        "SELECT COUNT(*) FROM batch_courses WHERE course_id = ?",
    ),
    (
        "teacher_links",
        "teacher link",
        "SELECT COUNT(*) FROM course_teachers WHERE course_id = ?",
    ),
    (
        "folder_shares",
        "shared folder",
        "SELECT COUNT(*) FROM folder_shares WHERE course_id = ?",
    ),
];

const ASSIGNMENT_GUARDS: &[Guard] = &[(
    "submissions",
    "submission",
    "SELECT COUNT(*) FROM submissions WHERE assignment_id = ?",
)];

const FOLDER_GUARDS: &[Guard] = &[(
    "subfolders",
    "subfolder",
    "SELECT COUNT(*) FROM folders WHERE parent_id = ?",
)];

const USER_GUARDS: &[Guard] = &[
    (
        "teacher_links",
        "course link",
        "SELECT COUNT(*) FROM course_teachers WHERE teacher_id = ?",
    ),
    (
        "created_assignments",
        "created assignment",
        "SELECT COUNT(*) FROM assignments WHERE created_by = ?",
    ),
    (
        "submissions",
        "submission",
        "SELECT COUNT(*) FROM submissions WHERE student_id = ?",
    ),
];

pub fn dependency_counts(
    conn: &Connection,
    guards: &[Guard],
    id: &str,
) -> rusqlite::Result<Vec<DependencyCount>> {
    let mut counts = Vec::with_capacity(guards.len());
    for (relation, label, sql) in guards {
        let count: i64 = conn.query_row(sql, [id], |r| r.get(0))?;
        counts.push(DependencyCount {
            relation,
            label,
            count,
        });
    }
    Ok(counts)
}

fn blocking(counts: Vec<DependencyCount>) -> Vec<DependencyCount> {
    counts.into_iter().filter(|c| c.count > 0).collect()
}

pub fn blocked_message(blocked: &[DependencyCount]) -> String {
    blocked
        .iter()
        .map(|b| format!("{} {}(s)", b.count, b.label))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn blocked_details(blocked: &[DependencyCount]) -> Value {
    json!({
        "dependencies": blocked
            .iter()
            .map(|b| json!({ "relation": b.relation, "label": b.label, "count": b.count }))
            .collect::<Vec<_>>()
    })
}

fn row_exists(conn: &Connection, sql: &str, id: &str) -> rusqlite::Result<bool> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
}

fn check_guards(conn: &Connection, guards: &[Guard], id: &str) -> Result<(), DeleteError> {
    let blocked = blocking(dependency_counts(conn, guards, id)?);
    if blocked.is_empty() {
        Ok(())
    } else {
        Err(DeleteError::Blocked(blocked))
    }
}

// Guard-only deletes still run inside a transaction so the count check and
// the destroy are one logical operation, never acting on a stale tally.

pub fn delete_batch(conn: &Connection, batch_id: &str) -> Result<(), DeleteError> {
    let tx = conn.unchecked_transaction()?;
    if !row_exists(&tx, "SELECT 1 FROM batches WHERE id = ?", batch_id)? {
        return Err(DeleteError::NotFound("batch"));
    }
    check_guards(&tx, BATCH_GUARDS, batch_id)?;
    tx.execute("DELETE FROM batches WHERE id = ?", [batch_id])?;
    tx.commit()?;
    Ok(())
}

pub fn delete_course(conn: &Connection, course_id: &str) -> Result<(), DeleteError> {
    let tx = conn.unchecked_transaction()?;
    if !row_exists(&tx, "SELECT 1 FROM courses WHERE id = ?", course_id)? {
        return Err(DeleteError::NotFound("course"));
    }
    check_guards(&tx, COURSE_GUARDS, course_id)?;
    tx.execute("DELETE FROM courses WHERE id = ?", [course_id])?;
    tx.commit()?;
    Ok(())
}

pub fn delete_user(conn: &Connection, user_id: &str) -> Result<(), DeleteError> {
    let tx = conn.unchecked_transaction()?;
    if !row_exists(&tx, "SELECT 1 FROM users WHERE id = ?", user_id)? {
        return Err(DeleteError::NotFound("user"));
    }
    check_guards(&tx, USER_GUARDS, user_id)?;
    tx.execute("DELETE FROM users WHERE id = ?", [user_id])?;
    tx.commit()?;
    Ok(())
}

/// Bulk user delete: one transaction across all targeted rows, with per-item
/// guard and existence failures recorded while the rest proceed. A storage
/// error aborts the whole operation and rolls everything back.
pub fn bulk_delete_users(conn: &Connection, ids: &[String]) -> Result<BulkOutcome, DeleteError> {
    let tx = conn.unchecked_transaction()?;
    let mut deleted = Vec::new();
    let mut errors = Vec::new();

    for id in ids {
        if !row_exists(&tx, "SELECT 1 FROM users WHERE id = ?", id)? {
            errors.push(BulkItemError {
                id: id.clone(),
                reason: "user not found".to_string(),
            });
            continue;
        }
        let blocked = blocking(dependency_counts(&tx, USER_GUARDS, id)?);
        if !blocked.is_empty() {
            errors.push(BulkItemError {
                id: id.clone(),
                reason: format!("cannot delete: {} depend on it", blocked_message(&blocked)),
            });
            continue;
        }
        tx.execute("DELETE FROM users WHERE id = ?", [id])?;
        deleted.push(id.clone());
    }

    tx.commit()?;
    Ok(BulkOutcome { deleted, errors })
}

pub fn delete_assignment(
    conn: &Connection,
    store: &dyn FileStore,
    assignment_id: &str,
) -> Result<CascadeOutcome, DeleteError> {
    let tx = conn.unchecked_transaction()?;
    if !row_exists(&tx, "SELECT 1 FROM assignments WHERE id = ?", assignment_id)? {
        return Err(DeleteError::NotFound("assignment"));
    }
    check_guards(&tx, ASSIGNMENT_GUARDS, assignment_id)?;

    let urls = file_urls(
        &tx,
        "SELECT file_url FROM assignment_materials WHERE assignment_id = ?",
        assignment_id,
    )?;
    let files_attempted = cleanup_files(store, &urls);

    let mut rows_deleted = tx.execute(
        "DELETE FROM assignment_materials WHERE assignment_id = ?",
        [assignment_id],
    )?;
    rows_deleted += tx.execute("DELETE FROM assignments WHERE id = ?", [assignment_id])?;
    tx.commit()?;
    Ok(CascadeOutcome {
        rows_deleted,
        files_attempted,
    })
}

pub fn delete_folder(
    conn: &Connection,
    store: &dyn FileStore,
    folder_id: &str,
) -> Result<CascadeOutcome, DeleteError> {
    let tx = conn.unchecked_transaction()?;
    if !row_exists(&tx, "SELECT 1 FROM folders WHERE id = ?", folder_id)? {
        return Err(DeleteError::NotFound("folder"));
    }
    check_guards(&tx, FOLDER_GUARDS, folder_id)?;

    let urls = file_urls(
        &tx,
        "SELECT file_url FROM materials WHERE folder_id = ?",
        folder_id,
    )?;
    let files_attempted = cleanup_files(store, &urls);

    let mut rows_deleted = tx.execute("DELETE FROM materials WHERE folder_id = ?", [folder_id])?;
    rows_deleted += tx.execute("DELETE FROM folder_shares WHERE folder_id = ?", [folder_id])?;
    rows_deleted += tx.execute("DELETE FROM folders WHERE id = ?", [folder_id])?;
    tx.commit()?;
    Ok(CascadeOutcome {
        rows_deleted,
        files_attempted,
    })
}

// Single-row deletes with one attached remote file: cleanup first
// (best-effort), then the row. No guards, no multi-statement transaction.

pub fn delete_material(
    conn: &Connection,
    store: &dyn FileStore,
    material_id: &str,
) -> Result<(), DeleteError> {
    delete_file_backed_row(conn, store, "materials", material_id)
}

pub fn delete_assignment_material(
    conn: &Connection,
    store: &dyn FileStore,
    material_id: &str,
) -> Result<(), DeleteError> {
    delete_file_backed_row(conn, store, "assignment_materials", material_id)
}

pub fn delete_submission(
    conn: &Connection,
    store: &dyn FileStore,
    submission_id: &str,
) -> Result<(), DeleteError> {
    delete_file_backed_row(conn, store, "submissions", submission_id)
}

fn delete_file_backed_row(
    conn: &Connection,
    store: &dyn FileStore,
    table: &'static str,
    id: &str,
) -> Result<(), DeleteError> {
    let noun = match table {
        "materials" => "material",
        "assignment_materials" => "assignment material",
        _ => "submission",
    };
    let sql = format!("SELECT file_url FROM {} WHERE id = ?", table);
    let url: Option<String> = conn.query_row(&sql, [id], |r| r.get(0)).optional()?;
    let Some(url) = url else {
        return Err(DeleteError::NotFound(noun));
    };
    cleanup_files(store, &[url]);
    let sql = format!("DELETE FROM {} WHERE id = ?", table);
    conn.execute(&sql, [id])?;
    Ok(())
}

fn file_urls(conn: &Connection, sql: &str, id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let urls = stmt
        .query_map([id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(urls)
}
