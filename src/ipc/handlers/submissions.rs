use crate::deletion;
use crate::ipc::error::{delete_error, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::{cleanup_files, FileStore, LocalStore};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::path::Path;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

fn db_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    }
}

fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn read_upload(in_path: &str) -> Result<(String, Vec<u8>), HandlerErr> {
    let bytes = std::fs::read(in_path).map_err(|e| HandlerErr {
        code: "upload_read_failed",
        message: e.to_string(),
        details: Some(json!({ "path": in_path })),
    })?;
    let name = Path::new(in_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());
    Ok((name, bytes))
}

fn submissions_create(
    conn: &Connection,
    store: &LocalStore,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let student_id = get_required_str(params, "studentId")?;
    let in_path = get_required_str(params, "inPath")?;

    let course_id: Option<String> = conn
        .query_row(
            "SELECT course_id FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let Some(course_id) = course_id else {
        return Err(HandlerErr {
            code: "not_found",
            message: "assignment not found".to_string(),
            details: None,
        });
    };

    let student: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT role, batch_id FROM users WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((role, batch_id)) = student else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };
    if role != "student" {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "only students may submit".to_string(),
            details: None,
        });
    }
    let enrolled = match &batch_id {
        Some(batch_id) => conn
            .query_row(
                "SELECT 1 FROM batch_courses WHERE batch_id = ? AND course_id = ?",
                (batch_id, &course_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(db_err)?
            .is_some(),
        None => false,
    };
    if !enrolled {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "student's batch is not enrolled in this course".to_string(),
            details: None,
        });
    }

    let (name, bytes) = read_upload(&in_path)?;
    let file_url = store.store(&name, &bytes).map_err(|e| HandlerErr {
        code: "store_failed",
        message: e.to_string(),
        details: None,
    })?;
    let submitted_at = chrono::Utc::now().to_rfc3339();

    // Resubmission replaces the previous file and clears any grade.
    let existing: Option<(String, String)> = conn
        .query_row(
            "SELECT id, file_url FROM submissions WHERE assignment_id = ? AND student_id = ?",
            (&assignment_id, &student_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;
    let submission_id = match existing {
        Some((existing_id, old_url)) => {
            cleanup_files(store, &[old_url]);
            conn.execute(
                "UPDATE submissions
                 SET file_url = ?, submitted_at = ?, grade = NULL, feedback = NULL
                 WHERE id = ?",
                (&file_url, &submitted_at, &existing_id),
            )
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "submissions" })),
            })?;
            existing_id
        }
        None => {
            let submission_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO submissions(id, assignment_id, student_id, file_url, submitted_at)
                 VALUES(?, ?, ?, ?, ?)",
                (
                    &submission_id,
                    &assignment_id,
                    &student_id,
                    &file_url,
                    &submitted_at,
                ),
            )
            .map_err(|e| HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "submissions" })),
            })?;
            submission_id
        }
    };

    Ok(json!({ "submissionId": submission_id, "fileUrl": file_url }))
}

fn submissions_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.student_id, u.username, s.file_url, s.submitted_at, s.grade, s.feedback
             FROM submissions s
             JOIN users u ON u.id = s.student_id
             WHERE s.assignment_id = ?
             ORDER BY u.username",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([&assignment_id], |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let username: String = r.get(2)?;
            let file_url: String = r.get(3)?;
            let submitted_at: String = r.get(4)?;
            let grade: Option<f64> = r.get(5)?;
            let feedback: Option<String> = r.get(6)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "username": username,
                "fileUrl": file_url,
                "submittedAt": submitted_at,
                "grade": grade,
                "feedback": feedback
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "submissions": rows }))
}

fn submissions_grade(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let submission_id = get_required_str(params, "submissionId")?;
    let grade = match params.get("grade").and_then(|v| v.as_f64()) {
        Some(g) if (0.0..=100.0).contains(&g) => g,
        _ => {
            return Err(HandlerErr {
                code: "validation_failed",
                message: "grade must be a number between 0 and 100".to_string(),
                details: None,
            });
        }
    };
    let feedback = params
        .get("feedback")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let updated = conn
        .execute(
            "UPDATE submissions SET grade = ?, feedback = ? WHERE id = ?",
            (grade, feedback.as_deref(), &submission_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "submissions" })),
        })?;
    if updated == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "submission not found".to_string(),
            details: None,
        });
    }
    Ok(json!({ "ok": true }))
}

fn handle_submissions_create(state: &mut AppState, req: &Request) -> Value {
    let (Some(conn), Some(store)) = (state.db.as_ref(), state.store.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match submissions_create(conn, store, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_submissions_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match submissions_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_submissions_grade(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match submissions_grade(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_submissions_delete(state: &mut AppState, req: &Request) -> Value {
    let (Some(conn), Some(store)) = (state.db.as_ref(), state.store.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let submission_id = match get_required_str(&req.params, "submissionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match deletion::delete_submission(conn, store, &submission_id) {
        Ok(()) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => delete_error(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "submissions.create" => Some(handle_submissions_create(state, req)),
        "submissions.list" => Some(handle_submissions_list(state, req)),
        "submissions.grade" => Some(handle_submissions_grade(state, req)),
        "submissions.delete" => Some(handle_submissions_delete(state, req)),
        _ => None,
    }
}
