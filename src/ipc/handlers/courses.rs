use crate::deletion;
use crate::ipc::error::{delete_error, err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
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

fn get_opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn not_found(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "not_found",
        message: message.into(),
        details: None,
    }
}

fn course_exists(conn: &Connection, course_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM courses WHERE id = ?", [course_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err)
}

fn courses_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let code = get_required_str(params, "code")?;
    let name = get_required_str(params, "name")?;
    let description = get_opt_str(params, "description");

    let taken: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM courses WHERE code = ? COLLATE NOCASE",
            [&code],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if taken.is_some() {
        return Err(HandlerErr {
            code: "duplicate_key",
            message: format!("course code '{}' already exists", code),
            details: None,
        });
    }

    let course_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, code, name, description) VALUES(?, ?, ?, ?)",
        (&course_id, &code, &name, description.as_deref()),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "courses" })),
    })?;
    Ok(json!({ "courseId": course_id }))
}

fn courses_list(conn: &Connection) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.code, c.name, c.description,
                    (SELECT COUNT(*) FROM assignments a WHERE a.course_id = c.id),
                    (SELECT COUNT(*) FROM batch_courses bc WHERE bc.course_id = c.id)
             FROM courses c
             ORDER BY c.code",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let code: String = r.get(1)?;
            let name: String = r.get(2)?;
            let description: Option<String> = r.get(3)?;
            let assignments: i64 = r.get(4)?;
            let enrollments: i64 = r.get(5)?;
            Ok(json!({
                "id": id,
                "code": code,
                "name": name,
                "description": description,
                "assignmentCount": assignments,
                "enrollmentCount": enrollments
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "courses": rows }))
}

fn courses_assign_teacher(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let teacher_id = get_required_str(params, "teacherId")?;
    if !course_exists(conn, &course_id)? {
        return Err(not_found("course not found"));
    }
    let role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    match role.as_deref() {
        None => return Err(not_found("user not found")),
        Some("teacher") => {}
        Some(_) => {
            return Err(HandlerErr {
                code: "validation_failed",
                message: "user is not a teacher".to_string(),
                details: None,
            });
        }
    }

    conn.execute(
        "INSERT INTO course_teachers(id, course_id, teacher_id)
         VALUES(?, ?, ?)
         ON CONFLICT(course_id, teacher_id) DO NOTHING",
        (Uuid::new_v4().to_string(), &course_id, &teacher_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "course_teachers" })),
    })?;
    Ok(json!({ "ok": true }))
}

fn courses_remove_teacher(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let removed = conn
        .execute(
            "DELETE FROM course_teachers WHERE course_id = ? AND teacher_id = ?",
            (&course_id, &teacher_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "course_teachers" })),
        })?;
    Ok(json!({ "removed": removed }))
}

fn courses_enroll_batch(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let batch_id = get_required_str(params, "batchId")?;
    if !course_exists(conn, &course_id)? {
        return Err(not_found("course not found"));
    }
    let batch_known: Option<i64> = conn
        .query_row("SELECT 1 FROM batches WHERE id = ?", [&batch_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    if batch_known.is_none() {
        return Err(not_found("batch not found"));
    }

    conn.execute(
        "INSERT INTO batch_courses(id, batch_id, course_id)
         VALUES(?, ?, ?)
         ON CONFLICT(batch_id, course_id) DO NOTHING",
        (Uuid::new_v4().to_string(), &batch_id, &course_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "batch_courses" })),
    })?;
    Ok(json!({ "ok": true }))
}

fn courses_unenroll_batch(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let batch_id = get_required_str(params, "batchId")?;
    let removed = conn
        .execute(
            "DELETE FROM batch_courses WHERE batch_id = ? AND course_id = ?",
            (&batch_id, &course_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "batch_courses" })),
        })?;
    Ok(json!({ "removed": removed }))
}

fn respond(
    state: &mut AppState,
    req: &Request,
    f: impl Fn(&Connection, &Value) -> Result<Value, HandlerErr>,
) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match get_required_str(&req.params, "courseId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match deletion::delete_course(conn, &course_id) {
        Ok(()) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => delete_error(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "courses.create" => Some(respond(state, req, courses_create)),
        "courses.list" => Some(respond(state, req, |conn, _| courses_list(conn))),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        "courses.assignTeacher" => Some(respond(state, req, courses_assign_teacher)),
        "courses.removeTeacher" => Some(respond(state, req, courses_remove_teacher)),
        "courses.enrollBatch" => Some(respond(state, req, courses_enroll_batch)),
        "courses.unenrollBatch" => Some(respond(state, req, courses_unenroll_batch)),
        _ => None,
    }
}
