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

fn assignments_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let title = get_required_str(params, "title")?;
    let description = get_opt_str(params, "description");
    let due_date = get_opt_str(params, "dueDate");
    let created_by = get_opt_str(params, "createdBy");

    let course_known: Option<i64> = conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    if course_known.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "course not found".to_string(),
            details: None,
        });
    }
    if let Some(creator) = &created_by {
        let role: Option<String> = conn
            .query_row("SELECT role FROM users WHERE id = ?", [creator], |r| {
                r.get(0)
            })
            .optional()
            .map_err(db_err)?;
        match role.as_deref() {
            None => {
                return Err(HandlerErr {
                    code: "not_found",
                    message: "creating user not found".to_string(),
                    details: None,
                });
            }
            Some("teacher") | Some("admin") => {}
            Some(_) => {
                return Err(HandlerErr {
                    code: "validation_failed",
                    message: "only teachers or admins may create assignments".to_string(),
                    details: None,
                });
            }
        }
    }

    let assignment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assignments(id, course_id, title, description, due_date, created_by)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &assignment_id,
            &course_id,
            &title,
            description.as_deref(),
            due_date.as_deref(),
            created_by.as_deref(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "assignments" })),
    })?;
    Ok(json!({ "assignmentId": assignment_id }))
}

fn assignments_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.title, a.description, a.due_date, a.created_by,
                    (SELECT COUNT(*) FROM submissions s WHERE s.assignment_id = a.id),
                    (SELECT COUNT(*) FROM assignment_materials m WHERE m.assignment_id = a.id)
             FROM assignments a
             WHERE a.course_id = ?
             ORDER BY a.title",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([&course_id], |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let description: Option<String> = r.get(2)?;
            let due_date: Option<String> = r.get(3)?;
            let created_by: Option<String> = r.get(4)?;
            let submissions: i64 = r.get(5)?;
            let materials: i64 = r.get(6)?;
            Ok(json!({
                "id": id,
                "title": title,
                "description": description,
                "dueDate": due_date,
                "createdBy": created_by,
                "submissionCount": submissions,
                "materialCount": materials
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "assignments": rows }))
}

fn handle_assignments_create(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match assignments_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_assignments_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match assignments_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_assignments_delete(state: &mut AppState, req: &Request) -> Value {
    let (Some(conn), Some(store)) = (state.db.as_ref(), state.store.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let assignment_id = match get_required_str(&req.params, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match deletion::delete_assignment(conn, store, &assignment_id) {
        Ok(outcome) => ok(
            &req.id,
            json!({
                "deleted": true,
                "rowsDeleted": outcome.rows_deleted,
                "filesAttempted": outcome.files_attempted
            }),
        ),
        Err(e) => delete_error(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "assignments.create" => Some(handle_assignments_create(state, req)),
        "assignments.list" => Some(handle_assignments_list(state, req)),
        "assignments.delete" => Some(handle_assignments_delete(state, req)),
        _ => None,
    }
}
