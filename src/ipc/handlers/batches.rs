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

fn batches_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let code = get_required_str(params, "code")?;
    let name = get_required_str(params, "name")?;

    let taken: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM batches WHERE code = ? COLLATE NOCASE",
            [&code],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if taken.is_some() {
        return Err(HandlerErr {
            code: "duplicate_key",
            message: format!("batch code '{}' already exists", code),
            details: None,
        });
    }

    let batch_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO batches(id, code, name) VALUES(?, ?, ?)",
        (&batch_id, &code, &name),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "batches" })),
    })?;
    Ok(json!({ "batchId": batch_id }))
}

fn batches_list(conn: &Connection) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT b.id, b.code, b.name,
                    (SELECT COUNT(*) FROM users u WHERE u.batch_id = b.id),
                    (SELECT COUNT(*) FROM batch_courses bc WHERE bc.batch_id = b.id)
             FROM batches b
             ORDER BY b.code",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let code: String = r.get(1)?;
            let name: String = r.get(2)?;
            let students: i64 = r.get(3)?;
            let enrollments: i64 = r.get(4)?;
            Ok(json!({
                "id": id,
                "code": code,
                "name": name,
                "studentCount": students,
                "enrollmentCount": enrollments
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "batches": rows }))
}

fn handle_batches_create(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match batches_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_batches_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match batches_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_batches_delete(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let batch_id = match get_required_str(&req.params, "batchId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match deletion::delete_batch(conn, &batch_id) {
        Ok(()) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => delete_error(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "batches.create" => Some(handle_batches_create(state, req)),
        "batches.list" => Some(handle_batches_list(state, req)),
        "batches.delete" => Some(handle_batches_delete(state, req)),
        _ => None,
    }
}
