use crate::deletion;
use crate::imports::{hash_password, normalize_key, validate_user_fields};
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

fn users_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let username = get_opt_str(params, "username").unwrap_or_default();
    let email = get_opt_str(params, "email").unwrap_or_default();
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let role = get_opt_str(params, "role").unwrap_or_default();
    let first_name = get_opt_str(params, "firstName").unwrap_or_default();
    let last_name = get_opt_str(params, "lastName").unwrap_or_default();
    let batch_code = get_opt_str(params, "batchCode");

    let messages = validate_user_fields(
        &username,
        &email,
        &password,
        &role,
        &first_name,
        &last_name,
        batch_code.as_deref(),
    );
    if !messages.is_empty() {
        return Err(HandlerErr {
            code: "validation_failed",
            message: messages.join("; "),
            details: Some(json!({ "messages": messages })),
        });
    }

    let taken: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE username = ?1 COLLATE NOCASE OR email = ?2 COLLATE NOCASE",
            (&username, &email),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if taken.is_some() {
        return Err(HandlerErr {
            code: "duplicate_key",
            message: "a user with that username or email already exists".to_string(),
            details: None,
        });
    }

    let batch_id = match &batch_code {
        Some(code) => {
            let found: Option<String> = conn
                .query_row(
                    "SELECT id FROM batches WHERE code = ? COLLATE NOCASE",
                    [code],
                    |r| r.get(0),
                )
                .optional()
                .map_err(db_err)?;
            match found {
                Some(id) => Some(id),
                None => {
                    return Err(HandlerErr {
                        code: "not_found",
                        message: format!("batch code '{}' not found", code),
                        details: None,
                    });
                }
            }
        }
        None => None,
    };

    let user_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, username, email, password_hash, role, first_name, last_name, batch_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &username,
            &email,
            hash_password(&password),
            normalize_key(&role),
            &first_name,
            &last_name,
            batch_id.as_deref(),
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "users" })),
    })?;

    Ok(json!({ "userId": user_id }))
}

fn users_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let role = get_opt_str(params, "role").map(|r| normalize_key(&r));
    let mut stmt = conn
        .prepare(
            "SELECT id, username, email, role, first_name, last_name, batch_id
             FROM users
             WHERE (?1 IS NULL OR role = ?1)
             ORDER BY username",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([role.as_deref()], |r| {
            let id: String = r.get(0)?;
            let username: String = r.get(1)?;
            let email: String = r.get(2)?;
            let role: String = r.get(3)?;
            let first_name: String = r.get(4)?;
            let last_name: String = r.get(5)?;
            let batch_id: Option<String> = r.get(6)?;
            Ok(json!({
                "id": id,
                "username": username,
                "email": email,
                "role": role,
                "firstName": first_name,
                "lastName": last_name,
                "batchId": batch_id
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "users": rows }))
}

fn users_bulk_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let ids: Vec<String> = match params.get("userIds").and_then(|v| v.as_array()) {
        Some(arr) => arr
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect(),
        None => {
            return Err(HandlerErr {
                code: "bad_params",
                message: "userIds must be an array of ids".to_string(),
                details: None,
            });
        }
    };
    if ids.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "userIds must not be empty".to_string(),
            details: None,
        });
    }

    let outcome = deletion::bulk_delete_users(conn, &ids).map_err(|e| match e {
        deletion::DeleteError::Db(e) => HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: None,
        },
        // bulk_delete_users folds not-found and guard failures into per-item
        // errors; anything else surfacing here is a storage fault.
        other => HandlerErr {
            code: "db_delete_failed",
            message: format!("{:?}", other),
            details: None,
        },
    })?;

    Ok(json!({
        "success": !outcome.deleted.is_empty(),
        "summary": {
            "total": ids.len(),
            "deleted": outcome.deleted.len(),
            "errors": outcome.errors.len()
        },
        "results": {
            "success": outcome.deleted,
            "errors": outcome.errors
                .iter()
                .map(|e| json!({ "userId": e.id, "reason": e.reason }))
                .collect::<Vec<_>>()
        }
    }))
}

fn handle_users_create(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match users_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_users_list(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match users_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user_id = match get_required_str(&req.params, "userId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match deletion::delete_user(conn, &user_id) {
        Ok(()) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => delete_error(&req.id, e),
    }
}

fn handle_users_bulk_delete(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match users_bulk_delete(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "users.create" => Some(handle_users_create(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        "users.bulkDelete" => Some(handle_users_bulk_delete(state, req)),
        _ => None,
    }
}
