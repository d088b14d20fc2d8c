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

fn folders_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let parent_id = get_opt_str(params, "parentId");
    let owner_id = get_opt_str(params, "ownerId");

    if let Some(parent_id) = &parent_id {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM folders WHERE id = ?", [parent_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(HandlerErr {
                code: "not_found",
                message: "parent folder not found".to_string(),
                details: None,
            });
        }
    }
    if let Some(owner_id) = &owner_id {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM users WHERE id = ?", [owner_id], |r| r.get(0))
            .optional()
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(HandlerErr {
                code: "not_found",
                message: "owner not found".to_string(),
                details: None,
            });
        }
    }

    let folder_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO folders(id, name, parent_id, owner_id) VALUES(?, ?, ?, ?)",
        (&folder_id, &name, parent_id.as_deref(), owner_id.as_deref()),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "folders" })),
    })?;
    Ok(json!({ "folderId": folder_id }))
}

fn folders_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let parent_id = get_opt_str(params, "parentId");
    let mut stmt = conn
        .prepare(
            "SELECT f.id, f.name, f.parent_id, f.owner_id,
                    (SELECT COUNT(*) FROM materials m WHERE m.folder_id = f.id),
                    (SELECT COUNT(*) FROM folders c WHERE c.parent_id = f.id)
             FROM folders f
             WHERE (?1 IS NULL AND f.parent_id IS NULL) OR f.parent_id = ?1
             ORDER BY f.name",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([parent_id.as_deref()], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let parent: Option<String> = r.get(2)?;
            let owner: Option<String> = r.get(3)?;
            let material_count: i64 = r.get(4)?;
            let subfolder_count: i64 = r.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "parentId": parent,
                "ownerId": owner,
                "materialCount": material_count,
                "subfolderCount": subfolder_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "folders": rows }))
}

fn link_params(params: &Value) -> Result<(String, String), HandlerErr> {
    Ok((
        get_required_str(params, "folderId")?,
        get_required_str(params, "courseId")?,
    ))
}

fn folders_share(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (folder_id, course_id) = link_params(params)?;
    for (sql, noun) in [
        ("SELECT 1 FROM folders WHERE id = ?", "folder"),
        ("SELECT 1 FROM courses WHERE id = ?", "course"),
    ] {
        let id = if noun == "folder" { &folder_id } else { &course_id };
        let exists: Option<i64> = conn
            .query_row(sql, [id], |r| r.get(0))
            .optional()
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(HandlerErr {
                code: "not_found",
                message: format!("{} not found", noun),
                details: None,
            });
        }
    }
    conn.execute(
        "INSERT INTO folder_shares(id, folder_id, course_id) VALUES(?, ?, ?)
         ON CONFLICT(folder_id, course_id) DO NOTHING",
        (Uuid::new_v4().to_string(), &folder_id, &course_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "folder_shares" })),
    })?;
    Ok(json!({ "ok": true }))
}

fn folders_unshare(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let (folder_id, course_id) = link_params(params)?;
    let removed = conn
        .execute(
            "DELETE FROM folder_shares WHERE folder_id = ? AND course_id = ?",
            (&folder_id, &course_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "folder_shares" })),
        })?;
    Ok(json!({ "removed": removed > 0 }))
}

fn with_conn(
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

fn handle_folders_delete(state: &mut AppState, req: &Request) -> Value {
    let (Some(conn), Some(store)) = (state.db.as_ref(), state.store.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let folder_id = match get_required_str(&req.params, "folderId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match deletion::delete_folder(conn, store, &folder_id) {
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
        "folders.create" => Some(with_conn(state, req, folders_create)),
        "folders.list" => Some(with_conn(state, req, folders_list)),
        "folders.share" => Some(with_conn(state, req, folders_share)),
        "folders.unshare" => Some(with_conn(state, req, folders_unshare)),
        "folders.delete" => Some(handle_folders_delete(state, req)),
        _ => None,
    }
}
