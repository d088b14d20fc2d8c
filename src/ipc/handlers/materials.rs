use crate::deletion;
use crate::ipc::error::{delete_error, err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::{FileStore, LocalStore};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::path::Path;
use uuid::Uuid;

const DEFAULT_SIGN_EXPIRY_SECS: i64 = 900;

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

fn require_row(conn: &Connection, sql: &str, id: &str, noun: &str) -> Result<(), HandlerErr> {
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
    Ok(())
}

fn store_upload(store: &LocalStore, in_path: &str) -> Result<String, HandlerErr> {
    let bytes = std::fs::read(in_path).map_err(|e| HandlerErr {
        code: "upload_read_failed",
        message: e.to_string(),
        details: Some(json!({ "path": in_path })),
    })?;
    let name = Path::new(in_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());
    store.store(&name, &bytes).map_err(|e| HandlerErr {
        code: "store_failed",
        message: e.to_string(),
        details: None,
    })
}

fn materials_upload(
    conn: &Connection,
    store: &LocalStore,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let title = get_required_str(params, "title")?;
    let in_path = get_required_str(params, "inPath")?;
    let folder_id = get_opt_str(params, "folderId");
    let course_id = get_opt_str(params, "courseId");
    let uploaded_by = get_opt_str(params, "uploadedBy");

    // Exactly one owner, folder or course.
    match (&folder_id, &course_id) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(HandlerErr {
                code: "bad_params",
                message: "provide exactly one of folderId or courseId".to_string(),
                details: None,
            });
        }
        _ => {}
    }
    if let Some(folder_id) = &folder_id {
        require_row(conn, "SELECT 1 FROM folders WHERE id = ?", folder_id, "folder")?;
    }
    if let Some(course_id) = &course_id {
        require_row(conn, "SELECT 1 FROM courses WHERE id = ?", course_id, "course")?;
    }
    if let Some(uploaded_by) = &uploaded_by {
        require_row(conn, "SELECT 1 FROM users WHERE id = ?", uploaded_by, "user")?;
    }

    let file_url = store_upload(store, &in_path)?;
    let material_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO materials(id, folder_id, course_id, title, file_url, uploaded_by)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &material_id,
            folder_id.as_deref(),
            course_id.as_deref(),
            &title,
            &file_url,
            uploaded_by.as_deref(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "materials" })),
    })?;
    Ok(json!({ "materialId": material_id, "fileUrl": file_url }))
}

fn materials_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let folder_id = get_opt_str(params, "folderId");
    let course_id = get_opt_str(params, "courseId");
    let (sql, key) = match (&folder_id, &course_id) {
        (Some(id), None) => (
            "SELECT id, title, file_url, uploaded_by FROM materials
             WHERE folder_id = ? ORDER BY title",
            id,
        ),
        (None, Some(id)) => (
            "SELECT id, title, file_url, uploaded_by FROM materials
             WHERE course_id = ? ORDER BY title",
            id,
        ),
        _ => {
            return Err(HandlerErr {
                code: "bad_params",
                message: "provide exactly one of folderId or courseId".to_string(),
                details: None,
            });
        }
    };
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map([key], |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let file_url: String = r.get(2)?;
            let uploaded_by: Option<String> = r.get(3)?;
            Ok(json!({
                "id": id,
                "title": title,
                "fileUrl": file_url,
                "uploadedBy": uploaded_by
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "materials": rows }))
}

fn materials_sign_url(
    conn: &Connection,
    store: &LocalStore,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let material_id = get_required_str(params, "materialId")?;
    let expires_in = params
        .get("expiresInSecs")
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_SIGN_EXPIRY_SECS);
    if expires_in <= 0 {
        return Err(HandlerErr {
            code: "bad_params",
            message: "expiresInSecs must be positive".to_string(),
            details: None,
        });
    }
    let url: Option<String> = conn
        .query_row(
            "SELECT file_url FROM materials WHERE id = ?",
            [&material_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let Some(url) = url else {
        return Err(HandlerErr {
            code: "not_found",
            message: "material not found".to_string(),
            details: None,
        });
    };
    let signed = store.sign(&url, expires_in).map_err(|e| HandlerErr {
        code: "sign_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(json!({ "url": signed, "expiresInSecs": expires_in }))
}

fn assignment_materials_upload(
    conn: &Connection,
    store: &LocalStore,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let title = get_required_str(params, "title")?;
    let in_path = get_required_str(params, "inPath")?;
    require_row(
        conn,
        "SELECT 1 FROM assignments WHERE id = ?",
        &assignment_id,
        "assignment",
    )?;

    let file_url = store_upload(store, &in_path)?;
    let material_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assignment_materials(id, assignment_id, title, file_url)
         VALUES(?, ?, ?, ?)",
        (&material_id, &assignment_id, &title, &file_url),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "assignment_materials" })),
    })?;
    Ok(json!({ "materialId": material_id, "fileUrl": file_url }))
}

fn assignment_materials_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, title, file_url FROM assignment_materials
             WHERE assignment_id = ? ORDER BY title",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([&assignment_id], |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let file_url: String = r.get(2)?;
            Ok(json!({ "id": id, "title": title, "fileUrl": file_url }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "materials": rows }))
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

fn with_store(
    state: &mut AppState,
    req: &Request,
    f: impl Fn(&Connection, &LocalStore, &Value) -> Result<Value, HandlerErr>,
) -> Value {
    let (Some(conn), Some(store)) = (state.db.as_ref(), state.store.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, store, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_delete(
    state: &mut AppState,
    req: &Request,
    key: &str,
    f: impl Fn(&Connection, &dyn FileStore, &str) -> Result<(), deletion::DeleteError>,
) -> Value {
    let (Some(conn), Some(store)) = (state.db.as_ref(), state.store.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let id = match get_required_str(&req.params, key) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match f(conn, store, &id) {
        Ok(()) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => delete_error(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "materials.upload" => Some(with_store(state, req, materials_upload)),
        "materials.list" => Some(with_conn(state, req, materials_list)),
        "materials.signUrl" => Some(with_store(state, req, materials_sign_url)),
        "materials.delete" => Some(handle_delete(
            state,
            req,
            "materialId",
            deletion::delete_material,
        )),
        "assignmentMaterials.upload" => Some(with_store(state, req, assignment_materials_upload)),
        "assignmentMaterials.list" => Some(with_conn(state, req, assignment_materials_list)),
        "assignmentMaterials.delete" => Some(handle_delete(
            state,
            req,
            "materialId",
            deletion::delete_assignment_material,
        )),
        _ => None,
    }
}
