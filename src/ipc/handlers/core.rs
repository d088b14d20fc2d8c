use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::LocalStore;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
    });
    ok(&req.id, result)
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let path = match req.params.get("path").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => PathBuf::from(v),
        _ => return err(&req.id, "bad_params", "missing path", None),
    };

    let conn = match db::open_db(&path) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "workspace_open_failed", e.to_string(), None),
    };
    let store = match LocalStore::open(&path) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "workspace_open_failed", e.to_string(), None),
    };

    state.workspace = Some(path.clone());
    state.db = Some(conn);
    state.store = Some(store);
    ok(
        &req.id,
        json!({ "workspacePath": path.to_string_lossy().to_string() }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
