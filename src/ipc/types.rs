use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::store::LocalStore;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Operational ceilings, constructed once at startup and passed in; business
/// logic never reads the process environment itself.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_import_rows: usize,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub store: Option<LocalStore>,
    pub limits: Limits,
}
