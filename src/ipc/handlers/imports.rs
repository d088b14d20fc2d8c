use crate::imports::{self, ImportError, ImportReport};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

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

fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

/// CSV payloads arrive either inline (csvText) or as a path to a file the
/// caller staged on disk (inPath).
fn csv_text(params: &Value) -> Result<String, HandlerErr> {
    if let Some(text) = params.get("csvText").and_then(|v| v.as_str()) {
        return Ok(text.to_string());
    }
    let in_path = get_required_str(params, "inPath").map_err(|_| HandlerErr {
        code: "bad_params",
        message: "missing csvText or inPath".to_string(),
        details: None,
    })?;
    std::fs::read_to_string(&in_path).map_err(|e| HandlerErr {
        code: "parse_failed",
        message: e.to_string(),
        details: Some(json!({ "path": in_path })),
    })
}

fn import_error(e: ImportError) -> HandlerErr {
    match e {
        ImportError::Empty => HandlerErr {
            code: "empty_file",
            message: "the file contains no data rows".to_string(),
            details: None,
        },
        ImportError::TooManyRows { limit, actual } => HandlerErr {
            code: "too_many_rows",
            message: format!("file has {} rows, limit is {}", actual, limit),
            details: Some(json!({ "limit": limit, "actual": actual })),
        },
        ImportError::MissingHeaders { missing } => HandlerErr {
            code: "missing_headers",
            message: format!("missing required column(s): {}", missing.join(", ")),
            details: Some(json!({ "missing": missing })),
        },
        ImportError::Db(e) => HandlerErr {
            code: "db_tx_failed",
            message: e.to_string(),
            details: None,
        },
    }
}

fn report_value(report: ImportReport) -> Result<Value, HandlerErr> {
    serde_json::to_value(report).map_err(|e| HandlerErr {
        code: "internal",
        message: e.to_string(),
        details: None,
    })
}

fn run_users(conn: &Connection, params: &Value, max_rows: usize) -> Result<Value, HandlerErr> {
    let text = csv_text(params)?;
    let report = imports::run_user_import(conn, &text, max_rows).map_err(import_error)?;
    report_value(report)
}

fn run_enrollments(
    conn: &Connection,
    params: &Value,
    max_rows: usize,
) -> Result<Value, HandlerErr> {
    let text = csv_text(params)?;
    let report = imports::run_enrollment_import(conn, &text, max_rows).map_err(import_error)?;
    report_value(report)
}

fn run_grades(conn: &Connection, params: &Value, max_rows: usize) -> Result<Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "assignment not found".to_string(),
            details: None,
        });
    }
    let text = csv_text(params)?;
    let report =
        imports::run_grade_import(conn, &assignment_id, &text, max_rows).map_err(import_error)?;
    report_value(report)
}

fn dispatch(
    state: &mut AppState,
    req: &Request,
    f: impl Fn(&Connection, &Value, usize) -> Result<Value, HandlerErr>,
) -> Value {
    let max_rows = state.limits.max_import_rows;
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params, max_rows) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "import.users" => Some(dispatch(state, req, run_users)),
        "import.enrollments" => Some(dispatch(state, req, run_enrollments)),
        "import.grades" => Some(dispatch(state, req, run_grades)),
        _ => None,
    }
}
