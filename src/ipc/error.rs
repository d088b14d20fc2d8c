use crate::deletion::{blocked_details, blocked_message, DeleteError};
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Every delete entry point maps its failures through here so a guard
/// violation looks the same no matter which handler raised it.
pub fn delete_error(id: &str, e: DeleteError) -> serde_json::Value {
    match e {
        DeleteError::NotFound(noun) => err(id, "not_found", format!("{} not found", noun), None),
        DeleteError::Blocked(blocked) => err(
            id,
            "delete_blocked",
            format!("cannot delete: {} depend on it", blocked_message(&blocked)),
            Some(blocked_details(&blocked)),
        ),
        DeleteError::Db(e) => err(id, "db_delete_failed", e.to_string(), None),
    }
}
