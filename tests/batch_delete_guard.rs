use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_coursebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn coursebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let resp = request(stdin, reader, id, method, params);
    assert_eq!(
        resp.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "expected ok for {}: {}",
        method,
        resp
    );
    resp.get("result").cloned().expect("result")
}

fn str_of(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {}: {}", key, v))
        .to_string()
}

#[test]
fn batch_with_students_refuses_deletion() {
    let workspace = temp_dir("coursebook-batch-guard");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let batch = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "batches.create",
        json!({ "code": "B1", "name": "Batch One" }),
    );
    let batch_id = str_of(&batch, "batchId");
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({
            "username": "kim",
            "email": "kim@school.edu",
            "password": "secret1",
            "role": "student",
            "firstName": "Kim",
            "lastName": "Ito",
            "batchCode": "B1"
        }),
    );

    let blocked = request(
        &mut stdin,
        &mut reader,
        "4",
        "batches.delete",
        json!({ "batchId": batch_id }),
    );
    assert_eq!(blocked["ok"], json!(false));
    assert_eq!(blocked["error"]["code"], json!("delete_blocked"));
    let message = blocked["error"]["message"].as_str().expect("message");
    assert!(message.contains("1 student(s)"), "{}", message);

    // Deleting the student clears the guard.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "users.delete",
        json!({ "userId": str_of(&student, "userId") }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "batches.delete",
        json!({ "batchId": batch_id }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "7", "batches.list", json!({}));
    assert_eq!(listed["batches"].as_array().map(|b| b.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn enrolled_batch_is_also_blocked() {
    let workspace = temp_dir("coursebook-batch-enrolled");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let batch = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "batches.create",
        json!({ "code": "B1", "name": "Batch One" }),
    );
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({ "code": "C1", "name": "Algebra" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "courses.enrollBatch",
        json!({ "courseId": str_of(&course, "courseId"), "batchId": str_of(&batch, "batchId") }),
    );

    let blocked = request(
        &mut stdin,
        &mut reader,
        "5",
        "batches.delete",
        json!({ "batchId": str_of(&batch, "batchId") }),
    );
    assert_eq!(blocked["error"]["code"], json!("delete_blocked"));
    let message = blocked["error"]["message"].as_str().expect("message");
    assert!(message.contains("1 course enrollment(s)"), "{}", message);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
