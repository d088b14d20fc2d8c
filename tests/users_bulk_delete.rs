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
fn bulk_delete_processes_every_item_and_reports_each_failure() {
    let workspace = temp_dir("coursebook-bulk-delete");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "code": "C1", "name": "Algebra" }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({
            "username": "mr-t",
            "email": "t@school.edu",
            "password": "secret1",
            "role": "teacher",
            "firstName": "Tom",
            "lastName": "Ma"
        }),
    );
    let teacher_id = str_of(&teacher, "userId");
    // The course link blocks the teacher's deletion.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "courses.assignTeacher",
        json!({ "courseId": str_of(&course, "courseId"), "teacherId": teacher_id }),
    );
    let clean = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "users.create",
        json!({
            "username": "amy",
            "email": "amy@school.edu",
            "password": "secret1",
            "role": "admin",
            "firstName": "Amy",
            "lastName": "Lin"
        }),
    );
    let clean_id = str_of(&clean, "userId");

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "users.bulkDelete",
        json!({ "userIds": ["ghost", teacher_id, clean_id] }),
    );
    assert_eq!(result["success"], json!(true));
    assert_eq!(result["summary"]["total"], json!(3));
    assert_eq!(result["summary"]["deleted"], json!(1));
    assert_eq!(result["summary"]["errors"], json!(2));
    assert_eq!(result["results"]["success"], json!([clean_id]));

    let errors = result["results"]["errors"].as_array().expect("errors");
    let ghost = errors
        .iter()
        .find(|e| e["userId"] == json!("ghost"))
        .expect("ghost entry");
    assert_eq!(ghost["reason"], json!("user not found"));
    let blocked = errors
        .iter()
        .find(|e| e["userId"] == json!(teacher_id.clone()))
        .expect("teacher entry");
    let reason = blocked["reason"].as_str().expect("reason");
    assert!(reason.contains("1 course link(s)"), "{}", reason);

    // The blocked teacher survived; only the clean user is gone.
    let listed = request_ok(&mut stdin, &mut reader, "7", "users.list", json!({}));
    let usernames: Vec<&str> = listed["users"]
        .as_array()
        .expect("users")
        .iter()
        .filter_map(|u| u["username"].as_str())
        .collect();
    assert_eq!(usernames, vec!["mr-t"]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bulk_delete_rejects_an_empty_id_list() {
    let workspace = temp_dir("coursebook-bulk-empty");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "users.bulkDelete",
        json!({ "userIds": [] }),
    );
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(resp["error"]["code"], json!("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
