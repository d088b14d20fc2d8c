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

struct Classroom {
    assignment_id: String,
}

// Batch + course + enrolled students "kim" and "lee", one assignment,
// and a submission from kim only.
fn seed_classroom(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> Classroom {
    let batch = request_ok(
        stdin,
        reader,
        "s1",
        "batches.create",
        json!({ "code": "B1", "name": "Batch One" }),
    );
    let course = request_ok(
        stdin,
        reader,
        "s2",
        "courses.create",
        json!({ "code": "C1", "name": "Algebra" }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s3",
        "courses.enrollBatch",
        json!({ "courseId": str_of(&course, "courseId"), "batchId": str_of(&batch, "batchId") }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s4",
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
    let kim = request_ok(
        stdin,
        reader,
        "s5",
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
    let _ = request_ok(
        stdin,
        reader,
        "s6",
        "users.create",
        json!({
            "username": "lee",
            "email": "lee@school.edu",
            "password": "secret1",
            "role": "student",
            "firstName": "Lee",
            "lastName": "Park",
            "batchCode": "B1"
        }),
    );
    let assignment = request_ok(
        stdin,
        reader,
        "s7",
        "assignments.create",
        json!({ "courseId": str_of(&course, "courseId"), "title": "Homework 1" }),
    );

    let upload = workspace.join("kim-hw1.txt");
    std::fs::write(&upload, b"answers").expect("stage upload");
    let _ = request_ok(
        stdin,
        reader,
        "s8",
        "submissions.create",
        json!({
            "assignmentId": str_of(&assignment, "assignmentId"),
            "studentId": str_of(&kim, "userId"),
            "inPath": upload.to_string_lossy()
        }),
    );

    Classroom {
        assignment_id: str_of(&assignment, "assignmentId"),
    }
}

#[test]
fn grade_import_updates_submissions_and_flags_bad_rows() {
    let workspace = temp_dir("coursebook-import-grades");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let classroom = seed_classroom(&mut stdin, &mut reader, &workspace);

    // kim gets a grade; lee never submitted; mr-t is not a student;
    // zoe does not exist.
    let csv = "username,grade,feedback\n\
               kim,88.5,solid work\n\
               lee,70,\n\
               mr-t,50,\n\
               zoe,90,\n";
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "import.grades",
        json!({ "assignmentId": classroom.assignment_id, "csvText": csv }),
    );
    assert_eq!(report["summary"]["total"], json!(4));
    assert_eq!(report["summary"]["created"], json!(1));
    assert_eq!(report["summary"]["errors"], json!(3));
    let messages: Vec<String> = report["results"]["errors"]
        .as_array()
        .expect("errors")
        .iter()
        .map(|e| e["message"].as_str().unwrap_or("").to_string())
        .collect();
    assert!(messages
        .iter()
        .any(|m| m.contains("no submission from 'lee' for this assignment")));
    assert!(messages.iter().any(|m| m.contains("user 'mr-t' is not a student")));
    assert!(messages.iter().any(|m| m.contains("username 'zoe' not found")));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "submissions.list",
        json!({ "assignmentId": classroom.assignment_id }),
    );
    let kim_row = listed["submissions"]
        .as_array()
        .expect("submissions")
        .iter()
        .find(|s| s["username"] == json!("kim"))
        .cloned()
        .expect("kim submission");
    assert_eq!(kim_row["grade"], json!(88.5));
    assert_eq!(kim_row["feedback"], json!("solid work"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn conflicting_identifiers_and_bad_grades_are_row_errors() {
    let workspace = temp_dir("coursebook-import-grades-ids");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let classroom = seed_classroom(&mut stdin, &mut reader, &workspace);

    // Row 2 names kim's username but lee's email; row 3 is out of range;
    // row 4 is the one valid update, identified by email alone.
    let csv = "username,email,grade\n\
               kim,lee@school.edu,80\n\
               kim,,150\n\
               ,kim@school.edu,95\n";
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "import.grades",
        json!({ "assignmentId": classroom.assignment_id, "csvText": csv }),
    );
    assert_eq!(report["summary"]["created"], json!(1));
    assert_eq!(report["summary"]["errors"], json!(2));
    let messages: Vec<String> = report["results"]["errors"]
        .as_array()
        .expect("errors")
        .iter()
        .map(|e| e["message"].as_str().unwrap_or("").to_string())
        .collect();
    assert!(messages
        .iter()
        .any(|m| m.contains("username and email identify different users")));
    assert!(messages
        .iter()
        .any(|m| m.contains("grade '150' must be a number between 0 and 100")));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn grade_import_requires_an_existing_assignment() {
    let workspace = temp_dir("coursebook-import-grades-missing");
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
        "import.grades",
        json!({ "assignmentId": "missing", "csvText": "username,grade\nkim,90\n" }),
    );
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(resp["error"]["code"], json!("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
