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

fn spawn_sidecar_with_env(env: &[(&str, &str)]) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_coursebookd");
    let mut cmd = Command::new(exe);
    for (k, v) in env {
        cmd.env(k, v);
    }
    let mut child = cmd
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

fn error_code(resp: &serde_json::Value) -> String {
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

#[test]
fn whole_file_rejections_touch_no_rows() {
    let workspace = temp_dir("coursebook-file-errors");
    let (mut child, mut stdin, mut reader) =
        spawn_sidecar_with_env(&[("COURSEBOOKD_MAX_IMPORT_ROWS", "2")]);

    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Missing required column.
    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "import.users",
        json!({ "csvText": "username,email,password,role,first_name\namy,a@x.co,secret1,teacher,Amy\n" }),
    );
    assert_eq!(error_code(&resp), "missing_headers");
    assert_eq!(
        resp["error"]["details"]["missing"],
        json!(["last_name"])
    );

    // Header only, no data rows.
    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "import.users",
        json!({ "csvText": "username,email,password,role,first_name,last_name\n" }),
    );
    assert_eq!(error_code(&resp), "empty_file");

    // Over the configured row ceiling.
    let csv = "username,email,password,role,first_name,last_name\n\
               a,a@x.co,secret1,teacher,A,One\n\
               b,b@x.co,secret1,teacher,B,Two\n\
               c,c@x.co,secret1,teacher,C,Three\n";
    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "import.users",
        json!({ "csvText": csv }),
    );
    assert_eq!(error_code(&resp), "too_many_rows");
    assert_eq!(resp["error"]["details"]["limit"], json!(2));
    assert_eq!(resp["error"]["details"]["actual"], json!(3));

    // None of the rejected files may have left rows behind.
    let listed = request(&mut stdin, &mut reader, "5", "users.list", json!({}));
    assert_eq!(listed["result"]["users"].as_array().map(|u| u.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn import_requires_a_selected_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar_with_env(&[]);

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "import.users",
        json!({ "csvText": "username,email,password,role,first_name,last_name\n" }),
    );
    assert_eq!(error_code(&resp), "no_workspace");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn unreadable_staged_file_is_a_parse_failure() {
    let workspace = temp_dir("coursebook-file-missing");
    let (mut child, mut stdin, mut reader) = spawn_sidecar_with_env(&[]);

    let _ = request(
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
        "import.users",
        json!({ "inPath": workspace.join("does-not-exist.csv").to_string_lossy() }),
    );
    assert_eq!(error_code(&resp), "parse_failed");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
