use serde_json::{json, Value};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

const MESSAGES: &str = r#"{"_": "Message", "id": 3, "out": false, "message": "Deploy finished", "from_id": {"_": "PeerUser", "user_id": 42}, "media": {"_": "MessageMediaPhoto", "photo": null}, "access_hash": 11}
{"_": "Message", "id": 2, "out": true, "message": "ok", "from_id": {"_": "PeerUser", "user_id": 7}, "media": null}
{"_": "Message", "id": 1, "out": false, "message": "no media", "from_id": {"_": "PeerUser", "user_id": 42}, "media": null, "entities": [{"_": "MessageEntityBold", "offset": 0, "length": 2}]}
"#;

fn run_filter(dir: &Path, args: &[&str], input: &[u8]) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_tgpipe"))
        .arg("filter")
        .args(args)
        .env("TGPIPE_CONFIG_PATH", dir.join("missing-config.yaml"))
        .env("TGPIPE_PROFILES_PATH", dir.join("profiles.json"))
        .env("TGPIPE_DATA_DIR", dir.join("data"))
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to execute tgpipe binary");

    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(input)
        .expect("write stdin");
    child.wait_with_output().expect("wait for tgpipe")
}

fn records(output: &Output) -> Vec<Value> {
    assert!(
        output.status.success(),
        "tgpipe failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("each stdout line should be json"))
        .collect()
}

#[test]
fn passes_every_record_without_filters() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = run_filter(dir.path(), &[], MESSAGES.as_bytes());
    let ids: Vec<_> = records(&output).iter().map(|record| record["id"].clone()).collect();
    assert_eq!(ids, vec![json!(3), json!(2), json!(1)]);
}

#[test]
fn records_start_with_the_type_tag() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = run_filter(dir.path(), &[], MESSAGES.as_bytes());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.lines().all(|line| line.starts_with("{\"_\":\"Message\",\"id\":")));
}

#[test]
fn media_and_sender_filters_combine() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = run_filter(dir.path(), &["--has-media", "--from-user", "42"], MESSAGES.as_bytes());
    let records = records(&output);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], json!(3));
}

#[test]
fn pattern_is_case_insensitive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = run_filter(dir.path(), &["--pattern", "deploy"], MESSAGES.as_bytes());
    let records = records(&output);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["message"], json!("Deploy finished"));
}

#[test]
fn conflicting_direction_fails_without_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = run_filter(dir.path(), &["--incoming-only", "--outgoing-only"], MESSAGES.as_bytes());
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cannot be combined"));
}

#[test]
fn malformed_pattern_fails_without_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = run_filter(dir.path(), &["--pattern", "(["], MESSAGES.as_bytes());
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn profile_redacts_keys_and_objects() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("profiles.json"),
        r#"{"slim": {"stop_keys": ["access_hash"], "stop_objects": ["MessageEntityBold", "PeerUser"]}}"#,
    )
    .expect("write profiles");

    let output = run_filter(dir.path(), &["--profile", "slim"], MESSAGES.as_bytes());
    let records = records(&output);
    assert_eq!(records.len(), 3);
    assert!(records[0].get("access_hash").is_none());
    assert!(records[0].get("from_id").is_none());
    assert_eq!(records[0]["message"], json!("Deploy finished"));
    assert_eq!(records[2]["entities"], json!([]));
}

#[test]
fn unknown_profile_leaves_records_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = run_filter(dir.path(), &["--profile", "nope"], MESSAGES.as_bytes());
    let records = records(&output);
    assert_eq!(records[0]["access_hash"], json!(11));
}

#[test]
fn unparseable_lines_become_strings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = run_filter(dir.path(), &[], b"not json\n");
    assert_eq!(records(&output), vec![json!("not json")]);
}

#[test]
fn invalid_utf8_line_does_not_stop_the_stream() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = b"{\"_\": \"Message\", \"id\": 1}\n\xff\xfe bad\n{\"_\": \"Message\", \"id\": 2}\n";
    let output = run_filter(dir.path(), &[], input);
    let records = records(&output);
    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["id"], json!(1));
    assert!(records[1].as_str().is_some_and(|text| text.ends_with(" bad")));
    assert_eq!(records[2]["id"], json!(2));
}
