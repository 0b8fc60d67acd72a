use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::{tempdir, TempDir};

const KV_FIXTURE: &str = r#"
fixture:
  name: kv
  backend: local
  image: local/kv
  ports: [7070]
  init:
    scripts: [seed.kv]
  readiness:
    kind: tcp
    timeout_ms: 5000
    poll_interval_ms: 50
"#;

fn fixture_cmd() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("fixture"));
    cmd.env("FIXTURE_LOG_OUTPUT", "none");
    cmd
}

fn write_fixture(dir: &TempDir, yaml: &str, script: &str) -> PathBuf {
    fs::write(dir.path().join("seed.kv"), script).unwrap();
    let path = dir.path().join("fixture.yaml");
    fs::write(&path, yaml).unwrap();
    path
}

fn kv_fixture(dir: &TempDir) -> PathBuf {
    write_fixture(dir, KV_FIXTURE, "SET user:1 ada\n")
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn validate_accepts_a_good_file() {
    let dir = tempdir().unwrap();
    let path = kv_fixture(&dir);

    fixture_cmd()
        .args(["validate", arg(&path)])
        .assert()
        .success()
        .stderr(predicate::str::contains("fixture 'kv' (local backend"));
}

#[test]
fn validate_lists_every_problem() {
    let dir = tempdir().unwrap();
    let path = write_fixture(
        &dir,
        "fixture:\n  name: kv\n  image: \"\"\n  ports: [7070, 7070]\nrun:\n  workers: 0\n",
        "",
    );

    fixture_cmd()
        .args(["validate", arg(&path)])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("3 problem(s)"))
        .stderr(predicate::str::contains("image must not be empty"))
        .stderr(predicate::str::contains("port 7070 is listed more than once"))
        .stderr(predicate::str::contains("run.workers must be at least 1"));
}

#[test]
fn validate_reports_unreadable_file() {
    fixture_cmd()
        .args(["validate", "/nonexistent/fixture.yaml"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn check_starts_and_tears_down_local_engine() {
    let dir = tempdir().unwrap();
    let path = kv_fixture(&dir);

    fixture_cmd()
        .args(["check", arg(&path)])
        .assert()
        .success()
        .stderr(predicate::str::contains("ready at 127.0.0.1:"))
        .stderr(predicate::str::contains("torn down"));
}

#[cfg(unix)]
#[test]
fn run_exports_the_endpoint_to_the_command() {
    let dir = tempdir().unwrap();
    let path = kv_fixture(&dir);
    let report = dir.path().join("report.json");

    fixture_cmd()
        .args(["run", arg(&path), "--report", arg(&report), "--"])
        .args([
            "sh",
            "-c",
            "test \"$FIXTURE_HOST\" = 127.0.0.1 && test \"$FIXTURE_PORT_7070\" = \"$FIXTURE_PORT\" \
             && test \"$FIXTURE_ENDPOINT\" = \"127.0.0.1:$FIXTURE_PORT\"",
        ])
        .assert()
        .success()
        .stderr(predicate::str::contains("1 passed, 0 failed, 0 skipped"));

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(json["status"], "passed");
    assert_eq!(json["teardown_completed"], true);
    assert_eq!(json["cases"][0]["outcome"], "passed");
}

#[cfg(unix)]
#[test]
fn failing_command_exits_with_one() {
    let dir = tempdir().unwrap();
    let path = kv_fixture(&dir);

    fixture_cmd()
        .args(["run", arg(&path), "--", "sh", "-c", "exit 3"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("command exited with status 3"));
}

#[cfg(unix)]
#[test]
fn broken_init_script_exits_with_two() {
    let dir = tempdir().unwrap();
    let path = write_fixture(&dir, KV_FIXTURE, "SET user:1 ada\nSETX oops\n");

    fixture_cmd()
        .args(["run", arg(&path), "--", "sh", "-c", "exit 0"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("init script failed"))
        .stderr(predicate::str::contains("skipped"));
}

#[test]
fn run_requires_a_command() {
    let dir = tempdir().unwrap();
    let path = kv_fixture(&dir);

    fixture_cmd()
        .args(["run", arg(&path)])
        .assert()
        .failure();
}
