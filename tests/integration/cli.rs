//! End-to-end runs of the `rewind` binary

use assert_cmd::Command;
use predicates::prelude::*;
use rewind::{Database, TimelineStore};
use tempfile::TempDir;

fn rewind(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("rewind").unwrap();
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

#[test]
fn test_standalone_trace_prints_and_records() {
    let data = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let script = work.path().join("main.py");
    std::fs::write(
        &script,
        "def square(n):\n    return n * n\nprint(square(7))\n",
    )
    .unwrap();

    rewind(&data)
        .arg("trace")
        .arg(&script)
        .arg("--standalone")
        .assert()
        .success()
        .stdout("49\n");

    let store = TimelineStore::new(Database::open(data.path().join("trace.db")).unwrap());
    let file = script.canonicalize().unwrap().display().to_string();
    let events = store.all_events(&file).unwrap();
    assert!(!events.is_empty());
    let ids: Vec<i64> = events.iter().map(|e| e.sequence_id).collect();
    assert_eq!(ids, (1..=events.len() as i64).collect::<Vec<_>>());
    assert!(events
        .iter()
        .any(|e| e.function.as_deref() == Some("square")));
}

#[test]
fn test_uncaught_error_exits_one_with_traceback() {
    let data = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let script = work.path().join("boom.py");
    std::fs::write(&script, "x = 1\ny = x / 0\n").unwrap();

    rewind(&data)
        .arg("trace")
        .arg(&script)
        .arg("--standalone")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("ZeroDivisionError"));
}

#[test]
fn test_missing_script_is_an_environment_failure() {
    let data = TempDir::new().unwrap();

    rewind(&data)
        .arg("trace")
        .arg(data.path().join("nope.py"))
        .arg("--standalone")
        .assert()
        .code(2);
}

#[test]
fn test_watch_without_target_exits_one() {
    let data = TempDir::new().unwrap();

    rewind(&data)
        .arg("watch")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no active target"));
}

#[test]
fn test_logs_go_to_the_data_dir() {
    let data = TempDir::new().unwrap();

    rewind(&data).arg("watch").assert().code(1);

    assert!(data.path().join("logs").join("watch.log").exists());
}
