//! Binary smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn testfleet() -> Command {
    Command::cargo_bin("testfleet").unwrap()
}

#[test]
fn test_init_then_validate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("testfleet.toml");

    testfleet()
        .args(["init", "--command", "node run.js", "--output"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains(r#"command = "node run.js""#));
    assert!(written.contains(r#"args = ["{test}", "--browser", "{browser}"]"#));

    testfleet()
        .arg("--config")
        .arg(&path)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Strictness: BailNever"));
}

#[test]
fn test_init_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("testfleet.toml");
    std::fs::write(&path, "").unwrap();

    testfleet()
        .args(["init", "--output"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_validate_rejects_unknown_bail_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("testfleet.toml");
    std::fs::write(
        &path,
        "[testfleet]\nbail_strategy = \"sometimes\"\ntests = [\"a.js\"]\n",
    )
    .unwrap();

    testfleet()
        .arg("--config")
        .arg(&path)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown bail strategy: sometimes"));
}

#[cfg(unix)]
#[test]
fn test_run_exit_codes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("testfleet.toml");
    std::fs::write(
        &path,
        format!(
            r#"[testfleet]
max_workers = 2
max_test_attempts = 1
temp_dir = "{}"
browsers = ["sh"]

[testfleet.timing]
stagger_ms = 0
sentry_interval_ms = 20
kill_grace_ms = 100
worker_poll_ms = 5
allocation_backoff_ms = 5
settle_ms = 10

[ports]
start = 31000
range = 900

[framework]
command = "sh -c"
args = ["{{test}}"]
"#,
            dir.path().display()
        ),
    )
    .unwrap();

    testfleet()
        .arg("--config")
        .arg(&path)
        .args(["run", "exit 0", "true"])
        .assert()
        .success()
        .stdout(predicate::str::contains("All tests passed!"));

    testfleet()
        .arg("--config")
        .arg(&path)
        .args(["run", "exit 0", "exit 1"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Some tests failed."));
}
