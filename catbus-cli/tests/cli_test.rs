//! Binary-level tests for the catbus CLI.

use assert_cmd::Command;
use predicates::prelude::*;

fn catbus() -> Command {
    let mut cmd = Command::cargo_bin("catbus").unwrap();
    cmd.env("CATBUS_LOG_LEVEL", "error").arg("--no-color");
    cmd
}

#[test]
fn test_help_lists_commands() {
    catbus()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("consume"))
        .stdout(predicate::str::contains("publish"))
        .stdout(predicate::str::contains("topology"))
        .stdout(predicate::str::contains("demo"));
}

#[test]
fn test_deleted_without_id_fails() {
    catbus()
        .args(["publish", "deleted"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--id"));
}

#[test]
fn test_demo_runs_in_memory() {
    catbus()
        .args(["demo", "--delay-ms", "100", "--id", "42"])
        .assert()
        .success()
        .stdout(predicate::str::contains("publish #1: delivered"))
        .stdout(predicate::str::contains("publish #2: delivered"))
        .stdout(predicate::str::contains("dead-lettered (unroutable)"))
        .stdout(predicate::str::contains("primary acked: 2, dead-letter acked: 1"));
}
