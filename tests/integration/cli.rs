//! CLI surface tests against the real binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn unitd() -> (Command, tempfile::TempDir) {
    let home = tempdir().expect("tempdir");
    let mut cmd = Command::cargo_bin("unitd").expect("cargo_bin");
    cmd.env("HOME", home.path());
    (cmd, home)
}

#[test]
fn help_describes_the_commands() {
    let (mut cmd, _home) = unitd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("modular service manager"))
        .stdout(predicate::str::contains("enable"))
        .stdout(predicate::str::contains("disable"));
}

#[test]
fn invalid_paths_are_refused() {
    let (mut cmd, _home) = unitd();
    cmd.args(["enable", "db:"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid service path"));
}

#[test]
fn enable_without_a_supervisor_reports_gracefully() {
    let (mut cmd, _home) = unitd();
    cmd.args(["enable", "db:main"]).assert().success();
}

#[test]
fn status_without_a_supervisor_fails() {
    let (mut cmd, _home) = unitd();
    cmd.arg("status").assert().failure();
}

#[test]
fn start_with_a_missing_catalog_fails() {
    let (mut cmd, _home) = unitd();
    cmd.args(["start", "--catalog", "/nonexistent/unitd.yaml"])
        .assert()
        .failure();
}

#[test]
fn unknown_log_levels_are_rejected() {
    let (mut cmd, _home) = unitd();
    cmd.args(["--log-level", "chatty", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid log level"));
}
