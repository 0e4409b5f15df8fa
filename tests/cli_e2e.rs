//! End-to-end smoke tests for the CLI binary.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_the_subcommands() {
    Command::cargo_bin("readstash")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("fetch")
                .and(predicate::str::contains("download"))
                .and(predicate::str::contains("status"))
                .and(predicate::str::contains("delete")),
        );
}

#[test]
fn status_works_offline_and_creates_the_session() {
    let dir = tempfile::TempDir::new().unwrap();

    Command::cargo_bin("readstash")
        .unwrap()
        .args([
            "--data-dir",
            dir.path().to_str().unwrap(),
            "--token",
            "e2e-token",
            "status",
        ])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("session")
                .and(predicate::str::contains("idle"))
                .and(predicate::str::contains("articles on disk 0")),
        );

    // The session directory was materialized under the data dir.
    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn missing_token_is_a_clear_error() {
    let dir = tempfile::TempDir::new().unwrap();

    Command::cargo_bin("readstash")
        .unwrap()
        .env_remove("READSTASH_TOKEN")
        .args(["--data-dir", dir.path().to_str().unwrap(), "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("READSTASH_TOKEN"));
}

#[test]
fn delete_refuses_without_confirmation() {
    let dir = tempfile::TempDir::new().unwrap();

    Command::cargo_bin("readstash")
        .unwrap()
        .args([
            "--data-dir",
            dir.path().to_str().unwrap(),
            "--token",
            "e2e-token",
            "delete",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--yes"));
}

#[test]
fn delete_with_yes_removes_the_session_directory() {
    let dir = tempfile::TempDir::new().unwrap();

    // Materialize the session first.
    Command::cargo_bin("readstash")
        .unwrap()
        .args([
            "--data-dir",
            dir.path().to_str().unwrap(),
            "--token",
            "e2e-token",
            "status",
        ])
        .assert()
        .success();

    Command::cargo_bin("readstash")
        .unwrap()
        .args([
            "--data-dir",
            dir.path().to_str().unwrap(),
            "--token",
            "e2e-token",
            "delete",
            "--yes",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("session deleted"));

    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(entries.is_empty());
}
