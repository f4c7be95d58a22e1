//! Argument-level CLI behavior: help, exit codes, diagnostics. Nothing in
//! here needs a daemon; every case fails (or succeeds) before the first
//! daemon call.

use assert_cmd::Command;
use predicates::prelude::*;

fn dexopt() -> Command {
    Command::cargo_bin("dexopt").unwrap()
}

#[test]
fn help_lists_commands() {
    dexopt()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("dexopt-package"))
        .stdout(predicate::str::contains("bg-dexopt-job"))
        .stdout(predicate::str::contains("snapshot-boot-image-profile"));
}

#[test]
fn no_command_is_a_usage_error() {
    dexopt().assert().failure().code(2);
}

#[test]
fn unknown_package_is_invalid_argument() {
    dexopt()
        .args(["dexopt-package", "com.ghost"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unknown package"));
}

#[test]
fn custom_reason_requires_mode_and_priority() {
    dexopt()
        .args(["dexopt-package", "com.app", "-r", "benchmark"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("requires -m and -p"));
}

#[test]
fn non_batch_reason_rejected_for_batch() {
    dexopt()
        .args(["dexopt-packages", "-r", "install"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("not a batch reason"));
}

#[test]
fn bg_job_flags_are_mutually_exclusive() {
    dexopt()
        .args(["bg-dexopt-job", "--enable", "--disable"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("mutually exclusive"));
}

#[test]
fn bad_prop_override_is_rejected() {
    dexopt()
        .args(["--prop", "no-equals-sign", "dump"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected KEY=VALUE"));
}

#[test]
fn bad_mode_name_is_invalid_argument() {
    dexopt()
        .args(["dexopt-package", "com.app", "-m", "warp-speed"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unknown compiler mode"));
}

#[test]
fn dump_with_empty_snapshot_succeeds() {
    dexopt().arg("dump").assert().success();
}

#[test]
fn snapshot_file_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("snapshot.json");
    std::fs::write(
        &snapshot,
        r#"{
            "packages": {
                "com.app": {
                    "name": "com.app",
                    "splits": [
                        {"split_name": null, "path": "/app/base.apk", "has_code": true}
                    ],
                    "abis": [
                        {"name": "arm64-v8a", "isa": "arm64", "is_primary": true}
                    ]
                }
            }
        }"#,
    )
    .unwrap();

    // The package resolves; the daemon helper is absent, so the per-entry
    // probes degrade to error triples instead of failing the query.
    dexopt()
        .args(["--snapshot"])
        .arg(&snapshot)
        .args(["dump", "com.app"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[com.app]"))
        .stdout(predicate::str::contains("error"));

    // An unknown package against the same snapshot is still a usage error.
    dexopt()
        .args(["--snapshot"])
        .arg(&snapshot)
        .args(["dump", "com.ghost"])
        .assert()
        .failure()
        .code(2);
}
