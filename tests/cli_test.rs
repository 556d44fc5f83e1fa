// file: tests/cli_test.rs
// version: 1.1.0
// guid: 8b1f4c67-2e93-4d0a-a5c8-7f3e9b2d6014

//! Exit codes and output of the `syntropy` binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn syntropy(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("syntropy").unwrap();
    cmd.env("HOME", home.path())
        .env("USERPROFILE", home.path())
        .env("USER", "alice")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_commands() {
    let home = TempDir::new().unwrap();
    syntropy(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("record-node"));
}

#[test]
fn test_invalid_node_name_exits_2() {
    let home = TempDir::new().unwrap();
    syntropy(&home)
        .args(["create", "--auto-detect", "--node-name", "x"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("INVALID_INTENT"))
        .stderr(predicate::str::contains("node_name"));
}

#[test]
fn test_invalid_intent_reports_every_field_as_json() {
    let home = TempDir::new().unwrap();
    let output = syntropy(&home)
        .args([
            "--json",
            "--quiet",
            "create",
            "--auto-detect",
            "--node-name",
            "bad name",
            "--label",
            "lower",
        ])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8(output.stderr).unwrap();
    let start = stderr.find('{').unwrap();
    let report: serde_json::Value = serde_json::from_str(&stderr[start..]).unwrap();
    assert_eq!(report["code"], "INVALID_INTENT");
    assert_eq!(report["exit_code"], 2);
    assert_eq!(report["phase"], "ValidateIntent");
    let message = report["message"].as_str().unwrap();
    assert!(message.contains("node_name"));
    assert!(message.contains("label"));
}

#[test]
fn test_create_needs_a_device_selector() {
    let home = TempDir::new().unwrap();
    syntropy(&home)
        .args(["create", "--node-name", "node-01"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("DEVICE"));
}

#[test]
fn test_empty_key_listing() {
    let home = TempDir::new().unwrap();
    syntropy(&home)
        .args(["--quiet", "--json", "keys", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_debug_reports_root_and_tools() {
    let home = TempDir::new().unwrap();
    syntropy(&home)
        .args(["--quiet", "--json", "debug"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"running_as_root\""))
        .stdout(predicate::str::contains("sgdisk"));
}

#[test]
fn test_record_node_without_identity_exits_6() {
    let home = TempDir::new().unwrap();
    syntropy(&home)
        .args(["record-node", "--node-name", "node-01"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("IDENTITY_FAILURE"));
    assert!(!home.path().join(".syntropy/nodes/node-01.json").exists());
}

#[test]
fn test_format_rejects_label_before_touching_devices() {
    let home = TempDir::new().unwrap();
    syntropy(&home)
        .args(["format", "/dev/does-not-exist", "--label", "far too long label"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("label"));
}

#[test]
fn test_empty_cache_listing() {
    let home = TempDir::new().unwrap();
    syntropy(&home).args(["cache", "list"]).assert().success();
}

#[test]
fn test_broken_config_is_reported() {
    let home = TempDir::new().unwrap();
    let state = home.path().join(".syntropy");
    std::fs::create_dir_all(&state).unwrap();
    std::fs::write(state.join("config.yaml"), "seed:\n  gateway: ${SYNTROPY_UNSET_GATEWAY}\n").unwrap();

    syntropy(&home)
        .env_remove("SYNTROPY_UNSET_GATEWAY")
        .args(["keys", "list"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("SYNTROPY_UNSET_GATEWAY"));
}
