#![allow(deprecated)] // TODO: cargo_bin → cargo_bin_cmd! へ移行

use assert_cmd::Command;
use predicates::prelude::*;

/// CLIヘルプが正しく表示されることを確認
#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("ship").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("node-id"))
        .stdout(predicate::str::contains("version"));
}

/// バージョン表示が正しく動作することを確認
#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("ship").unwrap();
    cmd.arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("shipyard"));
}

/// buildコマンドのヘルプが正しく表示されることを確認
#[test]
fn test_build_help() {
    let mut cmd = Command::cargo_bin("ship").unwrap();
    cmd.arg("build")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[DIR]"))
        .stdout(predicate::str::contains("--local-only"))
        .stdout(predicate::str::contains("--remote-only"))
        .stdout(predicate::str::contains("--build-arg"));
}

#[test]
fn test_builtins_listed() {
    let mut cmd = Command::cargo_bin("ship").unwrap();
    cmd.arg("builtins")
        .assert()
        .success()
        .stdout(predicate::str::contains("node"))
        .stdout(predicate::str::contains("deno"))
        .stdout(predicate::str::contains("static"));
}

/// buildには--appが必要
#[test]
fn test_build_requires_app() {
    let mut cmd = Command::cargo_bin("ship").unwrap();
    cmd.env_remove("SHIPYARD_APP")
        .arg("build")
        .assert()
        .failure();
}

#[test]
fn test_conflicting_builder_flags() {
    let config_dir = tempfile::tempdir().unwrap();
    let source = tempfile::tempdir().unwrap();

    let mut cmd = Command::cargo_bin("ship").unwrap();
    cmd.env("SHIPYARD_CONFIG_DIR", config_dir.path())
        .arg("build")
        .arg(source.path())
        .args(["--app", "myapp", "--local-only", "--remote-only"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("local-only"));
}

/// 不正なコマンドでエラーになることを確認
#[test]
fn test_invalid_command() {
    let mut cmd = Command::cargo_bin("ship").unwrap();
    cmd.arg("invalid-command").assert().failure();
}

#[test]
fn test_node_id_is_stable() {
    let config_dir = tempfile::tempdir().unwrap();

    let first = Command::cargo_bin("ship")
        .unwrap()
        .env("SHIPYARD_CONFIG_DIR", config_dir.path())
        .arg("node-id")
        .output()
        .unwrap();
    assert!(first.status.success());

    let second = Command::cargo_bin("ship")
        .unwrap()
        .env("SHIPYARD_CONFIG_DIR", config_dir.path())
        .arg("node-id")
        .output()
        .unwrap();

    let id = String::from_utf8_lossy(&first.stdout).trim().to_string();
    assert_eq!(id.len(), 64);
    assert_eq!(id, String::from_utf8_lossy(&second.stdout).trim());
}
