// tests/cli_tests.rs

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

fn keypool(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("keypool-proxy").unwrap();
    cmd.env("KEY_POOL_FILE", dir.join("key_pool.json"))
        .env("CONFIG_PATH", dir.join("config.yaml"))
        .env("RUST_LOG", "error")
        .env_remove("ADMIN_KEY")
        .env_remove("KEY_POOL_ALGORITHM");
    cmd
}

#[test]
fn test_config_check_redacts_admin_token() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("config.yaml"),
        "server:\n  port: 8123\n  admin_token: super-secret-token\n",
    )
    .unwrap();

    keypool(dir.path())
        .args(["config", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("port: 8123"))
        .stdout(predicate::str::contains("super-secret-token").not());
}

#[test]
fn test_config_check_fails_on_invalid_config() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("config.yaml"), "server:\n  port: 0\n").unwrap();

    keypool(dir.path())
        .args(["config", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration is invalid"));
}

#[test]
fn test_import_then_list_keys() {
    let dir = TempDir::new().unwrap();
    let import = dir.path().join("keys.txt");
    std::fs::write(&import, "fk-cli-one\nsk-ant-cli-two\nfk-cli-one\ngarbage\n").unwrap();

    let output = keypool(dir.path())
        .args(["keys", "import"])
        .arg(&import)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let summary: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(summary["success"], 2);
    assert_eq!(summary["duplicate"], 1);
    assert_eq!(summary["invalid"], 1);

    let output = keypool(dir.path())
        .args(["keys", "list", "--status", "active"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let keys: Value = serde_json::from_slice(&output).unwrap();
    let keys = keys.as_array().unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[1]["provider"], "anthropic");

    keypool(dir.path())
        .args(["keys", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"total\": 2"));
}

#[test]
fn test_unknown_status_filter_fails() {
    let dir = TempDir::new().unwrap();
    keypool(dir.path())
        .args(["keys", "list", "--status", "frozen"])
        .assert()
        .failure();
}
