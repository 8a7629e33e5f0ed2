//! CLI integration tests
//!
//! Tests the podvisor CLI using assert_cmd. None of these reach a cluster.

use assert_cmd::Command;
use predicates::prelude::*;

fn podvisor() -> Command {
    let mut cmd = Command::cargo_bin("podvisor")
        .expect("Failed to locate podvisor binary - ensure it's built before running tests");
    for var in [
        "PV_HOSTS",
        "PV_RC",
        "PV_COMMAND",
        "PV_HOST",
        "PV_USER",
        "PV_PRIVATEKEY",
        "PV_PASSWORD",
        "PV_CONFIG",
        "PV_NAMESPACE",
        "PV_BASH",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_cli_help() {
    podvisor()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("podvisor"))
        .stdout(predicate::str::contains("inventory hosts"));
}

#[test]
fn test_cli_version_flag() {
    podvisor()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("podvisor"));
}

#[test]
fn test_cli_version_command() {
    podvisor()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "podvisor {}",
            env!("CARGO_PKG_VERSION")
        )));
}

#[test]
fn test_cli_pod_help() {
    podvisor()
        .args(["pod", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--rc"))
        .stdout(predicate::str::contains("PV_HOSTS"));
}

#[test]
fn test_cli_rc_help() {
    podvisor()
        .args(["rc", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--replicas"))
        .stdout(predicate::str::contains("--inventory"));
}

#[test]
fn test_cli_pod_requires_rc() {
    podvisor()
        .args(["pod", "appservers"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--rc"));
}

#[test]
fn test_cli_kill_requires_rc() {
    podvisor()
        .arg("kill")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--rc"));
}

#[test]
fn test_cli_unknown_command() {
    podvisor()
        .arg("nonexistent-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_cli_run_requires_host() {
    podvisor()
        .args(["run", "uptime"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Host is required"));
}

#[test]
fn test_cli_run_winrm_requires_password() {
    podvisor()
        .args([
            "run",
            "--host",
            "10.0.0.5",
            "--user",
            "Administrator",
            "--connection",
            "winrm",
            "ipconfig",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Password is required"));
}

#[test]
fn test_cli_rc_missing_group() {
    let dir = tempfile::tempdir().unwrap();
    let inventory = dir.path().join("inventory");
    std::fs::write(&inventory, "[appservers]\napp1 ansible_user=deploy\n\n[db]\ndb1\n").unwrap();

    podvisor()
        .args(["rc", "webservers", "--inventory"])
        .arg(&inventory)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("webservers"))
        .stderr(predicate::str::contains("appservers, db"));
}

#[test]
fn test_cli_rc_missing_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let inventory = dir.path().join("inventory");
    std::fs::write(&inventory, "[appservers]\napp1 ansible_user=deploy\n").unwrap();

    podvisor()
        .args(["rc", "appservers", "--inventory"])
        .arg(&inventory)
        .arg("--playbook-dir")
        .arg(dir.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("rc.yml"));
}

#[test]
fn test_cli_run_rejects_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    podvisor()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .args(["run", "--host", "h", "--user", "u", "--privatekey", "/k", "true"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("absent.toml"));
}
