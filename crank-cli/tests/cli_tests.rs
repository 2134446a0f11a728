use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn crank_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("crank"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove("RUST_LOG");
    cmd
}

fn write_config(home: &TempDir, yaml: &str) -> PathBuf {
    let path = home.path().join(".crank").join("crank.yaml");
    fs::create_dir_all(path.parent().expect("parent")).expect("create config dir");
    fs::write(&path, yaml).expect("write config");
    path
}

#[test]
fn start_without_config_writes_example_and_fails() {
    let home = TempDir::new().expect("home");

    crank_cmd(home.path())
        .arg("start")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("wrote an example"));

    let written = home.path().join(".crank").join("crank.yaml");
    assert!(written.exists(), "example config should be written");
    let contents = fs::read_to_string(&written).expect("read example");
    assert!(contents.contains("NSWorkspaceDidWakeNotification"));

    // The example is valid as written.
    crank_cmd(home.path())
        .arg("check")
        .assert()
        .success()
        .stdout(contains("State:/Network/Global/IPv4"));
}

#[test]
fn check_lists_subscriptions() {
    let home = TempDir::new().expect("home");
    write_config(
        &home,
        r#"
dynamic_store:
  "regexp:State:/Network/Interface/[^/]+/Link":
    command: echo link
workspace:
  NSWorkspaceDidWakeNotification:
    function: crank.log
distributed:
  com.apple.iTunes.playerInfo:
    process: iTunes
"#,
    );

    crank_cmd(home.path())
        .arg("check")
        .assert()
        .success()
        .stdout(contains("is valid"))
        .stdout(contains("function: crank.log"))
        .stdout(contains("process: iTunes"))
        .stdout(contains("NSWorkspaceDidLaunchApplicationNotification"));
}

#[test]
fn check_json_is_machine_readable() {
    let home = TempDir::new().expect("home");
    let config = write_config(
        &home,
        "net_service:\n  _ssh._tcp.:\n    command: echo ssh\n",
    );

    let output = crank_cmd(home.path())
        .args(["--config", config.to_str().expect("utf8 path"), "check", "--json"])
        .output()
        .expect("run check");
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(value[0]["source"], "net_service");
    assert_eq!(value[0]["key"], "_ssh._tcp.");
}

#[test]
fn check_rejects_handler_with_two_modes() {
    let home = TempDir::new().expect("home");
    write_config(
        &home,
        "workspace:\n  NSWorkspaceDidWakeNotification:\n    command: echo hi\n    function: crank.log\n",
    );

    crank_cmd(home.path())
        .arg("check")
        .assert()
        .failure()
        .stderr(contains("invalid configuration"))
        .stderr(contains("more than one of command, function"));
}

#[test]
fn check_rejects_class_in_dynamic_store() {
    let home = TempDir::new().expect("home");
    write_config(
        &home,
        "dynamic_store:\n  State:/Network/Global/IPv4:\n    class: crank.Tally\n",
    );

    crank_cmd(home.path())
        .arg("check")
        .assert()
        .failure()
        .stderr(contains("class handlers are only supported"));
}

#[test]
fn check_rejects_missing_watch_path() {
    let home = TempDir::new().expect("home");
    let missing = home.path().join("does-not-exist");
    write_config(
        &home,
        &format!("fs_events:\n  {}:\n    command: echo changed\n", missing.display()),
    );

    crank_cmd(home.path())
        .arg("check")
        .assert()
        .failure()
        .stderr(contains("path does not exist"));
}

#[test]
fn list_events_shows_sources_and_workspace_names() {
    let home = TempDir::new().expect("home");
    crank_cmd(home.path())
        .arg("list-events")
        .assert()
        .success()
        .stdout(contains("dynamic_store (regexp: keys)"))
        .stdout(contains("fs_events"))
        .stdout(contains("NSWorkspaceWillPowerOffNotification"));
}

#[test]
fn status_and_stop_without_daemon() {
    let home = TempDir::new().expect("home");

    crank_cmd(home.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));

    crank_cmd(home.path())
        .arg("stop")
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
}

#[test]
fn post_rejects_unknown_source() {
    let home = TempDir::new().expect("home");
    crank_cmd(home.path())
        .args(["post", "bluetooth", "anything"])
        .assert()
        .failure()
        .stderr(contains("unknown source 'bluetooth'").and(contains("dynamic_store")));
}
