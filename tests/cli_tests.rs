//! CLI smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn argus() -> Command {
    Command::cargo_bin("argus").expect("binary builds")
}

#[test]
fn help_lists_subcommands() {
    argus()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("audit"))
        .stdout(predicate::str::contains("key"));
}

#[test]
fn check_validates_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("argus.toml");
    std::fs::write(
        &config,
        r#"
[[repos]]
platform = "github"
owner = "demo"
name = "app"
"#,
    )
    .unwrap();

    argus()
        .arg("--config")
        .arg(&config)
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 repo(s)"));
}

#[test]
fn check_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("argus.toml");
    std::fs::write(&config, "default_poll_interval_minutes = 0\n").unwrap();

    argus()
        .arg("--config")
        .arg(&config)
        .arg("check")
        .assert()
        .failure();
}

#[test]
fn audit_verify_on_fresh_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("argus.db");

    argus()
        .arg("--store")
        .arg(&store)
        .args(["audit", "verify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 entries verified"));
}

#[test]
fn key_show_prints_stable_instance_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("argus.db");

    let first = argus()
        .arg("--store")
        .arg(&store)
        .args(["key", "show"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let second = argus()
        .arg("--store")
        .arg(&store)
        .args(["key", "show"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(first, second, "instance id survives restarts");

    let text = String::from_utf8(first).unwrap();
    let id = text
        .lines()
        .find_map(|l| l.strip_prefix("instance: "))
        .expect("instance line");
    assert_eq!(id.trim().len(), 16);
}

#[test]
fn key_rotate_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("argus.db");

    argus()
        .arg("--store")
        .arg(&store)
        .args(["key", "rotate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("key rotated"));
}
