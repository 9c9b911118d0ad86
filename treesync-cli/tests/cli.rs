use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn treesync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("treesync"));
    cmd.env("HOME", home).env("USERPROFILE", home);
    cmd
}

#[test]
fn client_exits_1_when_directory_is_missing() {
    let home = TempDir::new().expect("home");
    treesync_cmd(home.path())
        .args(["client", "does-not-exist"])
        .current_dir(home.path())
        .assert()
        .code(1)
        .stderr(contains("Client: Directory does not exist"));
}

#[test]
fn client_rejects_zero_chunk_size() {
    let home = TempDir::new().expect("home");
    let dir = home.path().join("tree");
    fs::create_dir_all(&dir).expect("mkdir");
    treesync_cmd(home.path())
        .arg("client")
        .arg(&dir)
        .args(["--chunk-size", "0"])
        .assert()
        .failure()
        .stderr(contains("chunk_size"));
}

#[test]
fn server_reports_malformed_config() {
    let home = TempDir::new().expect("home");
    let config = home.path().join("bad.yaml");
    fs::write(&config, "chunk_size: [not a number\n").expect("write");
    treesync_cmd(home.path())
        .arg("server")
        .arg(home.path().join("Storage"))
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(contains("failed to load config"));
}

#[test]
fn help_lists_both_subcommands() {
    let home = TempDir::new().expect("home");
    treesync_cmd(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("client"))
        .stdout(contains("server"));
}
