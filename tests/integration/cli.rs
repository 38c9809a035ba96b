#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    path::{Path, PathBuf},
};

use assert_cmd::Command;
use common::write_script;
use predicates::prelude::*;
use tempfile::tempdir;

/// Writes a config with one init-script job and returns its path.
fn setup(dir: &Path) -> PathBuf {
    let state = dir.join("state");
    fs::create_dir_all(&state).expect("failed to create state dir");
    let script = write_script(
        dir,
        "nicos-system",
        &format!(
            r#"state="{state}"
case "$1" in
  start) sleep 1; echo starting; touch "$state/${{2:-all}}" ;;
  stop) rm -f "$state/${{2:-all}}" ;;
  status) [ -e "$state/${{2:-all}}" ] && echo "cache: running" || echo "cache: dead"
          [ -z "$2" ] || [ -e "$state/$2" ] ;;
  *) echo "Possible services are: cache" ;;
esac"#,
            state = state.display()
        ),
    );

    let config_path = dir.join("marche.yaml");
    fs::write(
        &config_path,
        format!(
            r#"daemon:
  loglevel: warn
jobs:
  nicos:
    type: initscript
    script: {}
"#,
            script.display()
        ),
    )
    .expect("failed to write config");
    config_path
}

fn marched(config: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("marched"));
    cmd.arg("--config").arg(config);
    cmd
}

#[test]
fn list_prints_discovered_services() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = setup(temp.path());

    marched(&config)
        .arg("list")
        .assert()
        .success()
        .stdout("nicos-system\nnicos.cache\n");
}

#[test]
fn start_reports_final_status() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = setup(temp.path());

    marched(&config)
        .args(["start", "nicos.cache"])
        .assert()
        .success()
        .stdout("nicos.cache: RUNNING\n");

    marched(&config)
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"nicos.cache\": \"RUNNING\""))
        .stdout(predicate::str::contains("\"nicos-system\": \"DEAD\""));
}

#[test]
fn slow_start_completes_before_exit() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = setup(temp.path());

    marched(&config)
        .args(["start", "nicos-system"])
        .assert()
        .success()
        .stdout("nicos-system: RUNNING\n");

    assert!(temp.path().join("state/all").exists());
}

#[test]
fn unknown_service_fails() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = setup(temp.path());

    marched(&config)
        .args(["stop", "nicos.ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nicos.ghost"));
}

#[test]
fn missing_config_is_reported() {
    let temp = tempdir().expect("failed to create tempdir");

    marched(&temp.path().join("absent.yaml"))
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("absent.yaml"));
}
