#[path = "common/mod.rs"]
mod common;

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use common::{wait_until, write_script};
use marche::{
    error::JobError,
    runner::{AsyncProcess, RunOptions},
    status::Status,
};
use tempfile::tempdir;

#[test]
fn start_returns_while_command_runs() {
    let started = Instant::now();
    let process = AsyncProcess::start(
        Some(Status::Starting),
        "echo begin; sleep 0.5; echo end",
        RunOptions::default(),
    )
    .expect("failed to start");
    assert!(started.elapsed() < Duration::from_millis(400));
    assert!(!process.is_done());
    assert_eq!(process.status(), Some(Status::Starting));
    assert_eq!(process.retcode(), None);

    wait_until("first line", || process.stdout() == vec!["begin"]);
    assert!(!process.is_done());

    process.join();
    assert!(process.is_done());
    assert_eq!(process.stdout(), vec!["begin", "end"]);
    assert!(process.succeeded());
}

#[test]
fn exit_code_and_stderr_are_captured() {
    let process = AsyncProcess::run("echo oops >&2; exit 3", RunOptions::default())
        .expect("failed to run");
    assert_eq!(process.retcode(), Some(3));
    assert!(!process.succeeded());
    assert!(process.stdout().is_empty());
    assert_eq!(process.stderr(), vec!["oops"]);
}

#[test]
fn unlaunchable_command_is_an_error() {
    let options = RunOptions {
        shell: false,
        timeout: None,
    };
    let err = AsyncProcess::run("/nonexistent/marche-helper --flag", options).unwrap_err();
    match err {
        JobError::Spawn { command, .. } => {
            assert_eq!(command, "/nonexistent/marche-helper --flag")
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn watchdog_kills_overrunning_command() {
    let options = RunOptions {
        shell: true,
        timeout: Some(Duration::from_millis(300)),
    };
    let started = Instant::now();
    let process = AsyncProcess::run("echo before; sleep 10", options).expect("failed to run");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(process.timed_out());
    assert_eq!(process.retcode(), None);
    assert_eq!(process.stdout(), vec!["before"]);
}

#[test]
fn watchdog_kills_nested_commands_too() {
    let dir = tempdir().expect("failed to create tempdir");
    let marker = dir.path().join("marker");
    let inner = write_script(
        dir.path(),
        "inner",
        &format!("sleep 1; touch {}", marker.display()),
    );
    let options = RunOptions {
        shell: true,
        timeout: Some(Duration::from_millis(200)),
    };

    let process = AsyncProcess::run(format!("sh {}; echo after", inner.display()), options)
        .expect("failed to run");
    assert!(process.timed_out());
    assert!(process.stdout().is_empty());

    thread::sleep(Duration::from_millis(1500));
    assert!(!marker.exists(), "nested command outlived the watchdog");
}

#[test]
fn concurrent_observers_see_consistent_completion() {
    let dir = tempdir().expect("failed to create tempdir");
    let marker = dir.path().join("marker");
    let command = format!("sleep 0.2; touch {}", marker.display());
    let process = AsyncProcess::start(None, command, RunOptions::default()).expect("start");

    let observers: Vec<_> = (0..4)
        .map(|_| {
            let process = Arc::clone(&process);
            thread::spawn(move || {
                process.join();
                process.retcode()
            })
        })
        .collect();

    for observer in observers {
        assert_eq!(observer.join().expect("observer panicked"), Some(0));
    }
    assert!(marker.exists());
}
