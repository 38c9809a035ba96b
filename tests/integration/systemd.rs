#[path = "common/mod.rs"]
mod common;

use std::{fs, path::Path};

use common::{wait_until, write_script};
use marche::{
    config::{JobConfig, JobKind},
    error::JobError,
    jobs::{Job, SystemdJob},
    status::Status,
};
use tempfile::tempdir;

/// Fake `systemctl` keeping the unit state in a file next to it.
fn fake_systemctl(dir: &Path, start_delay: &str) -> String {
    let state = dir.join("state");
    let body = format!(
        r#"state="{state}"
case "$1" in
  is-enabled) echo enabled ;;
  is-active) cat "$state" 2>/dev/null || echo inactive ;;
  start|restart) sleep {start_delay}; echo active > "$state" ;;
  stop) echo inactive > "$state" ;;
esac"#,
        state = state.display(),
    );
    let script = write_script(dir, "systemctl", &body);
    format!("sh {}", script.display())
}

fn dhcpd(dir: &Path, start_delay: &str) -> SystemdJob {
    let config = JobConfig::new(JobKind::Systemd)
        .with("unit", "dhcpd")
        .with("systemctl", fake_systemctl(dir, start_delay));
    SystemdJob::new("dhcp", &config).expect("failed to build job")
}

#[test]
fn start_reports_starting_until_systemctl_returns() {
    let temp = tempdir().expect("failed to create tempdir");
    let job = dhcpd(temp.path(), "0.5");
    assert!(job.check());
    assert_eq!(job.get_services().unwrap(), vec!["dhcpd"]);
    assert_eq!(job.service_status("dhcpd").unwrap(), Status::Dead);

    job.start_service("dhcpd").unwrap();
    assert_eq!(job.service_status("dhcpd").unwrap(), Status::Starting);

    wait_until("dhcpd to run", || {
        job.service_status("dhcpd").unwrap() == Status::Running
    });

    job.stop_service("dhcpd").unwrap();
    wait_until("dhcpd to stop", || {
        job.service_status("dhcpd").unwrap() == Status::Dead
    });
}

#[test]
fn overlapping_request_is_rejected_as_busy() {
    let temp = tempdir().expect("failed to create tempdir");
    let job = dhcpd(temp.path(), "0.5");

    job.start_service("dhcpd").unwrap();
    let err = job.stop_service("dhcpd").unwrap_err();
    assert!(matches!(err, JobError::Busy { .. }));
    assert_eq!(job.service_status("dhcpd").unwrap(), Status::Starting);

    wait_until("start to finish", || {
        job.service_status("dhcpd").unwrap() == Status::Running
    });
    job.restart_service("dhcpd").unwrap();
    assert_eq!(job.service_status("dhcpd").unwrap(), Status::Starting);
}

#[test]
fn missing_unit_fails_self_test() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = write_script(
        temp.path(),
        "systemctl",
        "echo 'Failed to get unit file state for nope.service' >&2; exit 1",
    );
    let config = JobConfig::new(JobKind::Systemd)
        .with("unit", "nope")
        .with("systemctl", format!("sh {}", script.display()));
    let job = SystemdJob::new("nope", &config).unwrap();
    assert!(!job.check());
}

#[test]
fn config_file_round_trip_preserves_latin1_bytes() {
    let temp = tempdir().expect("failed to create tempdir");
    let conf = temp.path().join("dhcpd.conf");
    fs::write(&conf, b"option domain-name \"caf\xe9\";\n").unwrap();

    let config = JobConfig::new(JobKind::Systemd)
        .with("unit", "dhcpd")
        .with("configfile", conf.display().to_string());
    let job = SystemdJob::new("dhcp", &config).unwrap();

    let received = job.receive_config("dhcpd").unwrap();
    assert_eq!(received[0], "dhcpd.conf");
    assert_eq!(received[1], "option domain-name \"caf\u{e9}\";\n");

    let wrong_name = vec!["other.conf".to_string(), "x".to_string()];
    assert!(matches!(
        job.send_config("dhcpd", &wrong_name),
        Err(JobError::InvalidRequest(_))
    ));
    assert!(matches!(
        job.send_config("dhcpd", &["dhcpd.conf".to_string()]),
        Err(JobError::InvalidRequest(_))
    ));

    let update = vec!["dhcpd.conf".to_string(), "ddns-update-style n\u{f6}ne;\n".to_string()];
    job.send_config("dhcpd", &update).unwrap();
    assert_eq!(fs::read(&conf).unwrap(), b"ddns-update-style n\xf6ne;\n");
}

#[test]
fn log_files_include_rotated_siblings() {
    let temp = tempdir().expect("failed to create tempdir");
    let log = temp.path().join("dhcpd.log");
    fs::write(&log, "current\n").unwrap();
    fs::write(temp.path().join("dhcpd.log.1"), "older\n").unwrap();
    fs::write(temp.path().join("dhcpd.log.2"), "oldest\n").unwrap();
    fs::write(temp.path().join("dhcpd.log.4"), "orphan\n").unwrap();

    let config = JobConfig::new(JobKind::Systemd)
        .with("unit", "dhcpd")
        .with("logfiles", log.display().to_string());
    let job = SystemdJob::new("dhcp", &config).unwrap();

    let bundle = job.service_logs("dhcpd").unwrap();
    assert_eq!(bundle.len(), 3);
    let base = fs::canonicalize(&log).unwrap().display().to_string();
    assert_eq!(bundle[&base], "current\n");
    assert_eq!(bundle[&format!("{base}.2")], "oldest\n");
}

#[test]
fn journal_is_used_without_log_files() {
    let temp = tempdir().expect("failed to create tempdir");
    let journal = write_script(
        temp.path(),
        "journalctl",
        "echo \"args: $*\"; echo 'dhcpd started'",
    );
    let config = JobConfig::new(JobKind::Systemd)
        .with("unit", "dhcpd")
        .with("journalctl", format!("sh {}", journal.display()));
    let job = SystemdJob::new("dhcp", &config).unwrap();

    let bundle = job.service_logs("dhcpd").unwrap();
    assert_eq!(
        bundle["journal"],
        "journal:args: -n 1000 -u dhcpd --no-pager\njournal:dhcpd started\n"
    );
}

#[test]
fn requests_for_other_names_are_unknown() {
    let temp = tempdir().expect("failed to create tempdir");
    let job = dhcpd(temp.path(), "0");
    assert!(matches!(
        job.service_status("named"),
        Err(JobError::UnknownService(name)) if name == "named"
    ));
}
