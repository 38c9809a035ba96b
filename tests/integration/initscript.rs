#[path = "common/mod.rs"]
mod common;

use std::path::Path;

use common::{wait_until, write_script};
use marche::{
    config::{JobConfig, JobKind, parse_config},
    error::JobError,
    jobs::{InitScriptJob, Job, build_job},
    status::Status,
};
use tempfile::tempdir;

/// Fake multi-service init script; running sub-services are marker files.
fn fake_script(dir: &Path) -> String {
    let state = dir.join("state");
    std::fs::create_dir_all(&state).unwrap();
    let body = format!(
        r#"state="{state}"
case "$1" in
  start)
    if [ -n "$2" ]; then touch "$state/$2"; else sleep 0.3; touch "$state/cache" "$state/poller"; fi ;;
  stop)
    if [ -n "$2" ]; then rm -f "$state/$2"; else rm -f "$state"/*; fi ;;
  status)
    if [ -n "$2" ]; then
      [ -e "$state/$2" ]; exit $?
    fi
    for s in cache poller; do
      if [ -e "$state/$s" ]; then echo "$s: running"; else echo "$s: dead"; fi
    done ;;
  *)
    echo "Usage: nicos-system {{start|stop|restart|status}} [service]" >&2
    echo "Possible services are: cache, poller" >&2
    exit 1 ;;
esac"#,
        state = state.display(),
    );
    write_script(dir, "nicos-system", &body)
        .display()
        .to_string()
}

fn job(dir: &Path) -> InitScriptJob {
    let config = JobConfig::new(JobKind::Initscript).with("script", fake_script(dir));
    InitScriptJob::new("nicos", &config).expect("failed to build job")
}

#[test]
fn services_are_discovered_from_usage_output() {
    let temp = tempdir().expect("failed to create tempdir");
    let job = job(temp.path());
    assert!(job.check());
    assert_eq!(
        job.get_services().unwrap(),
        vec!["nicos-system", "nicos.cache", "nicos.poller"]
    );
}

#[test]
fn umbrella_status_reflects_sub_services() {
    let temp = tempdir().expect("failed to create tempdir");
    let job = job(temp.path());
    job.get_services().unwrap();

    assert_eq!(job.service_status("nicos-system").unwrap(), Status::Dead);
    assert_eq!(job.service_status("nicos.cache").unwrap(), Status::Dead);

    job.start_service("nicos.cache").unwrap();
    wait_until("cache to run", || {
        job.service_status("nicos.cache").unwrap() == Status::Running
    });
    assert_eq!(job.service_status("nicos.poller").unwrap(), Status::Dead);
    assert_eq!(job.service_status("nicos-system").unwrap(), Status::Warning);

    job.start_service("nicos-system").unwrap();
    assert_eq!(job.service_status("nicos-system").unwrap(), Status::Starting);
    assert!(matches!(
        job.stop_service("nicos-system"),
        Err(JobError::Busy { .. })
    ));
    wait_until("everything to run", || {
        job.service_status("nicos-system").unwrap() == Status::Running
    });

    job.stop_service("nicos.poller").unwrap();
    wait_until("poller to stop", || {
        job.service_status("nicos.poller").unwrap() == Status::Dead
    });
    assert_eq!(job.service_status("nicos-system").unwrap(), Status::Warning);
}

#[test]
fn operations_on_different_services_do_not_conflict() {
    let temp = tempdir().expect("failed to create tempdir");
    let job = job(temp.path());
    job.get_services().unwrap();

    job.start_service("nicos-system").unwrap();
    job.start_service("nicos.cache").unwrap();
    assert!(matches!(
        job.service_status("unrelated"),
        Err(JobError::UnknownService(_))
    ));
}

#[test]
fn only_discovered_sub_services_are_accepted() {
    let temp = tempdir().expect("failed to create tempdir");
    let job = job(temp.path());
    let injected = temp.path().join("injected");

    // Nothing is known before discovery.
    assert!(matches!(
        job.start_service("nicos.cache"),
        Err(JobError::UnknownService(_))
    ));

    job.get_services().unwrap();
    let crafted = format!("nicos.x;touch {}", injected.display());
    assert!(matches!(
        job.start_service(&crafted),
        Err(JobError::UnknownService(name)) if name == crafted
    ));
    assert!(matches!(
        job.service_status("nicos.watchdog"),
        Err(JobError::UnknownService(_))
    ));

    std::thread::sleep(std::time::Duration::from_millis(200));
    assert!(!injected.exists());
}

#[test]
fn missing_script_fails_self_test() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = JobConfig::new(JobKind::Initscript)
        .with("script", temp.path().join("absent").display().to_string());
    let job = InitScriptJob::new("nicos", &config).unwrap();
    assert!(!job.check());
}

#[test]
fn nicos_alias_selects_init_script_backend() {
    let temp = tempdir().expect("failed to create tempdir");
    let script = fake_script(temp.path());
    let config = parse_config(&format!(
        "jobs:\n  instrument:\n    type: nicos\n    script: {script}\n    umbrella: nicos-all\n"
    ))
    .unwrap();

    let job = build_job("instrument", &config.jobs["instrument"]).unwrap();
    assert_eq!(job.name(), "instrument");
    assert_eq!(
        job.get_services().unwrap(),
        vec!["nicos-all", "nicos.cache", "nicos.poller"]
    );
}
