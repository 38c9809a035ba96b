//! Services controlled through systemd.
//!
//! Each job manages exactly one unit and defers almost everything to
//! `systemctl`. Recognised keys: `unit` (defaults to the job name),
//! `logfiles` (comma-separated; the journal is used when empty),
//! `configfile`, plus `systemctl` / `journalctl` to override the binaries.
use std::path::PathBuf;

use tracing::{info, warn};

use super::{Job, JobBase};
use crate::{
    config::JobConfig,
    error::JobError,
    logs::{DEFAULT_LOG_LINES, LogBundle, extract_loglines},
    status::Status,
    transfer::ConfigFile,
};

/// Number of journal lines fetched when no log files are configured.
const JOURNAL_LINES: usize = 1000;

pub struct SystemdJob {
    base: JobBase,
    unit: String,
    log_files: Vec<String>,
    config_file: ConfigFile,
    systemctl: String,
    journalctl: String,
}

impl SystemdJob {
    pub fn new(name: &str, config: &JobConfig) -> Result<Self, JobError> {
        Ok(Self {
            base: JobBase::new(name, config)?,
            unit: config.get_or("unit", name).to_string(),
            log_files: config.list("logfiles"),
            config_file: ConfigFile::new(config.get("configfile").map(PathBuf::from)),
            systemctl: config.get_or("systemctl", "systemctl").to_string(),
            journalctl: config.get_or("journalctl", "journalctl").to_string(),
        })
    }

    fn ensure_known(&self, service: &str) -> Result<(), JobError> {
        if service == self.unit {
            Ok(())
        } else {
            Err(JobError::UnknownService(service.to_string()))
        }
    }

    fn systemctl(&self, verb: &str) -> String {
        format!(
            "{} {} {}",
            self.systemctl,
            verb,
            shell_words::quote(&self.unit)
        )
    }

    fn journal_lines(&self) -> Result<LogBundle, JobError> {
        let command = format!(
            "{} -n {} -u {} --no-pager",
            self.journalctl,
            JOURNAL_LINES,
            shell_words::quote(&self.unit)
        );
        let lines: String = self
            .base
            .sync_call(&command)?
            .stdout()
            .into_iter()
            .map(|line| format!("journal:{line}\n"))
            .collect();

        let mut bundle = LogBundle::new();
        bundle.insert("journal".to_string(), lines);
        Ok(bundle)
    }
}

/// Maps `systemctl is-active` output to a status.
pub fn parse_is_active(output: &[String]) -> Status {
    match output.first().map(|line| line.trim()) {
        Some("active") | Some("reloading") => Status::Running,
        Some("activating") => Status::Starting,
        Some("deactivating") => Status::Stopping,
        _ => Status::Dead,
    }
}

impl Job for SystemdJob {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn check(&self) -> bool {
        match self.base.sync_call(&self.systemctl("is-enabled")) {
            Ok(process) => {
                if process.stdout().is_empty() && !process.stderr().is_empty() {
                    warn!("unit file for {} does not exist", self.unit);
                    return false;
                }
                true
            }
            Err(err) => {
                warn!("cannot query systemd for {}: {}", self.unit, err);
                false
            }
        }
    }

    fn get_services(&self) -> Result<Vec<String>, JobError> {
        Ok(vec![self.unit.clone()])
    }

    fn start_service(&self, service: &str) -> Result<(), JobError> {
        self.ensure_known(service)?;
        info!("starting unit {}", self.unit);
        self.base.async_start(service, &self.systemctl("start"))
    }

    fn stop_service(&self, service: &str) -> Result<(), JobError> {
        self.ensure_known(service)?;
        info!("stopping unit {}", self.unit);
        self.base.async_stop(service, &self.systemctl("stop"))
    }

    fn restart_service(&self, service: &str) -> Result<(), JobError> {
        self.ensure_known(service)?;
        info!("restarting unit {}", self.unit);
        self.base.async_start(service, &self.systemctl("restart"))
    }

    fn service_status(&self, service: &str) -> Result<Status, JobError> {
        self.ensure_known(service)?;
        self.base.async_status(service, || {
            let process = self.base.sync_call(&self.systemctl("is-active"))?;
            Ok(parse_is_active(&process.stdout()))
        })
    }

    fn service_logs(&self, service: &str) -> Result<LogBundle, JobError> {
        self.ensure_known(service)?;
        if self.log_files.is_empty() {
            return self.journal_lines();
        }

        let mut bundle = LogBundle::new();
        for log_file in &self.log_files {
            bundle.extend(extract_loglines(log_file, DEFAULT_LOG_LINES)?);
        }
        Ok(bundle)
    }

    fn receive_config(&self, service: &str) -> Result<Vec<String>, JobError> {
        self.ensure_known(service)?;
        self.config_file.receive()
    }

    fn send_config(&self, service: &str, data: &[String]) -> Result<(), JobError> {
        self.ensure_known(service)?;
        self.config_file.send(data)
    }
}
