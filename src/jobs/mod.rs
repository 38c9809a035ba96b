//! The job interface implemented by every backend, plus the call patterns
//! they share.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::debug;

use crate::{
    config::{JobConfig, JobKind},
    error::JobError,
    logs::LogBundle,
    runner::{AsyncProcess, RunOptions},
    status::Status,
};

pub mod graph;
pub mod initscript;
pub mod systemd;
pub mod taco;

pub use initscript::InitScriptJob;
pub use systemd::SystemdJob;
pub use taco::TacoJob;

/// Lifecycle control for one class of underlying mechanism.
///
/// Start, stop and restart return as soon as the command is launched and
/// fail with [`JobError::Busy`] while an earlier operation on the same
/// service is still running.
pub trait Job: Send + Sync {
    /// Name of the config section this job was built from.
    fn name(&self) -> &str;

    /// Self-test run once at registration; failing jobs are not activated.
    fn check(&self) -> bool;

    /// Services currently managed by this job, in listing order.
    fn get_services(&self) -> Result<Vec<String>, JobError>;

    fn start_service(&self, service: &str) -> Result<(), JobError>;

    fn stop_service(&self, service: &str) -> Result<(), JobError>;

    fn restart_service(&self, service: &str) -> Result<(), JobError>;

    fn service_status(&self, service: &str) -> Result<Status, JobError>;

    fn service_logs(&self, _service: &str) -> Result<LogBundle, JobError> {
        Ok(LogBundle::new())
    }

    /// Returns `[file name, contents]`, or nothing if unsupported.
    fn receive_config(&self, _service: &str) -> Result<Vec<String>, JobError> {
        Ok(Vec::new())
    }

    fn send_config(&self, service: &str, _data: &[String]) -> Result<(), JobError> {
        Err(JobError::InvalidRequest(format!(
            "service '{service}' does not accept configuration"
        )))
    }

    /// Services whose lifecycle is coupled to `service`.
    fn dependencies(&self, _service: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Instantiates the backend selected by `config.kind`.
pub fn build_job(name: &str, config: &JobConfig) -> Result<Arc<dyn Job>, JobError> {
    let job: Arc<dyn Job> = match config.kind {
        JobKind::Systemd => Arc::new(SystemdJob::new(name, config)?),
        JobKind::Initscript => Arc::new(InitScriptJob::new(name, config)?),
        JobKind::Taco => Arc::new(TacoJob::new(name, config)?),
    };
    Ok(job)
}

/// State and helpers shared by all backends: command options and the
/// per-service table of background operations.
#[derive(Debug)]
pub struct JobBase {
    name: String,
    options: RunOptions,
    operations: Mutex<HashMap<String, Arc<AsyncProcess>>>,
}

impl JobBase {
    pub fn new(name: &str, config: &JobConfig) -> Result<Self, JobError> {
        Ok(Self {
            name: name.to_string(),
            options: RunOptions {
                shell: true,
                timeout: config.timeout()?,
            },
            operations: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `command` to completion on the calling thread. Reserved for
    /// quick probes.
    pub fn sync_call(&self, command: &str) -> Result<Arc<AsyncProcess>, JobError> {
        AsyncProcess::run(command, self.options)
    }

    /// Starts `command` in the background without tracking it.
    pub fn async_call(
        &self,
        status: Status,
        command: &str,
    ) -> Result<Arc<AsyncProcess>, JobError> {
        AsyncProcess::start(Some(status), command, self.options)
    }

    /// Launches `command` as the live operation of `service`.
    ///
    /// Rejected with `Busy` while the previous operation is unfinished; a
    /// finished one is replaced.
    pub fn launch(&self, service: &str, status: Status, command: &str) -> Result<(), JobError> {
        let mut operations = self.operations.lock()?;
        if let Some(live) = operations.get(service).filter(|op| !op.is_done()) {
            debug!(
                "[{}] rejecting `{}`: {} is busy with `{}`",
                self.name,
                command,
                service,
                live.command()
            );
            return Err(JobError::Busy {
                service: service.to_string(),
            });
        }

        let process = self.async_call(status, command)?;
        operations.insert(service.to_string(), process);
        Ok(())
    }

    pub fn async_start(&self, service: &str, command: &str) -> Result<(), JobError> {
        self.launch(service, Status::Starting, command)
    }

    pub fn async_stop(&self, service: &str, command: &str) -> Result<(), JobError> {
        self.launch(service, Status::Stopping, command)
    }

    /// The most recent operation for `service`, finished or not.
    pub fn operation(&self, service: &str) -> Result<Option<Arc<AsyncProcess>>, JobError> {
        Ok(self.operations.lock()?.get(service).cloned())
    }

    /// Provisional status of the live operation, if one is running.
    pub fn async_status_only(&self, service: &str) -> Result<Option<Status>, JobError> {
        Ok(self
            .operation(service)?
            .filter(|op| !op.is_done())
            .and_then(|op| op.status()))
    }

    /// Live operation status, otherwise `probe` run against the system.
    pub fn async_status<F>(&self, service: &str, probe: F) -> Result<Status, JobError>
    where
        F: FnOnce() -> Result<Status, JobError>,
    {
        match self.async_status_only(service)? {
            Some(status) => Ok(status),
            None => probe(),
        }
    }

    /// Runs a status command and maps exit code 0 to `Running`.
    pub fn exit_code_status(&self, command: &str) -> Result<Status, JobError> {
        let process = self.sync_call(command)?;
        Ok(if process.succeeded() {
            Status::Running
        } else {
            Status::Dead
        })
    }
}
