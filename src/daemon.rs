//! Registry of active jobs and dispatch of requests to them.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    error::JobError,
    jobs::{Job, build_job},
    logs::LogBundle,
    status::Status,
};

/// Service listing and the owner of every listed name.
#[derive(Default)]
struct ServiceIndex {
    order: Vec<String>,
    owners: HashMap<String, Arc<dyn Job>>,
}

/// Owns the active jobs and routes service requests to them.
pub struct Daemon {
    /// Jobs that passed their self-test, in configuration order.
    jobs: Vec<Arc<dyn Job>>,
    /// Rebuilt on each refresh; readers always see a complete index.
    index: RwLock<Arc<ServiceIndex>>,
}

impl Daemon {
    /// Activates the jobs that pass their self-test.
    pub fn new(candidates: Vec<Arc<dyn Job>>) -> Self {
        debug!("Initializing daemon...");

        let jobs = candidates
            .into_iter()
            .filter(|job| {
                let ok = job.check();
                if ok {
                    info!("job '{}' activated", job.name());
                } else {
                    warn!("job '{}' failed its self-test; not activating", job.name());
                }
                ok
            })
            .collect();

        Self {
            jobs,
            index: RwLock::new(Arc::new(ServiceIndex::default())),
        }
    }

    /// Builds every configured job, then activates those passing `check`.
    pub fn from_config(config: &Config) -> Result<Self, JobError> {
        let mut candidates = Vec::with_capacity(config.jobs.len());
        for (name, job_config) in &config.jobs {
            candidates.push(build_job(name, job_config)?);
        }
        Ok(Self::new(candidates))
    }

    pub fn jobs(&self) -> &[Arc<dyn Job>] {
        &self.jobs
    }

    /// Re-runs discovery on every job and swaps in the new service index.
    pub fn refresh(&self) -> Result<Vec<String>, JobError> {
        let mut index = ServiceIndex::default();

        for job in &self.jobs {
            let services = match job.get_services() {
                Ok(services) => services,
                Err(err) => {
                    error!("discovery for job '{}' failed: {}", job.name(), err);
                    continue;
                }
            };

            for service in services {
                if let Some(owner) = index.owners.get(&service) {
                    warn!(
                        "service '{}' from job '{}' already provided by '{}'; ignoring",
                        service,
                        job.name(),
                        owner.name()
                    );
                    continue;
                }
                index.order.push(service.clone());
                index.owners.insert(service, Arc::clone(job));
            }
        }

        let order = index.order.clone();
        *self.index.write()? = Arc::new(index);
        Ok(order)
    }

    /// Services found by the last refresh.
    pub fn services(&self) -> Result<Vec<String>, JobError> {
        Ok(self.index.read()?.order.clone())
    }

    fn job_for(&self, service: &str) -> Result<Arc<dyn Job>, JobError> {
        self.index
            .read()?
            .owners
            .get(service)
            .cloned()
            .ok_or_else(|| JobError::UnknownService(service.to_string()))
    }

    pub fn start_service(&self, service: &str) -> Result<(), JobError> {
        self.job_for(service)?.start_service(service)
    }

    pub fn stop_service(&self, service: &str) -> Result<(), JobError> {
        self.job_for(service)?.stop_service(service)
    }

    pub fn restart_service(&self, service: &str) -> Result<(), JobError> {
        self.job_for(service)?.restart_service(service)
    }

    pub fn service_status(&self, service: &str) -> Result<Status, JobError> {
        self.job_for(service)?.service_status(service)
    }

    pub fn service_logs(&self, service: &str) -> Result<LogBundle, JobError> {
        self.job_for(service)?.service_logs(service)
    }

    pub fn receive_config(&self, service: &str) -> Result<Vec<String>, JobError> {
        self.job_for(service)?.receive_config(service)
    }

    pub fn send_config(&self, service: &str, data: &[String]) -> Result<(), JobError> {
        self.job_for(service)?.send_config(service, data)
    }

    pub fn dependencies(&self, service: &str) -> Result<Vec<String>, JobError> {
        Ok(self.job_for(service)?.dependencies(service))
    }

    /// Polls every listed service. Failed probes are reported as `Dead`.
    pub fn statuses(&self) -> Result<Vec<(String, Status)>, JobError> {
        let statuses = self
            .services()?
            .into_iter()
            .map(|service| {
                let status = self.service_status(&service).unwrap_or_else(|err| {
                    error!("status of '{}' unavailable: {}", service, err);
                    Status::Dead
                });
                (service, status)
            })
            .collect();
        Ok(statuses)
    }

    /// Aggregate status of a group of services.
    pub fn group_status(&self, members: &[String]) -> Result<Status, JobError> {
        let mut statuses = Vec::with_capacity(members.len());
        for member in members {
            statuses.push(self.service_status(member)?);
        }
        Ok(Status::aggregate(statuses))
    }
}
