//! Services driven by a legacy init script that may host several
//! sub-services.
//!
//! The umbrella service controls everything the script manages; each
//! sub-service announced by the script is exposed as `<prefix>.<name>`.
use std::{path::PathBuf, sync::RwLock};

use tracing::{error, info};

use super::{Job, JobBase};
use crate::{config::JobConfig, error::JobError, status::Status};

const DEFAULT_SCRIPT: &str = "/etc/init.d/nicos-system";
const DEFAULT_PREFIX: &str = "nicos";
const SERVICES_MARKER: &str = "Possible services are";

pub struct InitScriptJob {
    base: JobBase,
    script: PathBuf,
    prefix: String,
    umbrella: String,
    services: RwLock<Vec<String>>,
}

/// Which part of the script a service name addresses.
#[derive(Debug, PartialEq, Eq)]
enum Target<'a> {
    Umbrella,
    Sub(&'a str),
}

impl InitScriptJob {
    pub fn new(name: &str, config: &JobConfig) -> Result<Self, JobError> {
        let script = PathBuf::from(config.get_or("script", DEFAULT_SCRIPT));
        let umbrella = match config.get("umbrella") {
            Some(umbrella) => umbrella.to_string(),
            None => script
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.to_string()),
        };

        Ok(Self {
            base: JobBase::new(name, config)?,
            script,
            prefix: config.get_or("prefix", DEFAULT_PREFIX).to_string(),
            umbrella,
            services: RwLock::new(Vec::new()),
        })
    }

    /// Resolves a service name; sub-services must have been discovered.
    fn target<'a>(&self, service: &'a str) -> Result<Target<'a>, JobError> {
        if service == self.umbrella {
            return Ok(Target::Umbrella);
        }
        let unknown = || JobError::UnknownService(service.to_string());
        let sub = service
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|sub| !sub.is_empty())
            .ok_or_else(unknown)?;

        if self.services.read()?.iter().any(|known| known == sub) {
            Ok(Target::Sub(sub))
        } else {
            Err(unknown())
        }
    }

    fn command(&self, verb: &str, target: &Target<'_>) -> String {
        let script = self.script.to_string_lossy();
        let script = shell_words::quote(&script);
        match target {
            Target::Umbrella => format!("{script} {verb}"),
            Target::Sub(sub) => format!("{script} {verb} {}", shell_words::quote(sub)),
        }
    }

    fn describe(&self, target: &Target<'_>) -> String {
        match target {
            Target::Umbrella => self.umbrella.clone(),
            Target::Sub(sub) => format!("{}.{}", self.prefix, sub),
        }
    }
}

/// Extracts sub-service names from the script's usage output.
///
/// Expects the last non-empty line to read
/// `Possible services are: a, b, c` (the colon is optional).
pub fn parse_possible_services(lines: &[String]) -> Option<Vec<String>> {
    let last = lines.iter().rev().find(|line| !line.trim().is_empty())?;
    let rest = last.trim().strip_prefix(SERVICES_MARKER)?;
    let rest = rest.trim_start().trim_start_matches(':');

    Some(
        rest.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Classifies umbrella `status` output by scanning for "dead" and "running".
pub fn parse_umbrella_status(lines: &[String]) -> Status {
    let something_dead = lines.iter().any(|line| line.contains("dead"));
    let something_running = lines.iter().any(|line| line.contains("running"));
    match (something_dead, something_running) {
        (true, true) => Status::Warning,
        (false, true) => Status::Running,
        _ => Status::Dead,
    }
}

impl Job for InitScriptJob {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn check(&self) -> bool {
        if !self.script.exists() {
            error!("{} missing", self.script.display());
            return false;
        }
        true
    }

    fn get_services(&self) -> Result<Vec<String>, JobError> {
        let process = self
            .base
            .sync_call(&format!(
                "{} 2>&1",
                shell_words::quote(&self.script.to_string_lossy())
            ))?;
        if let Some(found) = parse_possible_services(&process.stdout()) {
            *self.services.write()? = found;
        }

        let services = self.services.read()?;
        let mut listing = Vec::with_capacity(services.len() + 1);
        listing.push(self.umbrella.clone());
        listing.extend(services.iter().map(|sub| format!("{}.{}", self.prefix, sub)));
        Ok(listing)
    }

    fn start_service(&self, service: &str) -> Result<(), JobError> {
        let target = self.target(service)?;
        info!("starting {}", self.describe(&target));
        self.base.async_start(service, &self.command("start", &target))
    }

    fn stop_service(&self, service: &str) -> Result<(), JobError> {
        let target = self.target(service)?;
        info!("stopping {}", self.describe(&target));
        self.base.async_stop(service, &self.command("stop", &target))
    }

    fn restart_service(&self, service: &str) -> Result<(), JobError> {
        let target = self.target(service)?;
        info!("restarting {}", self.describe(&target));
        self.base.async_start(service, &self.command("restart", &target))
    }

    fn service_status(&self, service: &str) -> Result<Status, JobError> {
        let target = self.target(service)?;
        self.base.async_status(service, || {
            let command = self.command("status", &target);
            match target {
                Target::Umbrella => {
                    let process = self.base.sync_call(&command)?;
                    Ok(parse_umbrella_status(&process.stdout()))
                }
                Target::Sub(_) => self.base.exit_code_status(&command),
            }
        })
    }
}
