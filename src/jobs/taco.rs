//! Multi-server farms managed through per-server init scripts and a device
//! registry.
//!
//! Discovery scans the init directory for the manager script and one
//! `<prefix>-server-<server>` script per server, then asks the registry
//! which instances exist, which devices they own and which devices those
//! devices reference. The resulting [`DependencyGraph`] is exposed through
//! [`Job::dependencies`]; start/stop requests are never reordered by it.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use tracing::{debug, info, warn};

use super::{
    Job, JobBase,
    graph::{DependencyGraph, ServerInstance},
};
use crate::{config::JobConfig, error::JobError, status::Status};

const DEFAULT_INITDIR: &str = "/etc/init.d";
const DEFAULT_PREFIX: &str = "taco";
const DEFAULT_DEVICELIST: &str = "db_devicelist";
const DEFAULT_DEVRES: &str = "db_devres";

/// Script and optional instance argument behind one service name.
#[derive(Debug, Clone)]
struct ScriptTarget {
    script: PathBuf,
    instance: Option<ServerInstance>,
}

/// Result of one discovery pass, replaced wholesale on the next.
#[derive(Debug, Default)]
struct Discovery {
    targets: HashMap<String, ScriptTarget>,
    graph: DependencyGraph,
}

pub struct TacoJob {
    base: JobBase,
    initdir: PathBuf,
    prefix: String,
    devicelist: String,
    devres: String,
    discovery: RwLock<Arc<Discovery>>,
}

impl TacoJob {
    pub fn new(name: &str, config: &JobConfig) -> Result<Self, JobError> {
        Ok(Self {
            base: JobBase::new(name, config)?,
            initdir: PathBuf::from(config.get_or("initdir", DEFAULT_INITDIR)),
            prefix: config.get_or("prefix", DEFAULT_PREFIX).to_string(),
            devicelist: config.get_or("devicelist", DEFAULT_DEVICELIST).to_string(),
            devres: config.get_or("devres", DEFAULT_DEVRES).to_string(),
            discovery: RwLock::new(Arc::new(Discovery::default())),
        })
    }

    fn server_script_prefix(&self) -> String {
        format!("{}-server-", self.prefix)
    }

    fn service_name(&self, node: &ServerInstance) -> String {
        format!("{}-{}.{}", self.prefix, node.server, node.instance)
    }

    /// The current dependency graph.
    pub fn graph(&self) -> Result<DependencyGraph, JobError> {
        Ok(self.snapshot()?.graph.clone())
    }

    fn snapshot(&self) -> Result<Arc<Discovery>, JobError> {
        Ok(Arc::clone(&*self.discovery.read()?))
    }

    fn target(&self, service: &str) -> Result<ScriptTarget, JobError> {
        self.snapshot()?
            .targets
            .get(service)
            .cloned()
            .ok_or_else(|| JobError::UnknownService(service.to_string()))
    }

    fn command(&self, verb: &str, target: &ScriptTarget) -> String {
        let script = target.script.to_string_lossy();
        let script = shell_words::quote(&script);
        match &target.instance {
            Some(node) => format!("{script} {verb} {}", shell_words::quote(&node.instance)),
            None => format!("{script} {verb}"),
        }
    }

    fn describe(&self, service: &str, target: &ScriptTarget) -> String {
        match target.instance {
            Some(_) => format!("server {service}"),
            None => format!("{} system", self.prefix.to_uppercase()),
        }
    }

    /// Scans the init directory for manager and server scripts.
    fn scan_scripts(&self) -> Result<(Option<PathBuf>, BTreeMap<String, PathBuf>), JobError> {
        let server_prefix = self.server_script_prefix();
        let debian = format!("{}.debian", self.prefix);
        let mut manager = None;
        let mut servers = BTreeMap::new();

        for entry in fs::read_dir(&self.initdir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(server) = file_name.strip_prefix(&server_prefix) {
                if !server.is_empty() {
                    servers.insert(server.to_string(), entry.path());
                }
            } else if file_name == self.prefix || file_name == debian {
                manager = Some(entry.path());
            }
        }

        Ok((manager, servers))
    }

    /// Queries the registry for the resource values of every device.
    fn read_references(
        &self,
        devices: &BTreeMap<ServerInstance, Vec<String>>,
    ) -> Result<HashMap<String, Vec<String>>, JobError> {
        let mut references = HashMap::new();
        for dev in devices.values().flatten() {
            let command = format!("{} {}", self.devres, shell_words::quote(dev));
            let process = self.base.sync_call(&command)?;
            references.insert(dev.clone(), parse_device_resources(dev, &process.stdout()));
        }
        Ok(references)
    }
}

/// Parses the registry's device listing.
///
/// Header lines look like `<server>server/<instance> ...`; the devices of
/// that instance follow on tab-indented lines. Instances of servers not in
/// `known_servers` and unparseable headers are skipped together with their
/// devices.
pub fn parse_device_list(
    lines: &[String],
    known_servers: &BTreeSet<String>,
) -> BTreeMap<ServerInstance, Vec<String>> {
    let mut servers: BTreeMap<ServerInstance, Vec<String>> = BTreeMap::new();
    let mut current: Option<ServerInstance> = None;

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }

        if line.starts_with('\t') {
            if let Some(node) = &current {
                servers
                    .entry(node.clone())
                    .or_default()
                    .push(line.trim().to_string());
            }
            continue;
        }

        current = line
            .split_whitespace()
            .next()
            .and_then(|token| token.split_once('/'))
            .and_then(|(srv, inst)| {
                let server = srv.strip_suffix("server")?;
                (!server.is_empty() && !inst.is_empty() && known_servers.contains(server))
                    .then(|| ServerInstance::new(server, inst))
            });

        if let Some(node) = &current {
            servers.entry(node.clone()).or_default();
        } else {
            debug!("ignoring registry entry '{}'", line.trim());
        }
    }

    servers
}

/// Parses `<device>/<resource>: <value>` lines for `device`, returning the
/// resource values. Lines for other devices or without a colon are skipped.
pub fn parse_device_resources(device: &str, lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once(':')?;
            let (kdev, _resource) = key.trim().rsplit_once('/')?;
            if kdev != device {
                return None;
            }
            Some(value.trim().to_string())
        })
        .filter(|value| !value.is_empty())
        .collect()
}

impl Job for TacoJob {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn check(&self) -> bool {
        match fs::read_dir(&self.initdir) {
            Ok(entries) => {
                let found = entries
                    .filter_map(Result::ok)
                    .any(|entry| entry.file_name().to_string_lossy().starts_with(&self.prefix));
                if !found {
                    warn!("no {} init scripts in {}", self.prefix, self.initdir.display());
                }
                found
            }
            Err(err) => {
                warn!("cannot read {}: {}", self.initdir.display(), err);
                false
            }
        }
    }

    fn get_services(&self) -> Result<Vec<String>, JobError> {
        let (manager, scripts) = self.scan_scripts()?;
        let known: BTreeSet<String> = scripts.keys().cloned().collect();

        let listing = self.base.sync_call(&self.devicelist)?;
        let devices = parse_device_list(&listing.stdout(), &known);
        let references = self.read_references(&devices)?;
        let graph = DependencyGraph::build(devices, &references);

        let mut services = Vec::new();
        let mut targets = HashMap::new();
        if let Some(script) = manager {
            services.push(self.prefix.clone());
            targets.insert(
                self.prefix.clone(),
                ScriptTarget {
                    script,
                    instance: None,
                },
            );
        }
        for node in graph.nodes() {
            let Some(script) = scripts.get(&node.server) else {
                continue;
            };
            let name = self.service_name(node);
            debug!("{} owns {} device(s)", name, graph.devices_of(node).len());
            services.push(name.clone());
            targets.insert(
                name,
                ScriptTarget {
                    script: script.clone(),
                    instance: Some(node.clone()),
                },
            );
        }

        let discovery = Arc::new(Discovery {
            targets,
            graph,
        });
        *self.discovery.write()? = discovery;
        Ok(services)
    }

    fn start_service(&self, service: &str) -> Result<(), JobError> {
        let target = self.target(service)?;
        info!("starting {}", self.describe(service, &target));
        self.base.async_start(service, &self.command("start", &target))
    }

    fn stop_service(&self, service: &str) -> Result<(), JobError> {
        let target = self.target(service)?;
        info!("stopping {}", self.describe(service, &target));
        self.base.async_stop(service, &self.command("stop", &target))
    }

    fn restart_service(&self, service: &str) -> Result<(), JobError> {
        let target = self.target(service)?;
        info!("restarting {}", self.describe(service, &target));
        self.base.async_start(service, &self.command("restart", &target))
    }

    fn service_status(&self, service: &str) -> Result<Status, JobError> {
        let target = self.target(service)?;
        self.base.async_status(service, || {
            self.base.exit_code_status(&self.command("status", &target))
        })
    }

    fn dependencies(&self, service: &str) -> Vec<String> {
        let Ok(discovery) = self.snapshot() else {
            return Vec::new();
        };
        let Some(node) = discovery
            .targets
            .get(service)
            .and_then(|target| target.instance.as_ref())
        else {
            return Vec::new();
        };

        let mut names: Vec<String> = discovery
            .graph
            .depends_on(node)
            .filter(|dep| discovery.targets.contains_key(&self.service_name(dep)))
            .map(|dep| self.service_name(dep))
            .collect();
        names.sort();
        names
    }
}
