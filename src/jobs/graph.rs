//! Device-level dependency graph between server instances.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

/// One running instance of a server binary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerInstance {
    pub server: String,
    pub instance: String,
}

impl ServerInstance {
    pub fn new(server: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for ServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server, self.instance)
    }
}

/// Which instance owns which device, and which instances are coupled
/// because one references a device owned by the other.
///
/// Coupling is always recorded in both directions: restarting either side
/// can disrupt the other.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    devices: BTreeMap<ServerInstance, Vec<String>>,
    owners: HashMap<String, ServerInstance>,
    depends: BTreeMap<ServerInstance, BTreeSet<ServerInstance>>,
}

impl DependencyGraph {
    /// Builds the graph from device ownership and, per device, the values of
    /// its resources. A resource value naming another instance's device
    /// couples the two instances.
    pub fn build(
        devices: BTreeMap<ServerInstance, Vec<String>>,
        references: &HashMap<String, Vec<String>>,
    ) -> Self {
        let mut owners = HashMap::new();
        for (node, devs) in &devices {
            for dev in devs {
                owners.insert(dev.clone(), node.clone());
            }
        }

        let mut depends: BTreeMap<ServerInstance, BTreeSet<ServerInstance>> = devices
            .keys()
            .map(|node| (node.clone(), BTreeSet::new()))
            .collect();

        for (node, devs) in &devices {
            let targets: BTreeSet<&ServerInstance> = devs
                .iter()
                .filter_map(|dev| references.get(dev))
                .flatten()
                .filter_map(|value| owners.get(value))
                .filter(|owner| *owner != node)
                .collect();

            for target in targets {
                depends.entry(node.clone()).or_default().insert(target.clone());
                depends.entry(target.clone()).or_default().insert(node.clone());
            }
        }

        Self {
            devices,
            owners,
            depends,
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ServerInstance> {
        self.devices.keys()
    }

    pub fn devices_of(&self, node: &ServerInstance) -> &[String] {
        self.devices.get(node).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn owner_of(&self, device: &str) -> Option<&ServerInstance> {
        self.owners.get(device)
    }

    pub fn depends_on(&self, node: &ServerInstance) -> impl Iterator<Item = &ServerInstance> {
        self.depends.get(node).into_iter().flatten()
    }
}
