//! Repository manifest
//!
//! The manifest is the denormalized structural index of the repository:
//! machines → versions → instances → snapshots, each node carrying the
//! storage route of its entity. Readers resolve routes through it instead of
//! scanning the backend. It also keeps repository-wide counters used for
//! reporting only; allocation never reads them.
//!
//! The manifest describes structure, never payloads. Every node it holds has
//! a durable record in the entity store.

use crate::entity::{Collection, EntityPath};
use crate::error::{EntityKind, RepoError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Repository-wide totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub machine_count: u64,
    pub version_count: u64,
    pub instance_count: u64,
    pub snapshot_count: u64,
}

impl Counters {
    fn slot(&mut self, kind: EntityKind) -> &mut u64 {
        match kind {
            EntityKind::Machine => &mut self.machine_count,
            EntityKind::Version => &mut self.version_count,
            EntityKind::Instance => &mut self.instance_count,
            EntityKind::Snapshot => &mut self.snapshot_count,
        }
    }

    pub(crate) fn increment(&mut self, kind: EntityKind) {
        *self.slot(kind) += 1;
    }

    pub(crate) fn decrement(&mut self, kind: EntityKind, by: u64) {
        let slot = self.slot(kind);
        *slot = slot.saturating_sub(by);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub route: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub route: String,
    #[serde(default)]
    pub snapshots: IndexMap<String, SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub route: String,
    #[serde(default)]
    pub instances: IndexMap<String, InstanceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineEntry {
    pub route: String,
    #[serde(default)]
    pub versions: IndexMap<String, VersionEntry>,
}

/// Structural index of the whole repository
///
/// Maps preserve insertion order, which is creation order for every
/// collection, so `version_keys` returns `version1..versionN` in sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub machines: IndexMap<String, MachineEntry>,

    #[serde(default)]
    pub counters: Counters,
}

impl Manifest {
    /// File name of the manifest record at the commit-log root
    pub const FILE_NAME: &'static str = "manifest.json";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn machine(&self, name: &str) -> Result<&MachineEntry> {
        self.machines
            .get(name)
            .ok_or_else(|| RepoError::not_found(EntityKind::Machine, name))
    }

    pub fn version(&self, machine: &str, version: &str) -> Result<&VersionEntry> {
        self.machine(machine)?
            .versions
            .get(version)
            .ok_or_else(|| RepoError::not_found(EntityKind::Version, format!("{}/{}", machine, version)))
    }

    pub fn instance(&self, machine: &str, version: &str, instance: &str) -> Result<&InstanceEntry> {
        self.version(machine, version)?
            .instances
            .get(instance)
            .ok_or_else(|| {
                RepoError::not_found(
                    EntityKind::Instance,
                    format!("{}/{}/{}", machine, version, instance),
                )
            })
    }

    pub fn snapshot(
        &self,
        machine: &str,
        version: &str,
        instance: &str,
        snapshot: &str,
    ) -> Result<&SnapshotEntry> {
        self.instance(machine, version, instance)?
            .snapshots
            .get(snapshot)
            .ok_or_else(|| {
                RepoError::not_found(
                    EntityKind::Snapshot,
                    format!("{}/{}/{}/{}", machine, version, instance, snapshot),
                )
            })
    }

    /// Resolve the storage route of an entity, failing with `NotFound` on the
    /// first missing ancestor
    pub fn route(&self, path: &EntityPath) -> Result<&str> {
        let s = path.segments();
        let route = match s.len() {
            1 => &self.machine(&s[0])?.route,
            2 => &self.version(&s[0], &s[1])?.route,
            3 => &self.instance(&s[0], &s[1], &s[2])?.route,
            _ => &self.snapshot(&s[0], &s[1], &s[2], &s[3])?.route,
        };
        Ok(route.as_str())
    }

    pub fn contains(&self, path: &EntityPath) -> bool {
        self.route(path).is_ok()
    }

    /// Member keys of a collection in creation order
    pub fn keys(&self, collection: &Collection) -> Result<Vec<String>> {
        let keys = match collection {
            Collection::Machines => self.machines.keys().cloned().collect(),
            Collection::Children(owner) => {
                let s = owner.segments();
                match s.len() {
                    1 => self.machine(&s[0])?.versions.keys().cloned().collect(),
                    2 => self.version(&s[0], &s[1])?.instances.keys().cloned().collect(),
                    _ => self
                        .instance(&s[0], &s[1], &s[2])?
                        .snapshots
                        .keys()
                        .cloned()
                        .collect(),
                }
            }
        };
        Ok(keys)
    }

    /// Number of members of a collection
    pub fn len_of(&self, collection: &Collection) -> Result<usize> {
        let len = match collection {
            Collection::Machines => self.machines.len(),
            Collection::Children(owner) => {
                let s = owner.segments();
                match s.len() {
                    1 => self.machine(&s[0])?.versions.len(),
                    2 => self.version(&s[0], &s[1])?.instances.len(),
                    _ => self.instance(&s[0], &s[1], &s[2])?.snapshots.len(),
                }
            }
        };
        Ok(len)
    }

    /// Register a new entity under an existing parent
    pub fn insert(&mut self, path: &EntityPath, route: impl Into<String>) -> Result<()> {
        let route = route.into();
        let s = path.segments();
        let duplicate = || RepoError::AlreadyExists(path.to_string());

        match s.len() {
            1 => {
                if self.machines.contains_key(&s[0]) {
                    return Err(duplicate());
                }
                self.machines.insert(
                    s[0].clone(),
                    MachineEntry {
                        route,
                        versions: IndexMap::new(),
                    },
                );
            }
            2 => {
                let machine = self.machine_mut(&s[0])?;
                if machine.versions.contains_key(&s[1]) {
                    return Err(duplicate());
                }
                machine.versions.insert(
                    s[1].clone(),
                    VersionEntry {
                        route,
                        instances: IndexMap::new(),
                    },
                );
            }
            3 => {
                let version = self.version_mut(&s[0], &s[1])?;
                if version.instances.contains_key(&s[2]) {
                    return Err(duplicate());
                }
                version.instances.insert(
                    s[2].clone(),
                    InstanceEntry {
                        route,
                        snapshots: IndexMap::new(),
                    },
                );
            }
            _ => {
                let instance = self.instance_mut(&s[0], &s[1], &s[2])?;
                if instance.snapshots.contains_key(&s[3]) {
                    return Err(duplicate());
                }
                instance.snapshots.insert(s[3].clone(), SnapshotEntry { route });
            }
        }

        self.counters.increment(path.kind());
        Ok(())
    }

    /// Every entity of a machine's subtree, the machine itself first
    pub fn subtree(&self, machine: &str) -> Result<Vec<EntityPath>> {
        let entry = self.machine(machine)?;
        let mut paths = vec![EntityPath::machine(machine)];
        for (version_key, version) in &entry.versions {
            paths.push(EntityPath::version(machine, version_key));
            for (instance_key, instance) in &version.instances {
                paths.push(EntityPath::instance(machine, version_key, instance_key));
                for snapshot_key in instance.snapshots.keys() {
                    paths.push(EntityPath::snapshot(
                        machine,
                        version_key,
                        instance_key,
                        snapshot_key,
                    ));
                }
            }
        }
        Ok(paths)
    }

    /// Every collection inside a machine's subtree, including its version list
    pub fn collections_under(&self, machine: &str) -> Result<Vec<Collection>> {
        Ok(self
            .subtree(machine)?
            .iter()
            .filter_map(|path| path.children())
            .collect())
    }

    /// Drop a machine and its descendants, returning the removed paths
    pub fn remove_machine(&mut self, machine: &str) -> Result<Vec<EntityPath>> {
        let removed = self.subtree(machine)?;
        self.machines.shift_remove(machine);

        for kind in [
            EntityKind::Machine,
            EntityKind::Version,
            EntityKind::Instance,
            EntityKind::Snapshot,
        ] {
            let n = removed.iter().filter(|p| p.kind() == kind).count() as u64;
            self.counters.decrement(kind, n);
        }

        Ok(removed)
    }

    fn machine_mut(&mut self, name: &str) -> Result<&mut MachineEntry> {
        self.machines
            .get_mut(name)
            .ok_or_else(|| RepoError::not_found(EntityKind::Machine, name))
    }

    fn version_mut(&mut self, machine: &str, version: &str) -> Result<&mut VersionEntry> {
        self.machine_mut(machine)?
            .versions
            .get_mut(version)
            .ok_or_else(|| RepoError::not_found(EntityKind::Version, format!("{}/{}", machine, version)))
    }

    fn instance_mut(
        &mut self,
        machine: &str,
        version: &str,
        instance: &str,
    ) -> Result<&mut InstanceEntry> {
        self.version_mut(machine, version)?
            .instances
            .get_mut(instance)
            .ok_or_else(|| {
                RepoError::not_found(
                    EntityKind::Instance,
                    format!("{}/{}/{}", machine, version, instance),
                )
            })
    }
}
