//! Entity addressing and per-kind info records
//!
//! Every entity is addressed by a path of human-readable keys
//! (`machine/versionKey/instanceKey/snapshotKey`). The same path maps to a
//! file-tree route for the commit-log backend and to a key for the
//! key-value backend.

use crate::error::{EntityKind, RepoError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Field stored for an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// SCXML document (versions only)
    Model,
    /// Info record
    Info,
}

impl Field {
    /// File name inside the entity directory
    pub fn file_name(&self) -> &'static str {
        match self {
            Field::Model => "model.scxml",
            Field::Info => "info.json",
        }
    }

    /// Field name inside the entity hash
    pub fn hash_field(&self) -> &'static str {
        match self {
            Field::Model => "model",
            Field::Info => "info",
        }
    }
}

/// Path of keys from a machine down to a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityPath {
    segments: Vec<String>,
}

impl EntityPath {
    pub fn machine(name: impl Into<String>) -> Self {
        EntityPath {
            segments: vec![name.into()],
        }
    }

    pub fn version(machine: &str, version: &str) -> Self {
        EntityPath {
            segments: vec![machine.to_string(), version.to_string()],
        }
    }

    pub fn instance(machine: &str, version: &str, instance: &str) -> Self {
        EntityPath {
            segments: vec![
                machine.to_string(),
                version.to_string(),
                instance.to_string(),
            ],
        }
    }

    pub fn snapshot(machine: &str, version: &str, instance: &str, snapshot: &str) -> Self {
        EntityPath {
            segments: vec![
                machine.to_string(),
                version.to_string(),
                instance.to_string(),
                snapshot.to_string(),
            ],
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self.segments.len() {
            1 => EntityKind::Machine,
            2 => EntityKind::Version,
            3 => EntityKind::Instance,
            _ => EntityKind::Snapshot,
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn machine_name(&self) -> &str {
        &self.segments[0]
    }

    /// Key of this entity inside its parent collection
    pub fn key(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    pub fn parent(&self) -> Option<EntityPath> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(EntityPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Collection this entity belongs to
    pub fn collection(&self) -> Collection {
        match self.parent() {
            None => Collection::Machines,
            Some(parent) => Collection::Children(parent),
        }
    }

    /// Collection of this entity's children, if the kind has any
    pub fn children(&self) -> Option<Collection> {
        if self.kind() == EntityKind::Snapshot {
            None
        } else {
            Some(Collection::Children(self.clone()))
        }
    }

    /// Extend the path with a child key
    pub fn child(&self, key: &str) -> Result<EntityPath> {
        if self.kind() == EntityKind::Snapshot {
            return Err(RepoError::StorageFailure(format!(
                "snapshot {} cannot have children",
                self
            )));
        }
        let mut segments = self.segments.clone();
        segments.push(key.to_string());
        Ok(EntityPath { segments })
    }

    /// Directory route relative to the commit-log root
    ///
    /// `machines/m/versions/version1/instances/instance2/snapshots/snapshot3`
    pub fn route(&self) -> String {
        let mut route = format!("machines/{}", self.segments[0]);
        let dirs = ["versions", "instances", "snapshots"];
        for (dir, key) in dirs.iter().zip(self.segments.iter().skip(1)) {
            route.push('/');
            route.push_str(dir);
            route.push('/');
            route.push_str(key);
        }
        route
    }

    /// Hash key used by the key-value backend
    ///
    /// `machine:m:version:version1:instance:instance2:snapshot:snapshot3`
    pub fn kv_key(&self) -> String {
        let labels = ["machine", "version", "instance", "snapshot"];
        labels
            .iter()
            .zip(self.segments.iter())
            .map(|(label, key)| format!("{}:{}", label, key))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

/// A collection of sibling entities sharing one parent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    /// All machines of the repository
    Machines,
    /// Children of the given owner (versions of a machine, instances of a
    /// version, snapshots of an instance)
    Children(EntityPath),
}

impl Collection {
    pub fn owner(&self) -> Option<&EntityPath> {
        match self {
            Collection::Machines => None,
            Collection::Children(owner) => Some(owner),
        }
    }

    /// Kind of the entities held by this collection
    pub fn member_kind(&self) -> EntityKind {
        match self.owner().map(|o| o.kind()) {
            None => EntityKind::Machine,
            Some(EntityKind::Machine) => EntityKind::Version,
            Some(EntityKind::Version) => EntityKind::Instance,
            _ => EntityKind::Snapshot,
        }
    }

    /// Prefix of sequence-allocated keys, `None` for machines (named by callers)
    pub fn prefix(&self) -> Option<&'static str> {
        match self.member_kind() {
            EntityKind::Machine => None,
            EntityKind::Version => Some("version"),
            EntityKind::Instance => Some("instance"),
            EntityKind::Snapshot => Some("snapshot"),
        }
    }

    /// Key of the set / sorted set listing the members
    pub fn list_key(&self) -> String {
        match self {
            Collection::Machines => "machineList".to_string(),
            Collection::Children(owner) => {
                format!("{}:{}List", owner.kv_key(), self.member_kind())
            }
        }
    }

    /// Advisory lock guarding allocation inside this collection
    pub fn lock_key(&self) -> String {
        format!("lock:{}", self.list_key())
    }

    pub fn member(&self, key: &str) -> Result<EntityPath> {
        match self {
            Collection::Machines => Ok(EntityPath::machine(key)),
            Collection::Children(owner) => owner.child(key),
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collection::Machines => f.write_str("machines"),
            Collection::Children(owner) => write!(f, "{}/{}s", owner, self.member_kind()),
        }
    }
}

/// Info record of a version
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub is_sealed: bool,

    /// Caller-supplied extension payload, never interpreted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

/// Info record of an instance
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub has_started: bool,
    pub has_ended: bool,

    /// Caller-supplied extension payload, never interpreted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
}

pub(crate) fn encode_info<T: Serialize>(info: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(info)?)
}

pub(crate) fn decode_info<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// The `(machine, version, instance)` triple consumed by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    pub machine: String,
    pub version: String,
    pub instance: String,
}

impl InstanceRef {
    pub fn new(
        machine: impl Into<String>,
        version: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        InstanceRef {
            machine: machine.into(),
            version: version.into(),
            instance: instance.into(),
        }
    }

    pub fn path(&self) -> EntityPath {
        EntityPath::instance(&self.machine, &self.version, &self.instance)
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.machine, self.version, self.instance)
    }
}
