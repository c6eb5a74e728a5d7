//! Key-value entity store
//!
//! Key space:
//!
//! ```text
//! machineList                                   set of machine names
//! machine:<m>:versionList                       sorted set, score = sequence number
//! machine:<m>:version:<v>                       hash { model, info }
//! machine:<m>:version:<v>:instanceList          sorted set
//! machine:<m>:version:<v>:instance:<i>          hash { info }
//! ...:instance:<i>:snapshotList                 sorted set
//! ...:instance:<i>:snapshot:<s>                 hash { info }
//! manifest                                      hash of reporting counters
//! config                                        hash { flags }
//! lock:<list key>                               lock strings (SET NX PX)
//! ```
//!
//! Each [`Transaction`] becomes one atomic [`KvClient::exec`] batch.

mod memory;

pub use memory::MemoryKv;

use super::{EntityStore, Operation, Transaction};
use crate::config::RepositoryFlags;
use crate::entity::{Collection, EntityPath, Field};
use crate::error::{EntityKind, RepoError, Result};
use crate::lock::LockBackend;
use crate::manifest::{Counters, Manifest};
use crate::validation::SequenceName;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Hash holding the repository counters
pub const MANIFEST_KEY: &str = "manifest";

/// Hash holding the repository flags
pub const CONFIG_KEY: &str = "config";

const FLAGS_FIELD: &str = "flags";

/// One write inside an atomic batch
#[derive(Debug, Clone, PartialEq)]
pub enum KvCommand {
    HSet {
        key: String,
        fields: Vec<(String, Vec<u8>)>,
    },
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    ZAdd {
        key: String,
        score: f64,
        member: String,
    },
    ZRem {
        key: String,
        member: String,
    },
    Del {
        key: String,
    },
}

impl KvCommand {
    pub fn key(&self) -> &str {
        match self {
            KvCommand::HSet { key, .. }
            | KvCommand::HIncrBy { key, .. }
            | KvCommand::SAdd { key, .. }
            | KvCommand::SRem { key, .. }
            | KvCommand::ZAdd { key, .. }
            | KvCommand::ZRem { key, .. }
            | KvCommand::Del { key } => key,
        }
    }
}

/// Client of a Redis-like key-value server
///
/// `exec` must apply the whole batch atomically (MULTI/EXEC semantics).
pub trait KvClient: Send + Sync {
    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;
    fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>>;
    fn exists(&self, key: &str) -> Result<bool>;

    fn sismember(&self, key: &str, member: &str) -> Result<bool>;
    fn smembers(&self, key: &str) -> Result<Vec<String>>;
    fn scard(&self, key: &str) -> Result<usize>;

    fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    /// Every member, lowest score first
    fn zrange(&self, key: &str) -> Result<Vec<String>>;
    fn zcard(&self, key: &str) -> Result<usize>;

    /// Set `key` to `value` with a TTL unless it already exists
    fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    /// Delete `key` only if it currently holds `value`
    fn del_if_eq(&self, key: &str, value: &str) -> Result<bool>;

    fn exec(&self, commands: Vec<KvCommand>) -> Result<()>;
}

/// Lock strings stored in the key-value server
pub struct KvLockBackend {
    client: Arc<dyn KvClient>,
}

impl LockBackend for KvLockBackend {
    fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.client.set_nx_px(key, token, ttl)
    }

    fn release(&self, key: &str, token: &str) -> Result<bool> {
        self.client.del_if_eq(key, token)
    }
}

fn counter_field(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Machine => "machineCount",
        EntityKind::Version => "versionCount",
        EntityKind::Instance => "instanceCount",
        EntityKind::Snapshot => "snapshotCount",
    }
}

const KINDS: [EntityKind; 4] = [
    EntityKind::Machine,
    EntityKind::Version,
    EntityKind::Instance,
    EntityKind::Snapshot,
];

/// Entity store on top of a [`KvClient`]
pub struct KvStore {
    client: Arc<dyn KvClient>,
    locks: Arc<KvLockBackend>,
}

impl KvStore {
    pub fn new(client: Arc<dyn KvClient>) -> Self {
        let locks = Arc::new(KvLockBackend {
            client: client.clone(),
        });
        KvStore { client, locks }
    }

    /// Store backed by a fresh [`MemoryKv`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKv::new()))
    }

    pub fn client(&self) -> &Arc<dyn KvClient> {
        &self.client
    }

    /// Reporting counters from the `manifest` hash
    pub fn counters(&self) -> Result<Counters> {
        let mut counters = Counters::default();
        for (field, value) in self.client.hgetall(MANIFEST_KEY)? {
            let n = std::str::from_utf8(&value)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0)
                .max(0) as u64;
            match field.as_str() {
                "machineCount" => counters.machine_count = n,
                "versionCount" => counters.version_count = n,
                "instanceCount" => counters.instance_count = n,
                "snapshotCount" => counters.snapshot_count = n,
                _ => {}
            }
        }
        Ok(counters)
    }

    fn is_member(&self, collection: &Collection, key: &str) -> Result<bool> {
        match collection {
            Collection::Machines => self.client.sismember(&collection.list_key(), key),
            Collection::Children(_) => Ok(self.client.zscore(&collection.list_key(), key)?.is_some()),
        }
    }

    fn ensure_owner(&self, collection: &Collection) -> Result<()> {
        if let Some(owner) = collection.owner() {
            self.resolve(owner)?;
        }
        Ok(())
    }

    fn members(&self, collection: &Collection) -> Result<Vec<String>> {
        match collection {
            Collection::Machines => {
                let mut names = self.client.smembers(&collection.list_key())?;
                names.sort();
                Ok(names)
            }
            Collection::Children(_) => self.client.zrange(&collection.list_key()),
        }
    }

    fn add_subtree(&self, manifest: &mut Manifest, path: &EntityPath) -> Result<()> {
        manifest.insert(path, self.route_for(path))?;
        if let Some(children) = path.children() {
            for key in self.members(&children)? {
                self.add_subtree(manifest, &children.member(&key)?)?;
            }
        }
        Ok(())
    }

    fn member_score(collection: &Collection, key: &str) -> Result<f64> {
        let prefix = collection
            .prefix()
            .ok_or_else(|| RepoError::StorageFailure(format!("{} is not sequence-allocated", collection)))?;
        SequenceName::parse(prefix, key)
            .map(|name| name.number() as f64)
            .ok_or_else(|| RepoError::InvalidName(format!("{} is not a {} key", key, prefix)))
    }

    fn hash_fields(fields: &[(Field, Vec<u8>)]) -> Vec<(String, Vec<u8>)> {
        fields
            .iter()
            .map(|(field, bytes)| (field.hash_field().to_string(), bytes.clone()))
            .collect()
    }
}

impl EntityStore for KvStore {
    fn backend_name(&self) -> &'static str {
        "key-value"
    }

    fn lock_backend(&self) -> Arc<dyn LockBackend> {
        self.locks.clone()
    }

    fn lock_key(&self, collection: &Collection) -> String {
        collection.lock_key()
    }

    fn route_for(&self, path: &EntityPath) -> String {
        path.kv_key()
    }

    fn load_manifest(&self) -> Result<Manifest> {
        let mut manifest = Manifest::new();
        for name in self.members(&Collection::Machines)? {
            let machine = EntityPath::machine(name);
            // A machine without versions is mid-removal
            if self.client.zcard(&Collection::Children(machine.clone()).list_key())? == 0 {
                continue;
            }
            self.add_subtree(&mut manifest, &machine)?;
        }
        manifest.counters = self.counters()?;
        Ok(manifest)
    }

    fn resolve(&self, path: &EntityPath) -> Result<String> {
        let depth = path.segments().len();
        for n in 1..=depth {
            let prefix = EntityPath::machine(path.machine_name());
            let prefix = path.segments()[1..n]
                .iter()
                .try_fold(prefix, |p, key| p.child(key))?;
            if !self.is_member(&prefix.collection(), prefix.key())? {
                return Err(RepoError::not_found(prefix.kind(), prefix.to_string()));
            }
        }
        Ok(path.kv_key())
    }

    fn keys(&self, collection: &Collection) -> Result<Vec<String>> {
        self.ensure_owner(collection)?;
        self.members(collection)
    }

    fn collection_len(&self, collection: &Collection) -> Result<usize> {
        self.ensure_owner(collection)?;
        match collection {
            Collection::Machines => self.client.scard(&collection.list_key()),
            Collection::Children(_) => self.client.zcard(&collection.list_key()),
        }
    }

    fn read_field(&self, path: &EntityPath, field: Field) -> Result<Vec<u8>> {
        debug!("HGET {} {}", path.kv_key(), field.hash_field());
        self.client
            .hget(&path.kv_key(), field.hash_field())?
            .ok_or_else(|| RepoError::not_found(path.kind(), path.to_string()))
    }

    fn load_flags(&self) -> Result<RepositoryFlags> {
        match self.client.hget(CONFIG_KEY, FLAGS_FIELD)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(RepositoryFlags::default()),
        }
    }

    fn commit(&self, txn: Transaction) -> Result<()> {
        let mut commands = Vec::new();

        for op in txn.operations() {
            match op {
                Operation::CreateEntity { path, fields } => {
                    if !fields.is_empty() {
                        commands.push(KvCommand::HSet {
                            key: path.kv_key(),
                            fields: Self::hash_fields(fields),
                        });
                    }
                    let collection = path.collection();
                    commands.push(match &collection {
                        Collection::Machines => KvCommand::SAdd {
                            key: collection.list_key(),
                            member: path.key().to_string(),
                        },
                        Collection::Children(_) => KvCommand::ZAdd {
                            key: collection.list_key(),
                            score: Self::member_score(&collection, path.key())?,
                            member: path.key().to_string(),
                        },
                    });
                    commands.push(KvCommand::HIncrBy {
                        key: MANIFEST_KEY.to_string(),
                        field: counter_field(path.kind()).to_string(),
                        delta: 1,
                    });
                }
                Operation::WriteFields { path, fields } => {
                    commands.push(KvCommand::HSet {
                        key: path.kv_key(),
                        fields: Self::hash_fields(fields),
                    });
                }
                Operation::DeleteSubtree { path, removed } => {
                    for p in removed {
                        commands.push(KvCommand::Del { key: p.kv_key() });
                        if let Some(children) = p.children() {
                            commands.push(KvCommand::Del {
                                key: children.list_key(),
                            });
                        }
                    }
                    let collection = path.collection();
                    commands.push(match &collection {
                        Collection::Machines => KvCommand::SRem {
                            key: collection.list_key(),
                            member: path.key().to_string(),
                        },
                        Collection::Children(_) => KvCommand::ZRem {
                            key: collection.list_key(),
                            member: path.key().to_string(),
                        },
                    });
                    for kind in KINDS {
                        let n = removed.iter().filter(|p| p.kind() == kind).count() as i64;
                        if n > 0 {
                            commands.push(KvCommand::HIncrBy {
                                key: MANIFEST_KEY.to_string(),
                                field: counter_field(kind).to_string(),
                                delta: -n,
                            });
                        }
                    }
                }
                Operation::SetFlags(flags) => {
                    commands.push(KvCommand::HSet {
                        key: CONFIG_KEY.to_string(),
                        fields: vec![(FLAGS_FIELD.to_string(), serde_json::to_vec(flags)?)],
                    });
                }
            }
        }

        let count = commands.len();
        self.client.exec(commands)?;
        info!("Applied '{}' ({} commands)", txn.message(), count);
        Ok(())
    }
}
