//! # Machine Vault - Versioned Store for State-Machine Definitions
//!
//! `machine-vault` keeps a hierarchy of SCXML state machines:
//!
//! ```text
//! machine ──┬── version1 (sealed) ──┬── instance1 ── snapshot1, snapshot2
//!           │                       └── instance2
//!           └── version2 (unsealed)
//! ```
//!
//! - **Dense keys**: versions, instances and snapshots are named `version1`,
//!   `version2`... per parent, allocated under an advisory lock
//! - **Seal**: a version is editable until sealed; sealing validates the model
//!   and is irreversible. Instances only spawn from sealed versions
//! - **Two backends**: a file tree with a commit log (optionally mirrored to
//!   a replica), or a key-value store with per-collection locks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use machine_vault::{Repository, Result};
//!
//! # fn main() -> Result<()> {
//! let repo = Repository::open("/var/lib/machines")?;
//!
//! repo.create_machine("door")?;
//! repo.seal_version("door", "version1")?;
//!
//! let instance = repo.create_instance("door", "version1")?;
//! let snapshot = repo.create_snapshot("door", "version1", &instance, br#"{"state":"idle"}"#)?;
//! assert_eq!(snapshot, "snapshot1");
//! # Ok(())
//! # }
//! ```
//!
//! ## Builder
//!
//! ```rust,no_run
//! use machine_vault::{InMemoryQueue, RepositoryBuilder, Result};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let repo = RepositoryBuilder::new()
//!     .path("/var/lib/machines")
//!     .remote("/mnt/mirror/machines")
//!     .validator(|model: &[u8]| -> std::result::Result<bool, String> { Ok(!model.is_empty()) })
//!     .dispatcher(Arc::new(InMemoryQueue::new()))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core resolve
#[allow(unused_imports)]
pub(crate) use core::{
    allocator, config, dispatch, entity, error, lock, manifest, seal, store, validation,
};

pub use crate::core::{
    config::{BackendConfig, LockConfig, RepositoryConfig, RepositoryFlags, DEFAULT_BASE_MODEL},
    dispatch::{Dispatcher, InMemoryQueue, Job},
    entity::{InstanceInfo, InstanceRef, VersionInfo},
    error::{EntityKind, RepoError, Result, StateViolation},
    manifest::{Counters, Manifest},
    seal::{ModelValidator, ScxmlRootValidator},
    store::{
        CommitLogStore, CommitRecord, DirectoryReplica, EntityStore, KvClient, KvCommand, KvStore,
        MemoryKv, Replica,
    },
    validation::MachineName,
};

use crate::allocator::SequenceAllocator;
use crate::entity::{decode_info, encode_info, Collection, EntityPath, Field};
use crate::lock::{LockCoordinator, LockGuard};
use crate::seal::SealGuard;
use crate::store::Transaction;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Versioned repository of state machines
///
/// A `Repository` is `Send + Sync`; share it between threads with an `Arc`.
/// Mutations take advisory locks, reads never do.
pub struct Repository {
    store: Arc<dyn EntityStore>,
    commit_log: Option<Arc<CommitLogStore>>,
    locks: LockCoordinator,
    seal: SealGuard,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    base_model: Vec<u8>,
}

impl Repository {
    /// Open (or initialize) a commit-log repository at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        RepositoryBuilder::new().path(path.as_ref()).build()
    }

    /// Repository over a fresh in-process key-value store
    pub fn in_memory() -> Result<Self> {
        RepositoryBuilder::new().key_value().build()
    }

    /// Build a repository from a loaded configuration
    pub fn from_config(config: RepositoryConfig) -> Result<Self> {
        RepositoryBuilder::new().config(config).build()
    }

    pub fn builder() -> RepositoryBuilder {
        RepositoryBuilder::new()
    }

    /// Name of the active backend
    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    fn hold(&self) -> Duration {
        self.locks.default_hold()
    }

    fn version_info(&self, path: &EntityPath) -> Result<VersionInfo> {
        decode_info(&self.store.read_field(path, Field::Info)?)
    }

    /// Commit `txn` unless the locks in `guard` may have expired meanwhile
    fn commit(&self, guard: &LockGuard<'_>, txn: Transaction) -> Result<()> {
        guard.ensure_live()?;
        self.store.commit(txn)
    }

    fn dispatcher(&self) -> Result<&Arc<dyn Dispatcher>> {
        self.dispatcher
            .as_ref()
            .ok_or_else(|| RepoError::Config("no dispatcher configured".to_string()))
    }

    // ---------------------------------------------------------------------
    // Machines
    // ---------------------------------------------------------------------

    /// Create a machine together with its unsealed `version1`
    ///
    /// `version1` gets the configured base model. Fails with `AlreadyExists`
    /// if the name is taken and `InvalidName` if it is not a valid name.
    pub fn create_machine(&self, name: &str) -> Result<()> {
        let name = MachineName::new(name)?;
        let machine = EntityPath::machine(name.as_str());
        let version = machine.child("version1")?;

        let guard = self
            .locks
            .acquire(&self.store.lock_key(&Collection::Machines), self.hold())?;

        match self.store.resolve(&machine) {
            Ok(_) => return Err(RepoError::AlreadyExists(name.into_string())),
            Err(RepoError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let txn = Transaction::new(format!("Added '{}' machine", name))
            .create_entity(machine, Vec::new())
            .create_entity(
                version,
                vec![
                    (Field::Model, self.base_model.clone()),
                    (Field::Info, encode_info(&VersionInfo::default())?),
                ],
            );
        self.commit(&guard, txn)?;

        info!("Created machine '{}'", name);
        Ok(())
    }

    /// Lock keys needed to remove `machine` as seen by `manifest`
    fn removal_locks(&self, manifest: &Manifest, machine: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = manifest
            .collections_under(machine)?
            .iter()
            .map(|c| self.store.lock_key(c))
            .collect();
        keys.push(self.store.lock_key(&Collection::Machines));
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Remove a machine and everything below it
    ///
    /// Locks the machine list and every collection inside the machine, so no
    /// allocation can interleave with the removal.
    pub fn remove_machine(&self, name: &str) -> Result<()> {
        let machine = EntityPath::machine(name);
        self.store.resolve(&machine)?;

        let mut keys = self.removal_locks(&self.store.load_manifest()?, name)?;
        loop {
            let guard = self.locks.acquire_all(&keys, self.hold())?;

            // Collections created while we waited need their locks too
            let manifest = self.store.load_manifest()?;
            let needed = self.removal_locks(&manifest, name)?;
            if !needed.iter().all(|k| guard.covers(k)) {
                debug!("Lock set for removing '{}' grew, retrying", name);
                drop(guard);
                keys = needed;
                continue;
            }

            let removed = manifest.subtree(name)?;
            let count = removed.len();
            self.commit(
                &guard,
                Transaction::new(format!("Removed '{}' machine", name))
                    .delete_subtree(machine, removed),
            )?;

            info!("Removed machine '{}' ({} entities)", name, count);
            return Ok(());
        }
    }

    /// Machine names
    pub fn list_machines(&self) -> Result<Vec<String>> {
        self.store.keys(&Collection::Machines)
    }

    /// Same as [`Repository::list_machines`]
    pub fn machine_names(&self) -> Result<Vec<String>> {
        self.list_machines()
    }

    // ---------------------------------------------------------------------
    // Versions
    // ---------------------------------------------------------------------

    /// Create the next version of a machine, copying the latest model
    ///
    /// Requires the latest version to be sealed.
    pub fn create_version(&self, machine: &str) -> Result<String> {
        let owner = EntityPath::machine(machine);
        self.store.resolve(&owner)?;
        let versions = Collection::Children(owner.clone());

        let guard = self
            .locks
            .acquire(&self.store.lock_key(&versions), self.hold())?;
        self.store.resolve(&owner)?;

        let previous_key = self
            .store
            .keys(&versions)?
            .pop()
            .ok_or_else(|| RepoError::StorageFailure(format!("machine {} has no versions", machine)))?;
        let previous = versions.member(&previous_key)?;
        SealGuard::ensure_previous_sealed(&self.version_info(&previous)?)?;
        let model = self.store.read_field(&previous, Field::Model)?;

        let key = SequenceAllocator::allocate_next(&guard, self.store.as_ref(), &versions)?.to_string();
        let path = versions.member(&key)?;
        self.commit(
            &guard,
            Transaction::new(format!("Added '{}' version to '{}' machine", key, machine)).create_entity(
                path,
                vec![
                    (Field::Model, model),
                    (Field::Info, encode_info(&VersionInfo::default())?),
                ],
            ),
        )?;

        info!("Created version {}/{}", machine, key);
        Ok(key)
    }

    /// Validate and seal a version; irreversible
    pub fn seal_version(&self, machine: &str, version: &str) -> Result<()> {
        let path = EntityPath::version(machine, version);
        self.store.resolve(&path)?;

        let guard = self
            .locks
            .acquire(&self.store.lock_key(&path.collection()), self.hold())?;
        self.store.resolve(&path)?;

        let info = self.version_info(&path)?;
        let model = self.store.read_field(&path, Field::Model)?;
        let sealed = self.seal.seal(&info, &model)?;

        self.commit(
            &guard,
            Transaction::new(format!("Sealed '{}' version of '{}' machine", version, machine))
                .write_fields(path, vec![(Field::Info, encode_info(&sealed)?)]),
        )?;

        info!("Sealed version {}/{}", machine, version);
        Ok(())
    }

    /// Version keys of a machine in creation order
    pub fn version_keys(&self, machine: &str) -> Result<Vec<String>> {
        self.store
            .keys(&Collection::Children(EntityPath::machine(machine)))
    }

    pub fn version_route(&self, machine: &str, version: &str) -> Result<String> {
        self.store.resolve(&EntityPath::version(machine, version))
    }

    pub fn get_model(&self, machine: &str, version: &str) -> Result<Vec<u8>> {
        let path = EntityPath::version(machine, version);
        self.store.resolve(&path)?;
        self.store.read_field(&path, Field::Model)
    }

    /// Replace the model of an unsealed version
    pub fn set_model(&self, machine: &str, version: &str, model: &[u8]) -> Result<()> {
        let path = EntityPath::version(machine, version);
        self.store.resolve(&path)?;

        let guard = self
            .locks
            .acquire(&self.store.lock_key(&path.collection()), self.hold())?;
        self.store.resolve(&path)?;
        SealGuard::ensure_unsealed(&self.version_info(&path)?)?;

        self.commit(
            &guard,
            Transaction::new(format!("Updated model of '{}' version of '{}' machine", version, machine))
                .write_fields(path, vec![(Field::Model, model.to_vec())]),
        )?;

        info!("Updated model of {}/{} ({} bytes)", machine, version, model.len());
        Ok(())
    }

    pub fn get_version_info(&self, machine: &str, version: &str) -> Result<VersionInfo> {
        let path = EntityPath::version(machine, version);
        self.store.resolve(&path)?;
        self.version_info(&path)
    }

    /// Replace the extension payload of an unsealed version
    ///
    /// The seal flag is not writable through this call.
    pub fn set_version_info(&self, machine: &str, version: &str, payload: &[u8]) -> Result<()> {
        let path = EntityPath::version(machine, version);
        self.store.resolve(&path)?;

        let guard = self
            .locks
            .acquire(&self.store.lock_key(&path.collection()), self.hold())?;
        self.store.resolve(&path)?;

        let mut info = self.version_info(&path)?;
        SealGuard::ensure_unsealed(&info)?;
        info.payload = payload.to_vec();

        self.commit(
            &guard,
            Transaction::new(format!("Updated info of '{}' version of '{}' machine", version, machine))
                .write_fields(path, vec![(Field::Info, encode_info(&info)?)]),
        )
    }

    // ---------------------------------------------------------------------
    // Instances
    // ---------------------------------------------------------------------

    /// Create the next instance of a sealed version
    pub fn create_instance(&self, machine: &str, version: &str) -> Result<String> {
        let owner = EntityPath::version(machine, version);
        self.store.resolve(&owner)?;
        // Sealing is one-way, so the check holds once it passes
        SealGuard::ensure_sealed(&self.version_info(&owner)?)?;

        let instances = Collection::Children(owner.clone());
        let guard = self
            .locks
            .acquire(&self.store.lock_key(&instances), self.hold())?;
        self.store.resolve(&owner)?;

        let key = SequenceAllocator::allocate_next(&guard, self.store.as_ref(), &instances)?.to_string();
        let path = instances.member(&key)?;
        self.commit(
            &guard,
            Transaction::new(format!(
                "Added '{}' instance to '{}' version of '{}' machine",
                key, version, machine
            ))
            .create_entity(path, vec![(Field::Info, encode_info(&InstanceInfo::default())?)]),
        )?;

        info!("Created instance {}/{}/{}", machine, version, key);
        Ok(key)
    }

    /// Return `instance` if given and present, otherwise create a new one
    ///
    /// Lets a caller resume a known instance through the same path that
    /// creates fresh ones.
    pub fn ensure_instance(&self, machine: &str, version: &str, instance: Option<&str>) -> Result<String> {
        match instance {
            Some(key) => {
                self.store
                    .resolve(&EntityPath::instance(machine, version, key))?;
                debug!("Reusing instance {}/{}/{}", machine, version, key);
                Ok(key.to_string())
            }
            None => self.create_instance(machine, version),
        }
    }

    pub fn instance_keys(&self, machine: &str, version: &str) -> Result<Vec<String>> {
        self.store
            .keys(&Collection::Children(EntityPath::version(machine, version)))
    }

    pub fn instance_route(&self, machine: &str, version: &str, instance: &str) -> Result<String> {
        self.store
            .resolve(&EntityPath::instance(machine, version, instance))
    }

    pub fn get_instance_info(&self, machine: &str, version: &str, instance: &str) -> Result<InstanceInfo> {
        let path = EntityPath::instance(machine, version, instance);
        self.store.resolve(&path)?;
        decode_info(&self.store.read_field(&path, Field::Info)?)
    }

    pub fn set_instance_info(
        &self,
        machine: &str,
        version: &str,
        instance: &str,
        info: &InstanceInfo,
    ) -> Result<()> {
        let path = EntityPath::instance(machine, version, instance);
        self.store.resolve(&path)?;

        let guard = self
            .locks
            .acquire(&self.store.lock_key(&path.collection()), self.hold())?;
        self.store.resolve(&path)?;

        self.commit(
            &guard,
            Transaction::new(format!(
                "Updated info of '{}' instance of '{}' version of '{}' machine",
                instance, version, machine
            ))
            .write_fields(path, vec![(Field::Info, encode_info(info)?)]),
        )
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    /// Append a snapshot with caller-supplied info to an instance
    pub fn create_snapshot(&self, machine: &str, version: &str, instance: &str, info: &[u8]) -> Result<String> {
        let owner = EntityPath::instance(machine, version, instance);
        self.store.resolve(&owner)?;

        let snapshots = Collection::Children(owner.clone());
        let guard = self
            .locks
            .acquire(&self.store.lock_key(&snapshots), self.hold())?;
        self.store.resolve(&owner)?;

        let key = SequenceAllocator::allocate_next(&guard, self.store.as_ref(), &snapshots)?.to_string();
        let path = snapshots.member(&key)?;
        self.commit(
            &guard,
            Transaction::new(format!(
                "Added '{}' snapshot to '{}' instance of '{}' version of '{}' machine",
                key, instance, version, machine
            ))
            .create_entity(path, vec![(Field::Info, info.to_vec())]),
        )?;

        info!("Created snapshot {}/{}/{}/{}", machine, version, instance, key);
        Ok(key)
    }

    pub fn snapshot_keys(&self, machine: &str, version: &str, instance: &str) -> Result<Vec<String>> {
        self.store.keys(&Collection::Children(EntityPath::instance(
            machine, version, instance,
        )))
    }

    pub fn snapshot_route(
        &self,
        machine: &str,
        version: &str,
        instance: &str,
        snapshot: &str,
    ) -> Result<String> {
        self.store
            .resolve(&EntityPath::snapshot(machine, version, instance, snapshot))
    }

    pub fn get_snapshot_info(
        &self,
        machine: &str,
        version: &str,
        instance: &str,
        snapshot: &str,
    ) -> Result<Vec<u8>> {
        let path = EntityPath::snapshot(machine, version, instance, snapshot);
        self.store.resolve(&path)?;
        self.store.read_field(&path, Field::Info)
    }

    // ---------------------------------------------------------------------
    // Runtime hand-off
    // ---------------------------------------------------------------------

    /// Dispatch a run job, creating an instance unless one is given
    pub fn run_instance(
        &self,
        machine: &str,
        version: &str,
        instance: Option<&str>,
        snapshot: Option<&str>,
    ) -> Result<InstanceRef> {
        let dispatcher = self.dispatcher()?;
        let key = self.ensure_instance(machine, version, instance)?;
        if let Some(snapshot) = snapshot {
            self.store
                .resolve(&EntityPath::snapshot(machine, version, &key, snapshot))?;
        }

        let instance = InstanceRef::new(machine, version, key);
        dispatcher.dispatch(Job::Run {
            instance: instance.clone(),
            snapshot: snapshot.map(str::to_string),
        })?;

        info!("Dispatched run of {}", instance);
        Ok(instance)
    }

    pub fn stop_instance(&self, machine: &str, version: &str, instance: &str) -> Result<()> {
        let dispatcher = self.dispatcher()?;
        let instance = InstanceRef::new(machine, version, instance);
        self.store.resolve(&instance.path())?;

        info!("Dispatching stop of {}", instance);
        dispatcher.dispatch(Job::Stop { instance })
    }

    pub fn send_event(
        &self,
        machine: &str,
        version: &str,
        instance: &str,
        event: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let dispatcher = self.dispatcher()?;
        let instance = InstanceRef::new(machine, version, instance);
        self.store.resolve(&instance.path())?;

        debug!("Dispatching event '{}' to {}", event, instance);
        dispatcher.dispatch(Job::Event {
            instance,
            event: event.to_string(),
            data,
        })
    }

    // ---------------------------------------------------------------------
    // Repository-wide records
    // ---------------------------------------------------------------------

    /// Copy of the structural index, counters included
    pub fn manifest(&self) -> Result<Manifest> {
        self.store.load_manifest()
    }

    /// Repository flags
    pub fn config(&self) -> Result<RepositoryFlags> {
        self.store.load_flags()
    }

    pub fn set_config(&self, flags: RepositoryFlags) -> Result<()> {
        let guard = self
            .locks
            .acquire(&self.store.lock_key(&Collection::Machines), self.hold())?;
        self.commit(&guard, Transaction::new("Updated config").set_flags(flags))
    }

    /// Commit history, oldest first (commit-log backend only)
    pub fn history(&self) -> Result<Vec<CommitRecord>> {
        self.commit_log()?.history()
    }

    /// Verify checksums and the parent chain of the commit history
    pub fn verify_history(&self) -> Result<usize> {
        self.commit_log()?.verify_history()
    }

    fn commit_log(&self) -> Result<&Arc<CommitLogStore>> {
        self.commit_log
            .as_ref()
            .ok_or_else(|| RepoError::Config("history is only kept by the commit-log backend".to_string()))
    }
}

/// Builder for customizing Repository creation
///
/// # Examples
///
/// ```rust,no_run
/// use machine_vault::{LockConfig, RepositoryBuilder};
///
/// # fn main() -> machine_vault::Result<()> {
/// let repo = RepositoryBuilder::new()
///     .key_value()
///     .lock_config(LockConfig {
///         retry_count: 3,
///         ..LockConfig::default()
///     })
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RepositoryBuilder {
    backend: Option<BackendConfig>,
    kv_client: Option<Arc<dyn KvClient>>,
    replica: Option<Arc<dyn Replica>>,
    lock: LockConfig,
    base_model: String,
    validator: Option<Arc<dyn ModelValidator>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl RepositoryBuilder {
    pub fn new() -> Self {
        RepositoryBuilder {
            backend: None,
            kv_client: None,
            replica: None,
            lock: LockConfig::default(),
            base_model: DEFAULT_BASE_MODEL.to_string(),
            validator: None,
            dispatcher: None,
        }
    }

    /// Take backend, lock policy and base model from a configuration
    pub fn config(mut self, config: RepositoryConfig) -> Self {
        self.backend = Some(config.backend);
        self.lock = config.lock;
        self.base_model = config.base_model;
        self
    }

    /// Use the commit-log backend rooted at `path`
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        let remote = match self.backend.take() {
            Some(BackendConfig::CommitLog { remote, .. }) => remote,
            _ => None,
        };
        self.backend = Some(BackendConfig::CommitLog {
            path: path.into(),
            remote,
        });
        self
    }

    /// Mirror every commit into the directory `remote`
    pub fn remote<P: Into<PathBuf>>(mut self, remote: P) -> Self {
        let remote = Some(remote.into());
        self.backend = Some(match self.backend.take() {
            Some(BackendConfig::CommitLog { path, .. }) => BackendConfig::CommitLog { path, remote },
            _ => BackendConfig::CommitLog {
                path: PathBuf::new(),
                remote,
            },
        });
        self
    }

    /// Push commits to a custom replica instead of a directory
    pub fn replica(mut self, replica: Arc<dyn Replica>) -> Self {
        self.replica = Some(replica);
        self
    }

    /// Use the key-value backend (in-memory unless a client is given)
    pub fn key_value(mut self) -> Self {
        self.backend = Some(BackendConfig::KeyValue);
        self
    }

    /// Use the key-value backend over `client`
    pub fn kv_client(mut self, client: Arc<dyn KvClient>) -> Self {
        self.backend = Some(BackendConfig::KeyValue);
        self.kv_client = Some(client);
        self
    }

    pub fn lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Model given to `version1` of new machines
    pub fn base_model<S: Into<String>>(mut self, model: S) -> Self {
        self.base_model = model.into();
        self
    }

    /// Validator consulted when sealing (defaults to [`ScxmlRootValidator`])
    pub fn validator<V: ModelValidator + 'static>(mut self, validator: V) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Build the Repository, initializing commit-log storage on first use
    pub fn build(self) -> Result<Repository> {
        let backend = self
            .backend
            .ok_or_else(|| RepoError::Config("no backend selected".to_string()))?;

        let config = RepositoryConfig {
            base_model: self.base_model,
            backend,
            lock: self.lock,
        };
        config.validate()?;

        let (store, commit_log): (Arc<dyn EntityStore>, Option<Arc<CommitLogStore>>) = match &config.backend {
            BackendConfig::CommitLog { path, remote } => {
                let replica = match (self.replica, remote) {
                    (Some(replica), _) => Some(replica),
                    (None, Some(remote)) => Some(Arc::new(DirectoryReplica::new(remote)) as Arc<dyn Replica>),
                    (None, None) => None,
                };
                let store = Arc::new(CommitLogStore::open_or_init(path, replica)?);
                (store.clone() as Arc<dyn EntityStore>, Some(store))
            }
            BackendConfig::KeyValue => {
                if self.replica.is_some() {
                    return Err(RepoError::Config(
                        "replicas are only supported by the commit-log backend".to_string(),
                    ));
                }
                let client = self
                    .kv_client
                    .unwrap_or_else(|| Arc::new(MemoryKv::new()) as Arc<dyn KvClient>);
                (Arc::new(KvStore::new(client)) as Arc<dyn EntityStore>, None)
            }
        };

        let seal = match self.validator {
            Some(validator) => SealGuard::new(validator),
            None => SealGuard::default(),
        };

        info!("Opened {} repository", store.backend_name());
        Ok(Repository {
            locks: LockCoordinator::new(store.lock_backend(), config.lock),
            store,
            commit_log,
            seal,
            dispatcher: self.dispatcher,
            base_model: config.base_model.into_bytes(),
        })
    }
}

impl Default for RepositoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
