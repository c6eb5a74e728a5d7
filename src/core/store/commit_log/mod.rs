//! File-tree entity store with a commit log
//!
//! ```text
//! <root>/
//! ├── manifest.json
//! ├── config.json
//! ├── machines/<m>/versions/<v>/{model.scxml,info.json}
//! │                  └── instances/<i>/info.json
//! │                        └── snapshots/<s>/info.json
//! └── .history/
//!     ├── commits.log        one JSON commit record per line
//!     └── locks/             advisory lock files
//! ```
//!
//! A commit writes entity files first, then `manifest.json`, then appends
//! the commit record. If any step up to the append fails, every written file
//! is restored. Removed subtrees are deleted only after the append, so a
//! crash can orphan storage but never leave the manifest pointing at missing
//! entities. Every file is replaced via temp file and rename.

mod journal;
mod replica;

pub use journal::{CommitRecord, Journal};
pub use replica::{DirectoryReplica, Replica};

use super::{EntityStore, Operation, Transaction};
use crate::config::RepositoryFlags;
use crate::entity::{Collection, EntityPath, Field};
use crate::error::{EntityKind, RepoError, Result};
use crate::lock::{FileLockBackend, LockBackend};
use crate::manifest::Manifest;
use parking_lot::Mutex;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Directory holding the commit log and lock files
pub const HISTORY_DIR: &str = ".history";

/// The single lock every commit-log mutation takes
pub const REPOSITORY_LOCK: &str = "lock:repository";

const LOCKS_DIR: &str = "locks";
const MACHINES_DIR: &str = "machines";

enum Undo {
    Restore {
        path: PathBuf,
        previous: Option<Vec<u8>>,
    },
    RemoveDir(PathBuf),
}

/// Entity store backed by a directory tree and an append-only commit log
pub struct CommitLogStore {
    root: PathBuf,
    journal: Journal,
    locks: Arc<FileLockBackend>,
    replica: Option<Arc<dyn Replica>>,
    commit_lock: Mutex<()>,
}

impl CommitLogStore {
    /// Open the repository at `root`, initializing it on first use
    ///
    /// If initialization fails partway, everything it created is removed
    /// again before the error is returned.
    pub fn open_or_init<P: AsRef<Path>>(root: P, replica: Option<Arc<dyn Replica>>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let journal_path = root.join(HISTORY_DIR).join(Journal::FILE_NAME);

        if journal_path.exists() {
            info!("Opening repository at {:?}", root);
            return Self::assemble(root, replica);
        }

        info!("Initializing repository at {:?}", root);
        let root_existed = root.exists();
        let entries = [Manifest::FILE_NAME, RepositoryFlags::FILE_NAME, MACHINES_DIR, HISTORY_DIR];
        let preexisting: Vec<bool> = entries.iter().map(|e| root.join(e).exists()).collect();

        let record = match Self::initialize(&root) {
            Ok(record) => record,
            Err(e) => {
                warn!("Initialization of {:?} failed, discarding it: {}", root, e);
                if root_existed {
                    for (entry, existed) in entries.iter().zip(preexisting) {
                        if !existed {
                            remove_any(&root.join(entry));
                        }
                    }
                } else {
                    remove_any(&root);
                }
                return Err(e);
            }
        };

        let store = Self::assemble(root, replica)?;
        store.replicate(&record)?;
        Ok(store)
    }

    fn initialize(root: &Path) -> Result<CommitRecord> {
        fs::create_dir_all(root.join(MACHINES_DIR))?;
        write_atomic(&root.join(Manifest::FILE_NAME), &serde_json::to_vec_pretty(&Manifest::new())?)?;
        write_atomic(
            &root.join(RepositoryFlags::FILE_NAME),
            &serde_json::to_vec_pretty(&RepositoryFlags::default())?,
        )?;
        fs::create_dir_all(root.join(HISTORY_DIR).join(LOCKS_DIR))?;

        let journal = Journal::open(root.join(HISTORY_DIR).join(Journal::FILE_NAME))?;
        journal.append(
            "Initialized repository",
            vec![Manifest::FILE_NAME.to_string(), RepositoryFlags::FILE_NAME.to_string()],
            Vec::new(),
        )
    }

    fn assemble(root: PathBuf, replica: Option<Arc<dyn Replica>>) -> Result<Self> {
        let journal = Journal::open(root.join(HISTORY_DIR).join(Journal::FILE_NAME))?;
        let locks = Arc::new(FileLockBackend::new(root.join(HISTORY_DIR).join(LOCKS_DIR)));
        Ok(CommitLogStore {
            root,
            journal,
            locks,
            replica,
            commit_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Id of the latest commit
    pub fn head(&self) -> Option<String> {
        self.journal.head()
    }

    /// Every commit, oldest first
    pub fn history(&self) -> Result<Vec<CommitRecord>> {
        self.journal.records()
    }

    /// Check checksums and the parent chain; returns the number of commits
    pub fn verify_history(&self) -> Result<usize> {
        self.journal.verify()
    }

    fn stage(&self, rel: &str, bytes: &[u8], undo: &mut Vec<Undo>) -> Result<()> {
        let path = self.root.join(rel);
        let previous = match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        undo.push(Undo::Restore {
            path: path.clone(),
            previous,
        });
        write_atomic(&path, bytes)
    }

    /// Paths of every file below the subtrees `txn` deletes
    fn removed_files(&self, txn: &Transaction) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for op in txn.operations() {
            if let Operation::DeleteSubtree { path, .. } = op {
                let route = path.route();
                collect_files(&self.root.join(&route), &route, &mut removed)?;
            }
        }
        Ok(removed)
    }

    /// Delete the subtrees of a committed `txn`
    ///
    /// The manifest no longer lists them, so a failure only orphans files.
    fn delete_subtrees(&self, txn: &Transaction) {
        for op in txn.operations() {
            if let Operation::DeleteSubtree { path, .. } = op {
                let dir = self.root.join(path.route());
                if let Err(e) = fs::remove_dir_all(&dir) {
                    if e.kind() != ErrorKind::NotFound {
                        warn!("Could not delete {:?}, leaving orphaned files: {}", dir, e);
                    }
                }
            }
        }
    }

    fn apply_writes(
        &self,
        txn: &Transaction,
        manifest: Option<&Manifest>,
        staged: &mut Vec<String>,
        undo: &mut Vec<Undo>,
    ) -> Result<()> {
        for op in txn.operations() {
            match op {
                Operation::CreateEntity { path, fields } | Operation::WriteFields { path, fields } => {
                    if matches!(op, Operation::CreateEntity { .. }) {
                        let dir = self.root.join(path.route());
                        if !dir.exists() {
                            fs::create_dir_all(&dir)?;
                            undo.push(Undo::RemoveDir(dir));
                        }
                    }
                    for (field, bytes) in fields {
                        let rel = format!("{}/{}", path.route(), field.file_name());
                        self.stage(&rel, bytes, undo)?;
                        staged.push(rel);
                    }
                }
                Operation::SetFlags(flags) => {
                    self.stage(RepositoryFlags::FILE_NAME, &serde_json::to_vec_pretty(flags)?, undo)?;
                    staged.push(RepositoryFlags::FILE_NAME.to_string());
                }
                Operation::DeleteSubtree { .. } => {}
            }
        }

        if let Some(manifest) = manifest {
            self.stage(Manifest::FILE_NAME, &serde_json::to_vec_pretty(manifest)?, undo)?;
            staged.push(Manifest::FILE_NAME.to_string());
        }

        Ok(())
    }

    fn rollback(&self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            let outcome = match &step {
                Undo::Restore {
                    path,
                    previous: Some(bytes),
                } => write_atomic(path, bytes),
                Undo::Restore { path, previous: None } => match fs::remove_file(path) {
                    Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                    _ => Ok(()),
                },
                Undo::RemoveDir(dir) => fs::remove_dir_all(dir).map_err(RepoError::from),
            };
            if let Err(e) = outcome {
                warn!("Rollback step failed: {}", e);
            }
        }
    }

    /// Manifest after the structural operations of `txn`, if any
    fn updated_manifest(&self, txn: &Transaction) -> Result<Option<Manifest>> {
        let structural = txn.operations().iter().any(|op| {
            matches!(
                op,
                Operation::CreateEntity { .. } | Operation::DeleteSubtree { .. }
            )
        });
        if !structural {
            return Ok(None);
        }

        let mut manifest = self.load_manifest()?;
        for op in txn.operations() {
            match op {
                Operation::CreateEntity { path, .. } => manifest.insert(path, self.route_for(path))?,
                Operation::DeleteSubtree { path, .. } => {
                    if path.kind() != EntityKind::Machine {
                        return Err(RepoError::StorageFailure(format!(
                            "only machine subtrees can be deleted, not {}",
                            path
                        )));
                    }
                    manifest.remove_machine(path.machine_name())?;
                }
                _ => {}
            }
        }
        Ok(Some(manifest))
    }

    fn replicate(&self, record: &CommitRecord) -> Result<()> {
        let Some(replica) = &self.replica else {
            return Ok(());
        };

        let mut files = Vec::with_capacity(record.staged.len());
        for rel in &record.staged {
            match fs::read(self.root.join(rel)) {
                Ok(bytes) => files.push((rel.clone(), bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        replica.replicate(record, &files).map_err(|e| {
            warn!(
                "Replication of commit {} to {} failed: {}",
                record.id,
                replica.describe(),
                e
            );
            RepoError::ReplicationFailed {
                commit: record.id.clone(),
                reason: e.to_string(),
            }
        })
    }
}

impl EntityStore for CommitLogStore {
    fn backend_name(&self) -> &'static str {
        "commit-log"
    }

    fn lock_backend(&self) -> Arc<dyn LockBackend> {
        self.locks.clone()
    }

    fn lock_key(&self, _collection: &Collection) -> String {
        REPOSITORY_LOCK.to_string()
    }

    fn route_for(&self, path: &EntityPath) -> String {
        path.route()
    }

    fn load_manifest(&self) -> Result<Manifest> {
        let bytes = fs::read(self.root.join(Manifest::FILE_NAME))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn resolve(&self, path: &EntityPath) -> Result<String> {
        Ok(self.load_manifest()?.route(path)?.to_string())
    }

    fn keys(&self, collection: &Collection) -> Result<Vec<String>> {
        self.load_manifest()?.keys(collection)
    }

    fn collection_len(&self, collection: &Collection) -> Result<usize> {
        self.load_manifest()?.len_of(collection)
    }

    fn read_field(&self, path: &EntityPath, field: Field) -> Result<Vec<u8>> {
        let file = self.root.join(path.route()).join(field.file_name());
        debug!("Reading {:?}", file);
        match fs::read(&file) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(RepoError::not_found(path.kind(), path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn load_flags(&self) -> Result<RepositoryFlags> {
        match fs::read(self.root.join(RepositoryFlags::FILE_NAME)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(RepositoryFlags::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn commit(&self, txn: Transaction) -> Result<()> {
        let _serial = self.commit_lock.lock();
        let manifest = self.updated_manifest(&txn)?;

        let mut staged = Vec::new();
        let mut undo = Vec::new();
        let removed = match self
            .apply_writes(&txn, manifest.as_ref(), &mut staged, &mut undo)
            .and_then(|()| self.removed_files(&txn))
        {
            Ok(removed) => removed,
            Err(e) => {
                self.rollback(undo);
                return Err(e);
            }
        };

        let record = match self.journal.append(txn.message(), staged, removed) {
            Ok(record) => record,
            Err(e) => {
                warn!("Appending commit '{}' failed, rolling back: {}", txn.message(), e);
                self.rollback(undo);
                return Err(e);
            }
        };

        self.delete_subtrees(&txn);

        info!(
            "Committed {} '{}' ({} staged, {} removed)",
            &record.id[..12],
            record.message,
            record.staged.len(),
            record.removed.len()
        );
        self.replicate(&record)
    }
}

/// Replace `path` with `bytes` via a temp file and rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| RepoError::StorageFailure(format!("{:?} has no parent directory", path)))?;
    fs::create_dir_all(parent)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.tmp-{:08x}", name, rand::random::<u32>()));

    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn collect_files(dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut names: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
        .collect();
    names.sort();

    for (name, path) in names {
        let child = format!("{}/{}", rel, name);
        if path.is_dir() {
            collect_files(&path, &child, out)?;
        } else {
            out.push(child);
        }
    }
    Ok(())
}

fn remove_any(path: &Path) {
    let outcome = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = outcome {
        if e.kind() != ErrorKind::NotFound {
            warn!("Could not remove {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn machine_txn(name: &str) -> Transaction {
        Transaction::new(format!("Added '{}' machine", name))
            .create_entity(EntityPath::machine(name), Vec::new())
            .create_entity(
                EntityPath::version(name, "version1"),
                vec![
                    (Field::Model, b"<scxml/>".to_vec()),
                    (Field::Info, br#"{"isSealed": false}"#.to_vec()),
                ],
            )
    }

    #[test]
    fn test_init_layout() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("repo");
        let store = CommitLogStore::open_or_init(&root, None).unwrap();

        assert!(root.join(Manifest::FILE_NAME).is_file());
        assert!(root.join(RepositoryFlags::FILE_NAME).is_file());
        assert!(root.join(HISTORY_DIR).join(Journal::FILE_NAME).is_file());
        assert_eq!(store.history().unwrap().len(), 1);
        assert_eq!(store.load_manifest().unwrap(), Manifest::new());
        assert!(!store.load_flags().unwrap().simulation);

        // Reopening does not add another init commit
        let reopened = CommitLogStore::open_or_init(&root, None).unwrap();
        assert_eq!(reopened.history().unwrap().len(), 1);
    }

    #[test]
    fn test_commit_writes_files_and_log() {
        let dir = TempDir::new().unwrap();
        let store = CommitLogStore::open_or_init(dir.path(), None).unwrap();
        store.commit(machine_txn("door")).unwrap();

        let version = EntityPath::version("door", "version1");
        assert_eq!(store.read_field(&version, Field::Model).unwrap(), b"<scxml/>");
        assert_eq!(store.resolve(&version).unwrap(), "machines/door/versions/version1");
        assert_eq!(
            store.collection_len(&EntityPath::machine("door").children().unwrap()).unwrap(),
            1
        );

        let history = store.history().unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.message, "Added 'door' machine");
        assert!(last
            .staged
            .contains(&"machines/door/versions/version1/model.scxml".to_string()));
        assert!(last.staged.contains(&Manifest::FILE_NAME.to_string()));
        assert_eq!(store.verify_history().unwrap(), 2);
    }

    #[test]
    fn test_delete_subtree_records_removed_files() {
        let dir = TempDir::new().unwrap();
        let store = CommitLogStore::open_or_init(dir.path(), None).unwrap();
        store.commit(machine_txn("door")).unwrap();

        let removed_paths = store.load_manifest().unwrap().subtree("door").unwrap();
        store
            .commit(
                Transaction::new("Removed 'door' machine")
                    .delete_subtree(EntityPath::machine("door"), removed_paths),
            )
            .unwrap();

        assert!(!store.load_manifest().unwrap().contains(&EntityPath::machine("door")));

        assert!(!dir.path().join("machines/door").exists());
        let last = store.history().unwrap().pop().unwrap();
        assert_eq!(
            last.removed,
            vec![
                "machines/door/versions/version1/info.json".to_string(),
                "machines/door/versions/version1/model.scxml".to_string(),
            ]
        );
        assert!(matches!(
            store.read_field(&EntityPath::version("door", "version1"), Field::Info),
            Err(RepoError::NotFound { .. })
        ));
    }

    /// Swap the commit log for a directory so every append fails
    fn break_journal(root: &Path) -> Vec<u8> {
        let log = root.join(HISTORY_DIR).join(Journal::FILE_NAME);
        let saved = fs::read(&log).unwrap();
        fs::remove_file(&log).unwrap();
        fs::create_dir(&log).unwrap();
        saved
    }

    fn restore_journal(root: &Path, saved: &[u8]) {
        let log = root.join(HISTORY_DIR).join(Journal::FILE_NAME);
        fs::remove_dir(&log).unwrap();
        fs::write(&log, saved).unwrap();
    }

    #[test]
    fn test_failed_append_rolls_back_every_write() {
        let dir = TempDir::new().unwrap();
        let store = CommitLogStore::open_or_init(dir.path(), None).unwrap();
        store.commit(machine_txn("door")).unwrap();
        let manifest = store.load_manifest().unwrap();
        let version = EntityPath::version("door", "version1");

        let saved = break_journal(dir.path());

        let edit = Transaction::new("Updated model")
            .write_fields(version.clone(), vec![(Field::Model, b"<changed/>".to_vec())]);
        assert!(store.commit(edit).is_err());
        assert_eq!(store.read_field(&version, Field::Model).unwrap(), b"<scxml/>");

        let flags = RepositoryFlags {
            simulation: true,
            ..RepositoryFlags::default()
        };
        assert!(store.commit(Transaction::new("Updated config").set_flags(flags)).is_err());
        assert!(!store.load_flags().unwrap().simulation);

        assert!(store.commit(machine_txn("gate")).is_err());
        assert!(!dir.path().join("machines/gate").exists());

        let removal = Transaction::new("Removed 'door' machine")
            .delete_subtree(EntityPath::machine("door"), manifest.subtree("door").unwrap());
        assert!(store.commit(removal).is_err());
        assert!(dir.path().join("machines/door/versions/version1/model.scxml").is_file());

        assert_eq!(store.load_manifest().unwrap(), manifest);

        restore_journal(dir.path(), &saved);
        store.commit(machine_txn("gate")).unwrap();
        assert_eq!(store.verify_history().unwrap(), 3);
    }

    #[test]
    fn test_failed_init_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        // A plain file where the history directory should go
        fs::write(dir.path().join(HISTORY_DIR), b"in the way").unwrap();

        assert!(CommitLogStore::open_or_init(dir.path(), None).is_err());
        assert!(!dir.path().join(Manifest::FILE_NAME).exists());
        assert!(!dir.path().join(MACHINES_DIR).exists());
        // Pre-existing content is left alone
        assert!(dir.path().join(HISTORY_DIR).is_file());
    }

    #[test]
    fn test_init_under_plain_file_fails() {
        let dir = TempDir::new().unwrap();
        let file_parent = dir.path().join("plain");
        fs::write(&file_parent, b"x").unwrap();

        assert!(CommitLogStore::open_or_init(file_parent.join("repo"), None).is_err());
        assert_eq!(fs::read(&file_parent).unwrap(), b"x");
    }

    #[test]
    fn test_directory_replica_mirrors_commits() {
        let dir = TempDir::new().unwrap();
        let mirror = dir.path().join("mirror");
        let replica: Arc<dyn Replica> = Arc::new(DirectoryReplica::new(&mirror));
        let store = CommitLogStore::open_or_init(dir.path().join("repo"), Some(replica)).unwrap();

        store.commit(machine_txn("door")).unwrap();

        assert_eq!(
            fs::read(mirror.join("machines/door/versions/version1/model.scxml")).unwrap(),
            b"<scxml/>"
        );
        let mirrored = Journal::open(mirror.join(HISTORY_DIR).join(Journal::FILE_NAME)).unwrap();
        assert_eq!(mirrored.records().unwrap(), store.history().unwrap());
    }

    struct Unreachable;

    impl Replica for Unreachable {
        fn describe(&self) -> String {
            "unreachable".to_string()
        }

        fn replicate(&self, _record: &CommitRecord, _files: &[(String, Vec<u8>)]) -> Result<()> {
            Err(RepoError::StorageFailure("connection refused".to_string()))
        }
    }

    #[test]
    fn test_replication_failure_keeps_local_commit() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("repo");
        // Initialize locally first so only the second commit hits the replica
        drop(CommitLogStore::open_or_init(&root, None).unwrap());
        let store = CommitLogStore::open_or_init(&root, Some(Arc::new(Unreachable))).unwrap();

        let err = store.commit(machine_txn("door")).unwrap_err();

        assert!(err.is_committed_locally());
        assert!(store.load_manifest().unwrap().contains(&EntityPath::machine("door")));
        assert_eq!(store.history().unwrap().len(), 2);
    }
}
