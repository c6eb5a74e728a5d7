//! Remote synchronization of the commit log
//!
//! After a commit lands locally, its changed files, removed paths and record
//! are pushed to a [`Replica`]. The local commit is authoritative: a failed
//! push is reported, never rolled back.

use super::journal::{CommitRecord, Journal};
use super::write_atomic;
use crate::error::Result;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Destination receiving every local commit
pub trait Replica: Send + Sync {
    /// Human-readable location used in logs
    fn describe(&self) -> String;

    /// Apply one commit. `files` holds the new content of every staged path.
    fn replicate(&self, record: &CommitRecord, files: &[(String, Vec<u8>)]) -> Result<()>;
}

/// Mirror of the repository tree in another directory
#[derive(Debug, Clone)]
pub struct DirectoryReplica {
    root: PathBuf,
}

impl DirectoryReplica {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        DirectoryReplica {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Replica for DirectoryReplica {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn replicate(&self, record: &CommitRecord, files: &[(String, Vec<u8>)]) -> Result<()> {
        for (rel, bytes) in files {
            write_atomic(&self.root.join(rel), bytes)?;
        }

        for rel in &record.removed {
            match fs::remove_file(self.root.join(rel)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let history = self.root.join(super::HISTORY_DIR);
        fs::create_dir_all(&history)?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(history.join(Journal::FILE_NAME))?;
        log.write_all(&line)?;
        log.sync_all()?;

        Ok(())
    }
}
