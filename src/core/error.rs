use std::fmt;
use thiserror::Error;

/// Kind of entity referenced by a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Machine,
    Version,
    Instance,
    Snapshot,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Machine => "machine",
            EntityKind::Version => "version",
            EntityKind::Instance => "instance",
            EntityKind::Snapshot => "snapshot",
        };
        f.write_str(name)
    }
}

/// Seal precondition that was violated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateViolation {
    /// The version was sealed before this call
    AlreadySealed,
    /// A payload mutation targeted a sealed version
    VersionSealed,
    /// An instance was requested under an unsealed version
    VersionNotSealed,
    /// A new version was requested while the latest one is unsealed
    PreviousVersionNotSealed,
}

impl fmt::Display for StateViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            StateViolation::AlreadySealed => "version is already sealed",
            StateViolation::VersionSealed => "version is sealed and cannot be changed",
            StateViolation::VersionNotSealed => "version is not sealed yet",
            StateViolation::PreviousVersionNotSealed => "the last version is not sealed yet",
        };
        f.write_str(msg)
    }
}

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("{kind} does not exist: {path}")]
    NotFound { kind: EntityKind, path: String },

    #[error("Machine already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid state: {0}")]
    InvalidState(StateViolation),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// `attempts` is 0 when the lock was taken but expired before the commit
    #[error("Lock '{key}' timed out after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Replication of commit {commit} failed: {reason} (local commit kept)")]
    ReplicationFailed { commit: String, reason: String },

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RepoError {
    pub(crate) fn not_found(kind: EntityKind, path: impl Into<String>) -> Self {
        RepoError::NotFound {
            kind,
            path: path.into(),
        }
    }

    /// True when the durable write underneath the operation failed
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            RepoError::StorageFailure(_) | RepoError::Io(_) | RepoError::Serialization(_)
        )
    }

    /// True when the error was raised after the local commit succeeded
    ///
    /// Only replication failures fall in this category: the structural change
    /// is visible locally even though the call returned an error.
    pub fn is_committed_locally(&self) -> bool {
        matches!(self, RepoError::ReplicationFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, RepoError>;
