//! Durable entity storage
//!
//! [`EntityStore`] is the one storage capability the repository façade talks
//! to. Two strategies implement it:
//!
//! - [`CommitLogStore`]: entity fields are files in a tree mirroring the
//!   hierarchy; every [`Transaction`] is applied and then appended to a commit
//!   log as one commit with a human-readable message.
//! - [`KvStore`]: entity fields are hash records keyed by the entity path;
//!   collections are sets / sorted sets; every [`Transaction`] is sent as one
//!   atomic batch.
//!
//! Both expose the structural index through the same calls (`resolve`,
//! `keys`, `collection_len`, `load_manifest`), so the façade does not know
//! which one is active.

pub mod commit_log;
pub mod kv;

pub use commit_log::{CommitLogStore, CommitRecord, DirectoryReplica, Replica};
pub use kv::{KvClient, KvCommand, KvStore, MemoryKv};

use crate::config::RepositoryFlags;
use crate::entity::{Collection, EntityPath, Field};
use crate::error::Result;
use crate::lock::LockBackend;
use crate::manifest::Manifest;
use std::sync::Arc;

/// One staged change inside a [`Transaction`]
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Create a new entity with its initial fields and register it in its
    /// parent collection
    CreateEntity {
        path: EntityPath,
        fields: Vec<(Field, Vec<u8>)>,
    },
    /// Overwrite fields of an existing entity
    WriteFields {
        path: EntityPath,
        fields: Vec<(Field, Vec<u8>)>,
    },
    /// Remove an entity and every descendant listed in `removed`
    /// (the entity itself included)
    DeleteSubtree {
        path: EntityPath,
        removed: Vec<EntityPath>,
    },
    /// Replace the repository flags record
    SetFlags(RepositoryFlags),
}

/// A set of changes applied as one durable unit
///
/// Stores keep their structural index in step with the operations: created
/// entities are registered in their parent collection, deleted subtrees are
/// dropped from it, in the same unit as the field writes.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    message: String,
    operations: Vec<Operation>,
}

impl Transaction {
    pub fn new(message: impl Into<String>) -> Self {
        Transaction {
            message: message.into(),
            operations: Vec::new(),
        }
    }

    pub fn create_entity(mut self, path: EntityPath, fields: Vec<(Field, Vec<u8>)>) -> Self {
        self.operations.push(Operation::CreateEntity { path, fields });
        self
    }

    pub fn write_fields(mut self, path: EntityPath, fields: Vec<(Field, Vec<u8>)>) -> Self {
        self.operations.push(Operation::WriteFields { path, fields });
        self
    }

    pub fn delete_subtree(mut self, path: EntityPath, removed: Vec<EntityPath>) -> Self {
        self.operations
            .push(Operation::DeleteSubtree { path, removed });
        self
    }

    pub fn set_flags(mut self, flags: RepositoryFlags) -> Self {
        self.operations.push(Operation::SetFlags(flags));
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }
}

/// Durable storage of entity fields plus the structural index
pub trait EntityStore: Send + Sync {
    /// Short backend name used in logs
    fn backend_name(&self) -> &'static str;

    /// Lock storage matching this store's sharing model
    fn lock_backend(&self) -> Arc<dyn LockBackend>;

    /// Advisory lock protecting mutations of `collection`
    fn lock_key(&self, collection: &Collection) -> String;

    /// Storage route recorded in the manifest for `path`
    fn route_for(&self, path: &EntityPath) -> String;

    /// Materialize the full structural index
    fn load_manifest(&self) -> Result<Manifest>;

    /// Route of an existing entity, or `NotFound` for the first missing
    /// ancestor
    fn resolve(&self, path: &EntityPath) -> Result<String>;

    /// Member keys of a collection in creation order
    fn keys(&self, collection: &Collection) -> Result<Vec<String>>;

    /// Current number of members of a collection
    fn collection_len(&self, collection: &Collection) -> Result<usize>;

    fn read_field(&self, path: &EntityPath, field: Field) -> Result<Vec<u8>>;

    fn load_flags(&self) -> Result<RepositoryFlags>;

    /// Apply every operation of `txn` as one unit
    fn commit(&self, txn: Transaction) -> Result<()>;
}
