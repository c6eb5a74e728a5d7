//! Dense sequence allocation
//!
//! Version, instance and snapshot keys are `<prefix><n>` with `n` running
//! 1, 2, 3... per parent without gaps. The next key is derived from the
//! collection's current size, so it is only correct while the caller holds
//! the collection's lock and commits the new member before releasing it.
//! [`SequenceAllocator::allocate_next`] takes the [`LockGuard`] as proof.

use crate::entity::Collection;
use crate::error::{RepoError, Result};
use crate::lock::LockGuard;
use crate::store::EntityStore;
use crate::validation::SequenceName;
use tracing::debug;

/// Allocates the next key of a sequence-named collection
pub struct SequenceAllocator;

impl SequenceAllocator {
    /// Next free key of `collection`
    ///
    /// Fails with `StorageFailure` if `guard` does not cover the lock the
    /// store assigns to `collection`, or if the collection holds machines.
    pub fn allocate_next(
        guard: &LockGuard<'_>,
        store: &dyn EntityStore,
        collection: &Collection,
    ) -> Result<SequenceName> {
        let prefix = collection.prefix().ok_or_else(|| {
            RepoError::StorageFailure("machines are named by the caller".to_string())
        })?;

        let lock_key = store.lock_key(collection);
        if !guard.covers(&lock_key) {
            return Err(RepoError::StorageFailure(format!(
                "allocation in {} requires holding {}",
                collection, lock_key
            )));
        }

        let len = store.collection_len(collection)?;
        let name = SequenceName::new(prefix, len as u64 + 1);
        debug!("Allocated {} in {}", name, collection);
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::entity::{EntityPath, Field};
    use crate::lock::LockCoordinator;
    use crate::store::{KvStore, Transaction};
    use std::time::Duration;

    fn store_with_machine() -> KvStore {
        let store = KvStore::in_memory();
        store
            .commit(
                Transaction::new("Added 'm' machine")
                    .create_entity(EntityPath::machine("m"), Vec::new())
                    .create_entity(
                        EntityPath::version("m", "version1"),
                        vec![(Field::Model, b"<scxml/>".to_vec())],
                    ),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_allocates_after_current_members() {
        let store = store_with_machine();
        let locks = LockCoordinator::new(store.lock_backend(), LockConfig::default());
        let versions = EntityPath::machine("m").children().unwrap();

        let guard = locks
            .acquire(&store.lock_key(&versions), Duration::from_secs(5))
            .unwrap();
        let next = SequenceAllocator::allocate_next(&guard, &store, &versions).unwrap();
        assert_eq!(next.to_string(), "version2");

        let instances = EntityPath::version("m", "version1").children().unwrap();
        let guard = locks
            .acquire(&store.lock_key(&instances), Duration::from_secs(5))
            .unwrap();
        let first = SequenceAllocator::allocate_next(&guard, &store, &instances).unwrap();
        assert_eq!(first.to_string(), "instance1");
    }

    #[test]
    fn test_requires_matching_lock() {
        let store = store_with_machine();
        let locks = LockCoordinator::new(store.lock_backend(), LockConfig::default());
        let versions = EntityPath::machine("m").children().unwrap();

        let unrelated = locks.acquire("lock:other", Duration::from_secs(5)).unwrap();
        assert!(matches!(
            SequenceAllocator::allocate_next(&unrelated, &store, &versions),
            Err(RepoError::StorageFailure(_))
        ));
    }

    #[test]
    fn test_rejects_machine_collection() {
        let store = store_with_machine();
        let locks = LockCoordinator::new(store.lock_backend(), LockConfig::default());
        let guard = locks
            .acquire(&Collection::Machines.lock_key(), Duration::from_secs(5))
            .unwrap();
        assert!(SequenceAllocator::allocate_next(&guard, &store, &Collection::Machines).is_err());
    }

    #[test]
    fn test_missing_parent_is_not_found() {
        let store = store_with_machine();
        let locks = LockCoordinator::new(store.lock_backend(), LockConfig::default());
        let snapshots = EntityPath::instance("m", "version1", "instance7")
            .children()
            .unwrap();
        let guard = locks
            .acquire(&store.lock_key(&snapshots), Duration::from_secs(5))
            .unwrap();
        assert!(matches!(
            SequenceAllocator::allocate_next(&guard, &store, &snapshots),
            Err(RepoError::NotFound { .. })
        ));
    }
}
