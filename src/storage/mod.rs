//! # Storage Layer
//!
//! Record-oriented storages over the shared page model. Two
//! organizations are implemented end to end:
//!
//! - [`array`]: dense fixed-size records addressed by offset, the full
//!   OCC read/write contract.
//! - [`sequential`]: append-only records with lock-free writes.
//!
//! `StorageType` is a plain enum and every polymorphic entry point (the
//! record operations here, the composers in [`composer`]) dispatches
//! with an exhaustive `match`. Adding an organization means adding a
//! variant and every arm the compiler then demands.

pub mod array;
pub mod composer;
pub mod page;
pub mod sequential;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CodeResult, ErrorCode};
use crate::log::record::ParsedFrame;
use crate::memory::PagePool;
use crate::snapshot::writer::SnapshotPageCache;
use crate::storage::array::ArrayStorage;
use crate::storage::page::{SnapshotPagePointer, StorageId};
use crate::storage::sequential::SequentialStorage;
use crate::xct::xct_id::XctId;

/// Which NUMA node a worker thread belongs to.
pub fn node_of_thread(thread_id: u16, nodes: u16) -> u16 {
    thread_id % nodes.max(1)
}

/// Storage organization discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    Array,
    Sequential,
}

/// Everything needed to re-open a storage from a snapshot manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageMetadata {
    pub id: StorageId,
    pub name: String,
    pub storage_type: StorageType,
    /// Array only.
    pub payload_size: u32,
    /// Array only.
    pub array_size: u64,
    pub root_snapshot_pointer: SnapshotPagePointer,
}

/// A storage instance. No trait objects; callers `match`.
#[derive(Debug)]
pub enum Storage {
    Array(ArrayStorage),
    Sequential(SequentialStorage),
}

impl Storage {
    pub fn id(&self) -> StorageId {
        match self {
            Storage::Array(array) => array.id(),
            Storage::Sequential(sequential) => sequential.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Storage::Array(array) => array.name(),
            Storage::Sequential(sequential) => sequential.name(),
        }
    }

    pub fn storage_type(&self) -> StorageType {
        match self {
            Storage::Array(_) => StorageType::Array,
            Storage::Sequential(_) => StorageType::Sequential,
        }
    }

    pub fn metadata(&self) -> StorageMetadata {
        match self {
            Storage::Array(array) => array.metadata(),
            Storage::Sequential(sequential) => sequential.metadata(),
        }
    }

    pub fn as_array(&self) -> CodeResult<&ArrayStorage> {
        match self {
            Storage::Array(array) => Ok(array),
            Storage::Sequential(_) => Err(ErrorCode::StorageNotFound),
        }
    }

    pub fn as_sequential(&self) -> CodeResult<&SequentialStorage> {
        match self {
            Storage::Sequential(sequential) => Ok(sequential),
            Storage::Array(_) => Err(ErrorCode::StorageNotFound),
        }
    }

    /// Routes a log record to its snapshot partition.
    pub fn partition_of_frame(
        &self,
        frame: &ParsedFrame,
        source_thread: u16,
        partitions: u16,
    ) -> u16 {
        match self {
            Storage::Array(array) => array.partition_of_offset(frame.header.offset, partitions),
            Storage::Sequential(_) => node_of_thread(source_thread, partitions),
        }
    }

    pub(crate) fn install_root_snapshot(&self, pointer: SnapshotPagePointer) {
        match self {
            Storage::Array(array) => array.install_root_snapshot(pointer),
            Storage::Sequential(sequential) => sequential.install_root_snapshot(pointer),
        }
    }

    pub(crate) fn release_all_volatile(&self) {
        match self {
            Storage::Array(array) => array.release_all_volatile(),
            Storage::Sequential(sequential) => sequential.release_all_volatile(),
        }
    }
}

/// Creates, drops, and resolves storages; the metadata source for
/// snapshot manifests.
pub struct StorageManager {
    pool: Arc<PagePool>,
    cache: Arc<SnapshotPageCache>,
    max_threads: u16,
    storages: RwLock<HashMap<StorageId, Arc<Storage>>>,
    names: RwLock<HashMap<String, StorageId>>,
    next_id: AtomicU32,
}

impl StorageManager {
    pub fn new(
        pool: Arc<PagePool>,
        cache: Arc<SnapshotPageCache>,
        max_threads: u16,
    ) -> StorageManager {
        StorageManager {
            pool,
            cache,
            max_threads,
            storages: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn create_array(
        &self,
        name: &str,
        payload_size: u32,
        array_size: u64,
    ) -> Result<Arc<Storage>> {
        self.check_name(name)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let array = ArrayStorage::create(
            id,
            name,
            payload_size,
            array_size,
            Arc::clone(&self.pool),
            Arc::clone(&self.cache),
        )?;
        let storage = Arc::new(Storage::Array(array));
        self.register(storage.clone());
        info!(storage_id = id, name, "array storage created");
        Ok(storage)
    }

    pub fn create_sequential(&self, name: &str) -> Result<Arc<Storage>> {
        self.check_name(name)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let sequential = SequentialStorage::create(
            id,
            name,
            self.max_threads,
            Arc::clone(&self.pool),
            Arc::clone(&self.cache),
        )?;
        let storage = Arc::new(Storage::Sequential(sequential));
        self.register(storage.clone());
        info!(storage_id = id, name, "sequential storage created");
        Ok(storage)
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            bail!("storage name must not be empty");
        }
        if self.names.read().contains_key(name) {
            bail!("storage '{name}' already exists");
        }
        Ok(())
    }

    fn register(&self, storage: Arc<Storage>) {
        self.names
            .write()
            .insert(storage.name().to_string(), storage.id());
        self.storages.write().insert(storage.id(), storage);
    }

    pub fn get(&self, id: StorageId) -> CodeResult<Arc<Storage>> {
        self.storages
            .read()
            .get(&id)
            .cloned()
            .ok_or(ErrorCode::StorageNotFound)
    }

    pub fn get_by_name(&self, name: &str) -> CodeResult<Arc<Storage>> {
        let id = *self
            .names
            .read()
            .get(name)
            .ok_or(ErrorCode::StorageNotFound)?;
        self.get(id)
    }

    /// Removes a storage and returns its volatile pages to the pool.
    pub fn drop_storage(&self, id: StorageId) -> Result<()> {
        let Some(storage) = self.storages.write().remove(&id) else {
            bail!("storage {id} does not exist");
        };
        self.names.write().remove(storage.name());
        storage.release_all_volatile();
        info!(storage_id = id, name = storage.name(), "storage dropped");
        Ok(())
    }

    pub fn all_storages(&self) -> Vec<Arc<Storage>> {
        let mut storages: Vec<_> = self.storages.read().values().cloned().collect();
        storages.sort_by_key(|s| s.id());
        storages
    }

    /// Storage metadata for the snapshot manifest, id-ordered.
    pub fn metadata_snapshot(&self) -> Vec<StorageMetadata> {
        self.all_storages().iter().map(|s| s.metadata()).collect()
    }

    /// Re-creates storages from a snapshot manifest. Volatile trees stay
    /// empty; reads fault through the snapshot pages.
    pub fn restore(&self, metadata: &[StorageMetadata]) -> Result<()> {
        let mut max_id = 0;
        for meta in metadata {
            let storage = match meta.storage_type {
                StorageType::Array => Storage::Array(ArrayStorage::restore(
                    meta,
                    Arc::clone(&self.pool),
                    Arc::clone(&self.cache),
                )?),
                StorageType::Sequential => Storage::Sequential(SequentialStorage::restore(
                    meta,
                    self.max_threads,
                    Arc::clone(&self.pool),
                    Arc::clone(&self.cache),
                )?),
            };
            max_id = max_id.max(meta.id);
            self.register(Arc::new(storage));
        }
        self.next_id.store(max_id + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Applies a committed sequential append. Commit protocol only.
    pub(crate) fn apply_append(
        &self,
        storage_id: StorageId,
        thread_id: u16,
        data: &[u8],
        commit_id: XctId,
    ) -> CodeResult<()> {
        let storage = self.get(storage_id)?;
        storage.as_sequential()?.apply_append(thread_id, data, commit_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::writer::SnapshotFileSet;

    fn manager() -> StorageManager {
        let pool = Arc::new(PagePool::new(128));
        let cache = Arc::new(SnapshotPageCache::new(SnapshotFileSet::new(vec![])));
        StorageManager::new(pool, cache, 4)
    }

    #[test]
    fn create_and_lookup_by_id_and_name() {
        let manager = manager();
        let storage = manager.create_array("branches", 100, 8).unwrap();
        assert_eq!(storage.storage_type(), StorageType::Array);
        assert_eq!(manager.get(storage.id()).unwrap().name(), "branches");
        assert_eq!(manager.get_by_name("branches").unwrap().id(), storage.id());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let manager = manager();
        manager.create_array("dup", 16, 4).unwrap();
        assert!(manager.create_sequential("dup").is_err());
    }

    #[test]
    fn missing_storage_is_a_stable_code() {
        let manager = manager();
        assert_eq!(manager.get(99).unwrap_err(), ErrorCode::StorageNotFound);
        assert_eq!(
            manager.get_by_name("ghost").unwrap_err(),
            ErrorCode::StorageNotFound
        );
    }

    #[test]
    fn drop_returns_pages_to_the_pool() {
        let manager = manager();
        let free_before = manager.pool.free_count();
        let storage = manager.create_array("temp", 64, 100).unwrap();
        assert!(manager.pool.free_count() < free_before);
        manager.drop_storage(storage.id()).unwrap();
        assert_eq!(manager.pool.free_count(), free_before);
    }

    #[test]
    fn metadata_snapshot_is_id_ordered() {
        let manager = manager();
        manager.create_array("a", 16, 4).unwrap();
        manager.create_sequential("b").unwrap();
        let metadata = manager.metadata_snapshot();
        assert_eq!(metadata.len(), 2);
        assert!(metadata[0].id < metadata[1].id);
        assert_eq!(metadata[1].storage_type, StorageType::Sequential);
    }

    #[test]
    fn node_mapping_round_robins() {
        assert_eq!(node_of_thread(0, 2), 0);
        assert_eq!(node_of_thread(1, 2), 1);
        assert_eq!(node_of_thread(2, 2), 0);
        assert_eq!(node_of_thread(5, 1), 0);
    }
}
