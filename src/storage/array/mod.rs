//! # Array Storage
//!
//! Fixed-size records addressed by offset: the simplest storage
//! organization and the backbone of every account/balance style workload.
//!
//! ## Layout
//!
//! Two levels of pages:
//!
//! ```text
//! root page:  [DualPagePointer; leaf_count]       (one per leaf)
//! leaf page:  [record slot; records_per_leaf]
//! record slot: RwLockableXctId (16 bytes) + payload (padded to 16)
//! ```
//!
//! The same layout serves volatile and snapshot pages; a snapshot page
//! simply has null volatile words and zeroed lock words, so materializing
//! a volatile page is a byte copy.
//!
//! ## Transactional contract
//!
//! Reads observe the record's ownership word (spinning out a concurrent
//! payload write), copy the payload, and register a read-set entry; the
//! commit-time validation re-checks the word. Writes park their
//! after-image in the transaction's local work memory and register a
//! write-set entry; nothing touches the record until the commit protocol
//! holds the exclusive lock. Reads that fall through to a snapshot page
//! register a pointer-set entry on the dual pointer they traversed
//! instead of a read-set entry: if a writer re-materializes the volatile
//! page before the reader commits, validation catches the swap.

pub mod composer;

use std::sync::Arc;

use eyre::{bail, Result};

use crate::config::PAGE_PAYLOAD_SIZE;
use crate::epoch::Epoch;
use crate::error::{CodeResult, ErrorCode};
use crate::log::record::{ArenaSlice, LogRecord};
use crate::memory::PagePool;
use crate::snapshot::writer::SnapshotPageCache;
use crate::storage::page::{
    DualPagePointer, Page, PageType, SnapshotPagePointer, StorageId, VolatilePagePointer,
};
use crate::storage::{StorageMetadata, StorageType};
use crate::xct::access::{DualPtrRef, LockablePtr, PayloadPtr};
use crate::xct::lock_list::UniversalLockId;
use crate::xct::xct_id::{RwLockableXctId, XctId};
use crate::xct::Xct;

use self::composer::ArrayComposer;

/// Bytes of the per-record header inside a slot.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Largest number of leaves a single root page can point at.
pub const MAX_LEAVES: u64 = (PAGE_PAYLOAD_SIZE / DualPagePointer::SIZE) as u64;

#[derive(Debug)]
pub struct ArrayStorage {
    id: StorageId,
    name: String,
    payload_size: u32,
    slot_size: u32,
    records_per_leaf: u32,
    leaf_count: u64,
    array_size: u64,
    pool: Arc<PagePool>,
    cache: Arc<SnapshotPageCache>,
    /// Volatile root page + root snapshot page of this storage.
    root_pointer: DualPagePointer,
}

/// Where a leaf was found.
enum LeafRef<'a> {
    Volatile(&'a Page),
    Snapshot(Arc<Page>),
}

impl ArrayStorage {
    pub fn create(
        id: StorageId,
        name: &str,
        payload_size: u32,
        array_size: u64,
        pool: Arc<PagePool>,
        cache: Arc<SnapshotPageCache>,
    ) -> Result<ArrayStorage> {
        let storage = Self::build(id, name, payload_size, array_size, pool, cache)?;
        // Materialize the whole tree eagerly: array storages are dense and
        // offsets are valid from the start.
        let root = storage.pool.grab()?;
        let root_page = storage.pool.resolve(root);
        root_page.init_header(id, PageType::ArrayRoot, 0, 0, 0, storage.leaf_count as u32);
        for leaf in 0..storage.leaf_count {
            let pointer = storage.pool.grab()?;
            let page = storage.pool.resolve(pointer);
            storage.init_fresh_leaf(page, leaf);
            Self::child_dual(root_page, leaf).set_volatile(pointer);
        }
        storage.root_pointer.set_volatile(root);
        Ok(storage)
    }

    /// Rebuilds the storage handle from snapshot metadata: no volatile
    /// pages, all reads served from the snapshot until written.
    pub fn restore(
        meta: &StorageMetadata,
        pool: Arc<PagePool>,
        cache: Arc<SnapshotPageCache>,
    ) -> Result<ArrayStorage> {
        let storage = Self::build(
            meta.id,
            &meta.name,
            meta.payload_size,
            meta.array_size,
            pool,
            cache,
        )?;
        storage.root_pointer.set_snapshot(meta.root_snapshot_pointer);
        Ok(storage)
    }

    fn build(
        id: StorageId,
        name: &str,
        payload_size: u32,
        array_size: u64,
        pool: Arc<PagePool>,
        cache: Arc<SnapshotPageCache>,
    ) -> Result<ArrayStorage> {
        if id >= (1 << 16) {
            bail!("storage id {id} out of range");
        }
        if payload_size == 0 || array_size == 0 {
            bail!("array storage '{name}' needs nonzero payload and size");
        }
        let slot_size = (RECORD_HEADER_SIZE as u32 + payload_size + 15) & !15;
        let records_per_leaf = (PAGE_PAYLOAD_SIZE as u32) / slot_size;
        if records_per_leaf == 0 {
            bail!("payload of {payload_size} bytes does not fit a page");
        }
        let leaf_count = array_size.div_ceil(records_per_leaf as u64);
        if leaf_count > MAX_LEAVES {
            bail!(
                "array storage '{name}' needs {leaf_count} leaves; the root page holds {MAX_LEAVES}"
            );
        }
        Ok(ArrayStorage {
            id,
            name: name.to_string(),
            payload_size,
            slot_size,
            records_per_leaf,
            leaf_count,
            array_size,
            pool,
            cache,
            root_pointer: DualPagePointer::new(),
        })
    }

    pub fn id(&self) -> StorageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload_size(&self) -> u32 {
        self.payload_size
    }

    pub fn array_size(&self) -> u64 {
        self.array_size
    }

    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    pub fn records_per_leaf(&self) -> u32 {
        self.records_per_leaf
    }

    pub(crate) fn root_pointer(&self) -> &DualPagePointer {
        &self.root_pointer
    }

    pub(crate) fn pool(&self) -> &PagePool {
        &self.pool
    }

    pub fn metadata(&self) -> StorageMetadata {
        StorageMetadata {
            id: self.id,
            name: self.name.clone(),
            storage_type: StorageType::Array,
            payload_size: self.payload_size,
            array_size: self.array_size,
            root_snapshot_pointer: self.root_pointer.snapshot(),
        }
    }

    pub fn composer(&self) -> ArrayComposer<'_> {
        ArrayComposer::new(self)
    }

    /// Which partition (NUMA node) a record offset belongs to.
    pub fn partition_of_offset(&self, offset: u64, partitions: u16) -> u16 {
        let leaf = offset / self.records_per_leaf as u64;
        ((leaf * partitions as u64) / self.leaf_count) as u16
    }

    pub(crate) fn partition_of_leaf(&self, leaf: u64, partitions: u16) -> u16 {
        ((leaf * partitions as u64) / self.leaf_count) as u16
    }

    fn leaf_of(&self, offset: u64) -> (u64, u32) {
        (
            offset / self.records_per_leaf as u64,
            (offset % self.records_per_leaf as u64) as u32,
        )
    }

    /// Records actually present in the given leaf (the last leaf may be
    /// partial).
    pub(crate) fn leaf_record_count(&self, leaf: u64) -> u32 {
        let base = leaf * self.records_per_leaf as u64;
        (self.array_size - base).min(self.records_per_leaf as u64) as u32
    }

    pub(crate) fn lock_id(&self, offset: u64) -> UniversalLockId {
        let (leaf, slot) = self.leaf_of(offset);
        UniversalLockId::new(self.id, leaf, slot)
    }

    pub(crate) fn child_dual(root_page: &Page, leaf: u64) -> &DualPagePointer {
        unsafe {
            &*(root_page.payload_ptr() as *const DualPagePointer).add(leaf as usize)
        }
    }

    /// Owner word and payload base of one slot.
    pub(crate) fn record_parts<'p>(
        &self,
        page: &'p Page,
        slot: u32,
    ) -> (&'p RwLockableXctId, *mut u8) {
        debug_assert!(slot < self.records_per_leaf);
        unsafe {
            let base = page.payload_ptr().add((slot * self.slot_size) as usize);
            (
                &*(base as *const RwLockableXctId),
                base.add(RECORD_HEADER_SIZE),
            )
        }
    }

    pub(crate) fn init_fresh_leaf(&self, page: &Page, leaf: u64) {
        let count = self.leaf_record_count(leaf);
        page.init_header(
            self.id,
            PageType::ArrayLeaf,
            0,
            leaf,
            leaf * self.records_per_leaf as u64,
            count,
        );
        for slot in 0..count {
            let (owner, _) = self.record_parts(page, slot);
            owner.initialize(XctId::new(Epoch::initial(), 0));
        }
    }

    /// Reads the whole payload of `offset` into `payload`.
    pub fn get_record(&self, xct: &mut Xct, offset: u64, payload: &mut [u8]) -> CodeResult<()> {
        self.get_record_part(xct, offset, payload, 0)
    }

    /// Reads `payload.len()` bytes starting at `payload_offset`.
    pub fn get_record_part(
        &self,
        xct: &mut Xct,
        offset: u64,
        payload: &mut [u8],
        payload_offset: u32,
    ) -> CodeResult<()> {
        self.check_range(offset, payload_offset, payload.len())?;
        let (leaf, slot) = self.leaf_of(offset);
        match self.resolve_leaf_for_read(xct, leaf)? {
            LeafRef::Volatile(page) => {
                let (owner, payload_base) = self.record_parts(page, slot);
                let observed = owner.load_stable();
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        payload_base.add(payload_offset as usize),
                        payload.as_mut_ptr(),
                        payload.len(),
                    );
                }
                xct.add_to_read_set(
                    self.id,
                    self.lock_id(offset),
                    LockablePtr::from_ref(owner),
                    observed,
                    false,
                )?;
            }
            LeafRef::Snapshot(page) => {
                // Immutable page: the pointer-set entry taken while
                // resolving the leaf is the only guard needed.
                let (_, payload_base) = self.record_parts(&page, slot);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        payload_base.add(payload_offset as usize),
                        payload.as_mut_ptr(),
                        payload.len(),
                    );
                }
            }
        }
        Ok(())
    }

    /// Registers an overwrite of `data.len()` bytes at `payload_offset`.
    /// Applied only if the transaction commits.
    pub fn overwrite_record(
        &self,
        xct: &mut Xct,
        offset: u64,
        data: &[u8],
        payload_offset: u32,
    ) -> CodeResult<()> {
        self.check_range(offset, payload_offset, data.len())?;
        let (leaf, slot) = self.leaf_of(offset);
        let page = self.resolve_leaf_for_write(xct, leaf)?;
        let (owner, payload_base) = self.record_parts(page, slot);
        let parked = xct.copy_to_local_work_memory(data)?;
        let log = LogRecord::Overwrite {
            storage_id: self.id,
            offset,
            payload_offset,
            data: unsafe { ArenaSlice::new(parked, data.len()) },
        };
        xct.add_to_write_set(
            self.id,
            self.lock_id(offset),
            LockablePtr::from_ref(owner),
            unsafe { PayloadPtr::new(payload_base) },
            log,
        )?;
        Ok(())
    }

    /// Reads the little-endian i64 at `payload_offset`, registers an
    /// increment by `delta`, and returns the incremented value as of this
    /// read. The increment itself is applied at commit time under the
    /// record lock, so concurrent increments compose.
    pub fn increment_record_i64(
        &self,
        xct: &mut Xct,
        offset: u64,
        payload_offset: u32,
        delta: i64,
    ) -> CodeResult<i64> {
        let mut current = [0u8; 8];
        self.get_record_part(xct, offset, &mut current, payload_offset)?;
        let (leaf, slot) = self.leaf_of(offset);
        let page = self.resolve_leaf_for_write(xct, leaf)?;
        let (owner, payload_base) = self.record_parts(page, slot);
        let log = LogRecord::Increment {
            storage_id: self.id,
            offset,
            payload_offset,
            delta,
        };
        xct.add_to_write_set(
            self.id,
            self.lock_id(offset),
            LockablePtr::from_ref(owner),
            unsafe { PayloadPtr::new(payload_base) },
            log,
        )?;
        Ok(i64::from_le_bytes(current).wrapping_add(delta))
    }

    fn check_range(&self, offset: u64, payload_offset: u32, len: usize) -> CodeResult<()> {
        if offset >= self.array_size {
            return Err(ErrorCode::InvalidOffset);
        }
        if payload_offset as usize + len > self.payload_size as usize {
            return Err(ErrorCode::InvalidPayloadRange);
        }
        Ok(())
    }

    fn resolve_leaf_for_read(&self, xct: &mut Xct, leaf: u64) -> CodeResult<LeafRef<'_>> {
        let root_volatile = self.root_pointer.volatile();
        if !root_volatile.is_null() {
            let root_page = self.pool.resolve(root_volatile);
            let dual = Self::child_dual(root_page, leaf);
            let volatile = dual.volatile();
            if !volatile.is_null() {
                return Ok(LeafRef::Volatile(self.pool.resolve(volatile)));
            }
            // Fall through to the snapshot leaf; guard the swap.
            xct.add_to_pointer_set(DualPtrRef::from_ref(dual), volatile)?;
            let snapshot = dual.snapshot();
            debug_assert!(!snapshot.is_null());
            return Ok(LeafRef::Snapshot(self.cache.read(snapshot)?));
        }
        // No volatile tree at all: guard the root pointer and read through
        // the snapshot root.
        xct.add_to_pointer_set(DualPtrRef::from_ref(&self.root_pointer), root_volatile)?;
        let root_snapshot = self.root_pointer.snapshot();
        debug_assert!(!root_snapshot.is_null());
        let root_page = self.cache.read(root_snapshot)?;
        let leaf_pointer = Self::child_dual(&root_page, leaf).snapshot();
        debug_assert!(!leaf_pointer.is_null());
        Ok(LeafRef::Snapshot(self.cache.read(leaf_pointer)?))
    }

    fn resolve_leaf_for_write(&self, xct: &mut Xct, leaf: u64) -> CodeResult<&Page> {
        let root_page = self.ensure_volatile_root(xct)?;
        let dual = Self::child_dual(root_page, leaf);
        let volatile = dual.volatile();
        if !volatile.is_null() {
            return Ok(self.pool.resolve(volatile));
        }
        let (pointer, installed_by_us) = self.materialize_leaf(dual, leaf)?;
        if installed_by_us {
            // A transaction must not abort on its own installation. A
            // swap by anyone else keeps the stale observation and aborts
            // at validation.
            xct.overwrite_to_pointer_set(DualPtrRef::from_ref(dual), pointer);
        }
        Ok(self.pool.resolve(pointer))
    }

    fn ensure_volatile_root(&self, xct: &mut Xct) -> CodeResult<&Page> {
        let volatile = self.root_pointer.volatile();
        if !volatile.is_null() {
            return Ok(self.pool.resolve(volatile));
        }
        let root_snapshot = self.root_pointer.snapshot();
        debug_assert!(!root_snapshot.is_null());
        let snapshot_root = self.cache.read(root_snapshot)?;
        let fresh = self.pool.grab()?;
        let page = self.pool.resolve(fresh);
        page.init_header(self.id, PageType::ArrayRoot, 0, 0, 0, self.leaf_count as u32);
        for leaf in 0..self.leaf_count {
            let snapshot_child = Self::child_dual(&snapshot_root, leaf).snapshot();
            Self::child_dual(page, leaf).set_snapshot(snapshot_child);
        }
        let installed = if self.root_pointer.cas_volatile(VolatilePagePointer::null(), fresh) {
            xct.overwrite_to_pointer_set(DualPtrRef::from_ref(&self.root_pointer), fresh);
            fresh
        } else {
            self.pool.release(fresh);
            self.root_pointer.volatile()
        };
        Ok(self.pool.resolve(installed))
    }

    fn materialize_leaf(
        &self,
        dual: &DualPagePointer,
        leaf: u64,
    ) -> CodeResult<(VolatilePagePointer, bool)> {
        let snapshot = dual.snapshot();
        let fresh = self.pool.grab()?;
        let page = self.pool.resolve(fresh);
        if snapshot.is_null() {
            self.init_fresh_leaf(page, leaf);
        } else {
            let snapshot_page = self.cache.read(snapshot)?;
            page.copy_from_bytes(snapshot_page.as_bytes());
        }
        if dual.cas_volatile(VolatilePagePointer::null(), fresh) {
            Ok((fresh, true))
        } else {
            self.pool.release(fresh);
            Ok((dual.volatile(), false))
        }
    }

    /// Installs the storage's new root snapshot pointer after a snapshot
    /// is published.
    pub(crate) fn install_root_snapshot(&self, pointer: SnapshotPagePointer) {
        self.root_pointer.set_snapshot(pointer);
    }

    /// Releases every volatile page. Engine teardown / storage drop only.
    pub(crate) fn release_all_volatile(&self) {
        let root = self.root_pointer.volatile();
        if root.is_null() {
            return;
        }
        let root_page = self.pool.resolve(root);
        for leaf in 0..self.leaf_count {
            let dual = Self::child_dual(root_page, leaf);
            let volatile = dual.volatile();
            if !volatile.is_null() {
                self.pool.release(volatile);
                dual.set_volatile(VolatilePagePointer::null());
            }
        }
        self.root_pointer.set_volatile(VolatilePagePointer::null());
        self.pool.release(root);
    }
}
