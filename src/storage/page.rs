//! # Page Layout
//!
//! Every page, volatile (in the page pool, mutable) and snapshot (on disk,
//! immutable) alike, is [`PAGE_SIZE`] bytes: a 64-byte header followed by a
//! storage-specific payload area.
//!
//! ```text
//! +-----------------+------------------------------------------+
//! | PageHeader (64) | payload (PAGE_SIZE - 64)                 |
//! +-----------------+------------------------------------------+
//!
//! Array leaf payload:      [record slot 0][record slot 1]...
//!   record slot = RwLockableXctId (16, 16-aligned) + payload bytes
//! Array root payload:      [DualPagePointer 0][DualPagePointer 1]...
//! Sequential chunk payload: densely packed (owner id, len, bytes) entries
//! ```
//!
//! ## Pointers
//!
//! A [`DualPagePointer`] carries both references to "the same" logical
//! page: the volatile pointer (an offset into the engine's page pool) and
//! the snapshot pointer (a packed on-disk page address). Transactions
//! prefer the volatile side; when `drop_volatiles` clears it, readers fall
//! through to the snapshot side. The volatile word is swapped RCU-style;
//! transactions that followed it guard the observation through their
//! pointer set.
//!
//! ## Safety
//!
//! A volatile page is raw shared memory: owner words inside it are accessed
//! as atomics by any thread, payload bytes only under the record lock
//! protocol (`BEING_WRITTEN` bracketing). The `Page` type therefore hands
//! out raw pointers and the storage layer upholds the protocol; this is the
//! one module where `unsafe` is load-bearing rather than incidental.

use std::cell::UnsafeCell;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::{PAGE_HEADER_SIZE, PAGE_PAYLOAD_SIZE, PAGE_SIZE};

/// Identifies a storage within the engine. Values above `u16::MAX` are
/// rejected at creation so the id packs into a `UniversalLockId`.
pub type StorageId = u32;

/// Offset of a volatile page inside the engine's page pool. Offset 0 is
/// reserved and never handed out.
pub type PagePoolOffset = u32;

/// Reference to a volatile page; null when the offset is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolatilePagePointer(PagePoolOffset);

impl VolatilePagePointer {
    pub const fn null() -> Self {
        VolatilePagePointer(0)
    }

    pub const fn from_offset(offset: PagePoolOffset) -> Self {
        VolatilePagePointer(offset)
    }

    pub const fn offset(self) -> PagePoolOffset {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn word(self) -> u64 {
        self.0 as u64
    }

    pub const fn from_word(word: u64) -> Self {
        VolatilePagePointer(word as u32)
    }
}

/// Packed on-disk page address: `[snapshot_id:16][node:8][local:40]`.
/// Zero is the null pointer (snapshot id 0 is reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotPagePointer(u64);

impl SnapshotPagePointer {
    const NODE_SHIFT: u64 = 40;
    const SNAPSHOT_SHIFT: u64 = 48;
    const LOCAL_MASK: u64 = (1 << Self::NODE_SHIFT) - 1;

    pub const fn null() -> Self {
        SnapshotPagePointer(0)
    }

    pub fn new(snapshot_id: u16, node: u8, local_page_id: u64) -> Self {
        debug_assert!(snapshot_id != 0);
        debug_assert!(local_page_id <= Self::LOCAL_MASK);
        SnapshotPagePointer(
            ((snapshot_id as u64) << Self::SNAPSHOT_SHIFT)
                | ((node as u64) << Self::NODE_SHIFT)
                | local_page_id,
        )
    }

    pub const fn snapshot_id(self) -> u16 {
        (self.0 >> Self::SNAPSHOT_SHIFT) as u16
    }

    pub const fn node(self) -> u8 {
        (self.0 >> Self::NODE_SHIFT) as u8
    }

    pub const fn local_page_id(self) -> u64 {
        self.0 & Self::LOCAL_MASK
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn from_raw(raw: u64) -> Self {
        SnapshotPagePointer(raw)
    }
}

/// Atomic pair of (volatile, snapshot) references to one logical page.
#[derive(Debug)]
#[repr(C, align(16))]
pub struct DualPagePointer {
    volatile: AtomicU64,
    snapshot: AtomicU64,
}

impl DualPagePointer {
    pub const SIZE: usize = 16;

    pub fn new() -> DualPagePointer {
        DualPagePointer {
            volatile: AtomicU64::new(0),
            snapshot: AtomicU64::new(0),
        }
    }

    pub fn volatile(&self) -> VolatilePagePointer {
        VolatilePagePointer::from_word(self.volatile.load(Ordering::Acquire))
    }

    pub fn set_volatile(&self, pointer: VolatilePagePointer) {
        self.volatile.store(pointer.word(), Ordering::Release);
    }

    /// RCU-style swap of the volatile side. Returns whether the observed
    /// value still matched.
    pub fn cas_volatile(
        &self,
        observed: VolatilePagePointer,
        new: VolatilePagePointer,
    ) -> bool {
        self.volatile
            .compare_exchange(
                observed.word(),
                new.word(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn snapshot(&self) -> SnapshotPagePointer {
        SnapshotPagePointer::from_raw(self.snapshot.load(Ordering::Acquire))
    }

    pub fn set_snapshot(&self, pointer: SnapshotPagePointer) {
        self.snapshot.store(pointer.raw(), Ordering::Release);
    }
}

impl Default for DualPagePointer {
    fn default() -> Self {
        Self::new()
    }
}

/// An observed page-version value, compared bitwise at validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageVersionStatus(u64);

impl PageVersionStatus {
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Structural-modification counter of a page. Incremented by any change
/// that is not a simple record overwrite (e.g. appending a new chunk to a
/// sequential storage). Transactions snapshot the status before depending
/// on page structure and re-validate at precommit.
#[derive(Debug)]
#[repr(transparent)]
pub struct PageVersion(AtomicU64);

impl PageVersion {
    pub fn new() -> PageVersion {
        PageVersion(AtomicU64::new(0))
    }

    pub fn status(&self) -> PageVersionStatus {
        PageVersionStatus(self.0.load(Ordering::Acquire))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

/// Discriminates page layouts. Stored in the header of both volatile and
/// snapshot pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    ArrayLeaf = 1,
    ArrayRoot = 2,
    SequentialChunk = 3,
}

impl PageType {
    pub fn from_raw(raw: u8) -> Option<PageType> {
        match raw {
            1 => Some(PageType::ArrayLeaf),
            2 => Some(PageType::ArrayRoot),
            3 => Some(PageType::SequentialChunk),
            _ => None,
        }
    }
}

/// First 64 bytes of every page.
#[repr(C)]
pub struct PageHeader {
    /// Structural version. Meaningful only on volatile pages.
    pub version: PageVersion,
    pub storage_id: StorageId,
    pub page_type: u8,
    pub node: u8,
    _pad0: u16,
    /// Leaf index (array) or chunk sequence number (sequential).
    pub page_index: u64,
    /// For snapshot pages: this page's own packed pointer.
    pub self_snapshot_pointer: u64,
    /// First record offset covered by this page (array leaves).
    pub key_base: u64,
    /// Filled entries (sequential chunks) or record capacity (array).
    /// Once the page is shared, written through
    /// [`Page::record_count_atomic`] only.
    pub record_count: u32,
    /// Pool offset of the next chunk in a sequential chain; 0 = none.
    pub next_chunk: u32,
    _reserved: [u8; 16],
}

const _: () = assert!(size_of::<PageHeader>() == PAGE_HEADER_SIZE);

/// One page worth of raw, possibly shared memory.
///
/// Interior mutability is deliberate: volatile pages are mutated through
/// `&Page` under the record-lock / page-version protocols. Snapshot pages
/// are only ever built privately and read immutably.
#[repr(C, align(4096))]
pub struct Page {
    bytes: UnsafeCell<[u8; PAGE_SIZE]>,
}

// The storage layer serializes all conflicting access through owner words
// and the page-version protocol.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").finish_non_exhaustive()
    }
}

const _: () = assert!(size_of::<Page>() == PAGE_SIZE);

impl Page {
    pub fn new_zeroed() -> Box<Page> {
        // All-zero bytes are a valid (null/invalid) state for every field.
        unsafe { Box::new_zeroed().assume_init() }
    }

    pub fn header(&self) -> &PageHeader {
        // Header fields other than `version` are written once during
        // initialization, before the page is shared.
        unsafe { &*(self.bytes.get() as *const PageHeader) }
    }

    /// Initializes the header. Must complete before the page is published
    /// to other threads.
    pub fn init_header(
        &self,
        storage_id: StorageId,
        page_type: PageType,
        node: u8,
        page_index: u64,
        key_base: u64,
        record_count: u32,
    ) {
        unsafe {
            let header = self.bytes.get() as *mut PageHeader;
            (*header).storage_id = storage_id;
            (*header).page_type = page_type as u8;
            (*header).node = node;
            (*header).page_index = page_index;
            (*header).key_base = key_base;
            (*header).record_count = record_count;
        }
    }

    pub fn set_self_snapshot_pointer(&self, pointer: SnapshotPagePointer) {
        unsafe {
            (*(self.bytes.get() as *mut PageHeader)).self_snapshot_pointer = pointer.raw();
        }
    }

    pub fn set_record_count(&self, count: u32) {
        unsafe {
            (*(self.bytes.get() as *mut PageHeader)).record_count = count;
        }
    }

    /// Atomic view of `record_count`, for pages appended to while shared.
    pub fn record_count_atomic(&self) -> &std::sync::atomic::AtomicU32 {
        unsafe {
            let header = self.bytes.get() as *const PageHeader;
            &*(std::ptr::addr_of!((*header).record_count) as *const std::sync::atomic::AtomicU32)
        }
    }

    /// Atomic view of `next_chunk`, for chain links published while
    /// shared.
    pub fn next_chunk_atomic(&self) -> &std::sync::atomic::AtomicU32 {
        unsafe {
            let header = self.bytes.get() as *const PageHeader;
            &*(std::ptr::addr_of!((*header).next_chunk) as *const std::sync::atomic::AtomicU32)
        }
    }

    /// Raw pointer to the payload area. Callers uphold the layout and
    /// synchronization contract of the page's type.
    pub fn payload_ptr(&self) -> *mut u8 {
        unsafe { (self.bytes.get() as *mut u8).add(PAGE_HEADER_SIZE) }
    }

    pub const fn payload_capacity() -> usize {
        PAGE_PAYLOAD_SIZE
    }

    /// The whole page as bytes, for writing a privately built snapshot
    /// page to disk.
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        unsafe { &*self.bytes.get() }
    }

    /// Zeroes the whole page.
    pub fn zero(&self) {
        unsafe {
            std::ptr::write_bytes(self.bytes.get() as *mut u8, 0, PAGE_SIZE);
        }
    }

    /// Overwrites the whole page, for loading a snapshot page from disk
    /// into a private buffer.
    pub fn copy_from_bytes(&self, source: &[u8]) {
        debug_assert_eq!(source.len(), PAGE_SIZE);
        unsafe {
            (*self.bytes.get()).copy_from_slice(source);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_pointer_packs_and_unpacks() {
        let pointer = SnapshotPagePointer::new(3, 1, 0x1234_5678);
        assert_eq!(pointer.snapshot_id(), 3);
        assert_eq!(pointer.node(), 1);
        assert_eq!(pointer.local_page_id(), 0x1234_5678);
        assert!(!pointer.is_null());
        assert!(SnapshotPagePointer::null().is_null());
    }

    #[test]
    fn volatile_pointer_null_is_offset_zero() {
        assert!(VolatilePagePointer::null().is_null());
        assert!(!VolatilePagePointer::from_offset(1).is_null());
    }

    #[test]
    fn dual_pointer_cas_detects_stale_observation() {
        let page = Page::new_zeroed();
        let dual = unsafe { &*(page.payload_ptr() as *const DualPagePointer) };
        let a = VolatilePagePointer::from_offset(10);
        let b = VolatilePagePointer::from_offset(20);
        assert!(dual.cas_volatile(VolatilePagePointer::null(), a));
        assert_eq!(dual.volatile(), a);
        // A swap from a stale observation must fail.
        assert!(!dual.cas_volatile(VolatilePagePointer::null(), b));
        assert!(dual.cas_volatile(a, b));
        assert_eq!(dual.volatile(), b);
    }

    #[test]
    fn page_header_round_trips_through_init() {
        let page = Page::new_zeroed();
        page.init_header(7, PageType::ArrayLeaf, 2, 5, 160, 32);
        let header = page.header();
        assert_eq!(header.storage_id, 7);
        assert_eq!(PageType::from_raw(header.page_type), Some(PageType::ArrayLeaf));
        assert_eq!(header.node, 2);
        assert_eq!(header.page_index, 5);
        assert_eq!(header.key_base, 160);
        assert_eq!(header.record_count, 32);
    }

    #[test]
    fn page_version_increments_change_status() {
        let page = Page::new_zeroed();
        let before = page.header().version.status();
        page.header().version.increment();
        assert_ne!(before, page.header().version.status());
    }

    #[test]
    fn zeroed_page_round_trips_bytes() {
        let source = Page::new_zeroed();
        source.init_header(1, PageType::SequentialChunk, 0, 9, 0, 3);
        let target = Page::new_zeroed();
        target.copy_from_bytes(source.as_bytes());
        assert_eq!(target.header().page_index, 9);
        assert_eq!(target.header().record_count, 3);
    }
}
