//! # Sequential Storage
//!
//! Append-only records, the home of history/audit data. Appends are
//! *lock-free* in the transactional sense: they take no record lock and
//! are never validated, because an append cannot conflict with anything. A
//! transaction parks the record bytes in its lock-free write set; the
//! commit protocol materializes them here, stamped with the final commit
//! id, after validation has already succeeded.
//!
//! ## Layout
//!
//! One chunk chain per worker thread, so appends never contend:
//!
//! ```text
//! chain[thread] → chunk → chunk → chunk (tail, partially filled)
//! chunk payload: [owner id: u64][len: u32][pad: u32][bytes…] entries,
//!                8-byte aligned; header.record_count = byte fill
//! ```
//!
//! Writers publish an entry by storing the byte fill with release
//! ordering after the entry bytes; scanners read the fill with acquire
//! ordering and never see a torn entry. Structural changes (every append)
//! bump the chain's version; scans guard it through the page-version set,
//! so a scan that races an append aborts at validation instead of
//! silently missing records.
//!
//! After a snapshot, records with epoch ≤ the snapshot's
//! `valid_until_epoch` are served from snapshot chunks; volatile scans
//! skip them via `truncate_epoch` so drop-eligible chunks never produce
//! duplicates.

pub mod composer;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};

use crate::config::PAGE_PAYLOAD_SIZE;
use crate::epoch::Epoch;
use crate::error::CodeResult;
use crate::memory::PagePool;
use crate::snapshot::writer::SnapshotPageCache;
use crate::storage::page::{
    DualPagePointer, Page, PageType, PageVersion, SnapshotPagePointer, StorageId,
    VolatilePagePointer,
};
use crate::storage::{StorageMetadata, StorageType};
use crate::xct::access::PageVersionPtr;
use crate::xct::xct_id::XctId;
use crate::xct::Xct;

use self::composer::SequentialComposer;

/// Per-entry header: owner id + byte length + padding.
pub const ENTRY_HEADER_SIZE: usize = 16;

pub(crate) fn entry_len(payload_len: usize) -> usize {
    ENTRY_HEADER_SIZE + ((payload_len + 7) & !7)
}

/// One thread's private chunk chain.
#[derive(Debug)]
pub(crate) struct Chain {
    pub head: DualPagePointer,
    pub tail: AtomicU32,
    pub version: PageVersion,
}

#[derive(Debug)]
pub struct SequentialStorage {
    id: StorageId,
    name: String,
    pool: Arc<PagePool>,
    cache: Arc<SnapshotPageCache>,
    chains: Box<[Chain]>,
    /// Root snapshot page: a list of snapshot chunk pointers.
    root_snapshot: std::sync::atomic::AtomicU64,
    /// Volatile records at or below this epoch are already served by the
    /// snapshot; scans skip them.
    truncate_epoch: AtomicU32,
}

impl SequentialStorage {
    pub fn create(
        id: StorageId,
        name: &str,
        max_threads: u16,
        pool: Arc<PagePool>,
        cache: Arc<SnapshotPageCache>,
    ) -> Result<SequentialStorage> {
        if id >= (1 << 16) {
            bail!("storage id {id} out of range");
        }
        let chains = (0..max_threads)
            .map(|_| Chain {
                head: DualPagePointer::new(),
                tail: AtomicU32::new(0),
                version: PageVersion::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(SequentialStorage {
            id,
            name: name.to_string(),
            pool,
            cache,
            chains,
            root_snapshot: std::sync::atomic::AtomicU64::new(0),
            truncate_epoch: AtomicU32::new(0),
        })
    }

    pub fn restore(
        meta: &StorageMetadata,
        max_threads: u16,
        pool: Arc<PagePool>,
        cache: Arc<SnapshotPageCache>,
    ) -> Result<SequentialStorage> {
        let storage = Self::create(meta.id, &meta.name, max_threads, pool, cache)?;
        storage.install_root_snapshot(meta.root_snapshot_pointer);
        Ok(storage)
    }

    pub fn id(&self) -> StorageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> StorageMetadata {
        StorageMetadata {
            id: self.id,
            name: self.name.clone(),
            storage_type: StorageType::Sequential,
            payload_size: 0,
            array_size: 0,
            root_snapshot_pointer: self.root_snapshot_pointer(),
        }
    }

    pub fn composer(&self) -> SequentialComposer<'_> {
        SequentialComposer::new(self)
    }

    pub(crate) fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub(crate) fn pool(&self) -> &PagePool {
        &self.pool
    }

    pub fn root_snapshot_pointer(&self) -> SnapshotPagePointer {
        SnapshotPagePointer::from_raw(self.root_snapshot.load(Ordering::Acquire))
    }

    pub(crate) fn install_root_snapshot(&self, pointer: SnapshotPagePointer) {
        self.root_snapshot.store(pointer.raw(), Ordering::Release);
    }

    pub(crate) fn truncate_epoch(&self) -> Epoch {
        Epoch::from_raw(self.truncate_epoch.load(Ordering::Acquire))
    }

    pub(crate) fn set_truncate_epoch(&self, epoch: Epoch) {
        self.truncate_epoch.store(epoch.raw(), Ordering::Release);
    }

    /// Registers an append. The bytes are parked in the transaction's
    /// arena; nothing is visible until commit.
    pub fn append_record(&self, xct: &mut Xct, data: &[u8]) -> CodeResult<()> {
        debug_assert!(entry_len(data.len()) <= PAGE_PAYLOAD_SIZE);
        let parked = xct.copy_to_local_work_memory(data)?;
        let log = crate::log::record::LogRecord::Append {
            storage_id: self.id,
            data: unsafe { crate::log::record::ArenaSlice::new(parked, data.len()) },
        };
        xct.add_to_lock_free_write_set(self.id, log)
    }

    /// Materializes one committed append into the calling thread's chain.
    /// Commit protocol only; `thread_id` must be the calling thread.
    pub(crate) fn apply_append(
        &self,
        thread_id: u16,
        data: &[u8],
        commit_id: XctId,
    ) -> CodeResult<()> {
        let chain = &self.chains[thread_id as usize];
        let needed = entry_len(data.len());

        let mut tail = chain.tail.load(Ordering::Relaxed);
        if tail == 0 {
            let first = self.pool.grab()?;
            let page = self.pool.resolve(first);
            page.init_header(self.id, PageType::SequentialChunk, 0, 0, 0, 0);
            chain.head.set_volatile(first);
            chain.tail.store(first.offset(), Ordering::Release);
            tail = first.offset();
        }

        let mut page = self
            .pool
            .resolve(VolatilePagePointer::from_offset(tail));
        let mut fill = page.record_count_atomic().load(Ordering::Acquire) as usize;
        if fill + needed > PAGE_PAYLOAD_SIZE {
            let next = self.pool.grab()?;
            let next_page = self.pool.resolve(next);
            next_page.init_header(
                self.id,
                PageType::SequentialChunk,
                0,
                page.header().page_index + 1,
                0,
                0,
            );
            page.next_chunk_atomic().store(next.offset(), Ordering::Release);
            chain.tail.store(next.offset(), Ordering::Release);
            page = next_page;
            fill = 0;
        }

        write_entry(page, fill, commit_id, data);
        page.record_count_atomic()
            .store((fill + needed) as u32, Ordering::Release);
        chain.version.increment();
        Ok(())
    }

    /// Reads every record: snapshot chunks first, then the volatile
    /// chains (skipping records the snapshot already covers). Within one
    /// chain records are (epoch, ordinal)-ordered; across chains no order
    /// is implied.
    pub fn scan(&self, xct: &mut Xct) -> CodeResult<Vec<(XctId, Vec<u8>)>> {
        let mut out = Vec::new();

        let root = self.root_snapshot_pointer();
        if !root.is_null() {
            let root_page = self.cache.read(root)?;
            let count = root_page.header().record_count;
            for index in 0..count {
                let pointer = unsafe {
                    SnapshotPagePointer::from_raw(
                        (root_page.payload_ptr() as *const u64)
                            .add(index as usize)
                            .read_unaligned(),
                    )
                };
                let chunk = self.cache.read(pointer)?;
                let fill = chunk.header().record_count as usize;
                collect_entries(&chunk, fill, Epoch::invalid(), &mut out);
            }
        }

        let truncate = self.truncate_epoch();
        for chain in self.chains.iter() {
            xct.add_to_page_version_set(
                PageVersionPtr::from_ref(&chain.version),
                chain.version.status(),
            )?;
            let mut pointer = chain.head.volatile();
            while !pointer.is_null() {
                let page = self.pool.resolve(pointer);
                let fill = page.record_count_atomic().load(Ordering::Acquire) as usize;
                collect_entries(page, fill, truncate, &mut out);
                pointer = VolatilePagePointer::from_offset(
                    page.next_chunk_atomic().load(Ordering::Acquire),
                );
            }
        }
        Ok(out)
    }

    /// Releases every volatile chunk. Engine teardown / storage drop only.
    pub(crate) fn release_all_volatile(&self) {
        for chain in self.chains.iter() {
            let mut pointer = chain.head.volatile();
            while !pointer.is_null() {
                let page = self.pool.resolve(pointer);
                let next = VolatilePagePointer::from_offset(
                    page.next_chunk_atomic().load(Ordering::Acquire),
                );
                self.pool.release(pointer);
                pointer = next;
            }
            chain.head.set_volatile(VolatilePagePointer::null());
            chain.tail.store(0, Ordering::Release);
        }
    }
}

pub(crate) fn write_entry(page: &Page, fill: usize, commit_id: XctId, data: &[u8]) {
    unsafe {
        let base = page.payload_ptr().add(fill);
        (base as *mut u64).write_unaligned(commit_id.raw());
        (base.add(8) as *mut u32).write_unaligned(data.len() as u32);
        (base.add(12) as *mut u32).write_unaligned(0);
        std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(ENTRY_HEADER_SIZE), data.len());
        // Zero the alignment pad so chunk bytes are deterministic.
        let padded = entry_len(data.len());
        for extra in ENTRY_HEADER_SIZE + data.len()..padded {
            base.add(extra).write(0);
        }
    }
}

/// Epochs of every entry in one chunk, for the drop walk.
pub(crate) fn collect_entries_epochs(page: &Page, fill: usize) -> Vec<Epoch> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    while cursor + ENTRY_HEADER_SIZE <= fill {
        unsafe {
            let base = page.payload_ptr().add(cursor);
            let id = XctId::from_raw((base as *const u64).read_unaligned());
            let len = (base.add(8) as *const u32).read_unaligned() as usize;
            out.push(id.epoch());
            cursor += entry_len(len);
        }
    }
    out
}

/// Collects entries from one chunk, skipping records at or below
/// `skip_up_to` (invalid epoch = collect everything).
fn collect_entries(page: &Page, fill: usize, skip_up_to: Epoch, out: &mut Vec<(XctId, Vec<u8>)>) {
    let mut cursor = 0usize;
    while cursor + ENTRY_HEADER_SIZE <= fill {
        unsafe {
            let base = page.payload_ptr().add(cursor);
            let id = XctId::from_raw((base as *const u64).read_unaligned());
            let len = (base.add(8) as *const u32).read_unaligned() as usize;
            let bytes =
                std::slice::from_raw_parts(base.add(ENTRY_HEADER_SIZE) as *const u8, len).to_vec();
            if !skip_up_to.is_valid() || skip_up_to.before(id.epoch()) {
                out.push((id, bytes));
            }
            cursor += entry_len(len);
        }
    }
}
