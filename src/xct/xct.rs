//! # The Per-Thread Transaction Object
//!
//! One `Xct` lives in each thread context and is reused across
//! transactions: `activate` / `deactivate` bracket each run, resetting the
//! access sets, the current lock list, the MCS block cursor, and the local
//! work memory. Nothing here takes locks or touches other threads; the
//! manager drives the commit protocol; this type is pure bookkeeping.
//!
//! The one policy decision that lives here is the read-tracking elision
//! rule: [`Xct::read_set_tracking_enabled`] is the single place that
//! decides whether `add_to_read_set` records anything, so the rule stays
//! centralized and testable. `add_to_read_set_force` bypasses it.

use crate::config::{MAX_ORDINAL, MAX_PAGE_VERSION_SETS, MAX_POINTER_SETS};
use crate::config::options::XctOptions;
use crate::epoch::Epoch;
use crate::error::{CodeResult, ErrorCode};
use crate::log::record::LogRecord;
use crate::memory::LocalWorkMemory;
use crate::storage::page::{PageVersionStatus, StorageId, VolatilePagePointer};
use crate::xct::access::{
    DualPtrRef, LockFreeWriteAccess, LockablePtr, PageVersionAccess, PageVersionPtr,
    PayloadPtr, PointerAccess, ReadXctAccess, WriteXctAccess,
};
use crate::xct::lock_list::{CurrentLockList, RetrospectiveLockList, UniversalLockId};
use crate::xct::IsolationLevel;
use crate::xct::xct_id::XctId;

pub struct Xct {
    thread_id: u16,
    active: bool,
    isolation_level: IsolationLevel,
    /// Most recently issued commit id of this thread. Strictly monotone.
    id: XctId,

    read_set: Vec<ReadXctAccess>,
    write_set: Vec<WriteXctAccess>,
    lock_free_write_set: Vec<LockFreeWriteAccess>,
    pointer_set: Vec<PointerAccess>,
    page_version_set: Vec<PageVersionAccess>,

    current_lock_list: CurrentLockList,
    retrospective_lock_list: RetrospectiveLockList,
    /// Bump cursor into this thread's MCS block arena.
    pub mcs_block_current: u32,

    local_work_memory: LocalWorkMemory,

    max_read_set: usize,
    max_write_set: usize,
    max_lock_free_write_set: usize,
    ordinal_limit: u32,
}

impl Xct {
    pub fn new(thread_id: u16, options: &XctOptions, work_memory_bytes: usize) -> Xct {
        Xct {
            thread_id,
            active: false,
            isolation_level: IsolationLevel::Serializable,
            id: XctId::invalid(),
            read_set: Vec::with_capacity(64),
            write_set: Vec::with_capacity(64),
            lock_free_write_set: Vec::with_capacity(16),
            pointer_set: Vec::with_capacity(16),
            page_version_set: Vec::with_capacity(16),
            current_lock_list: CurrentLockList::new(),
            retrospective_lock_list: RetrospectiveLockList::new(),
            mcs_block_current: 0,
            local_work_memory: LocalWorkMemory::new(work_memory_bytes),
            max_read_set: options.max_read_set_size as usize,
            max_write_set: options.max_write_set_size as usize,
            max_lock_free_write_set: options.max_lock_free_write_set_size as usize,
            ordinal_limit: options
                .ordinal_overflow_test_width
                .map(|bits| (1u32 << bits) - 1)
                .unwrap_or(MAX_ORDINAL),
        }
    }

    /// Begins a transaction. All sets reset; if the retrospective lock
    /// list is non-empty, the current lock list is pre-populated with one
    /// entry per RLL entry, in the same order, not yet acquired.
    pub fn activate(&mut self, isolation_level: IsolationLevel) {
        debug_assert!(!self.active);
        self.active = true;
        self.isolation_level = isolation_level;
        self.read_set.clear();
        self.write_set.clear();
        self.lock_free_write_set.clear();
        self.pointer_set.clear();
        self.page_version_set.clear();
        self.mcs_block_current = 0;
        self.local_work_memory.reset();
        self.current_lock_list.clear();
        if !self.retrospective_lock_list.is_empty() {
            // Likely locks from the aborted attempt; take them all up
            // front so the retry does not abort the same way.
            self.current_lock_list
                .prepopulate_from_retrospective(&self.retrospective_lock_list);
        }
    }

    /// Ends a transaction. Every lock must already be released.
    pub fn deactivate(&mut self) {
        debug_assert!(self.active);
        debug_assert!(self.current_lock_list.no_locks_held());
        self.active = false;
        self.mcs_block_current = 0;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_read_only(&self) -> bool {
        self.write_set.is_empty() && self.lock_free_write_set.is_empty()
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn thread_id(&self) -> u16 {
        self.thread_id
    }

    /// The most recent commit id issued for this thread. Not this
    /// transaction's id until it commits.
    pub fn id(&self) -> XctId {
        self.id
    }

    /// The centralized read-tracking elision rule: serializable isolation
    /// tracks everything mutable; snapshot isolation and reads of
    /// immutable (snapshot-resident) records are elided.
    pub fn read_set_tracking_enabled(&self, immutable_record: bool) -> bool {
        self.isolation_level == IsolationLevel::Serializable && !immutable_record
    }

    /// Tracks a record read for commit-time validation. Returns the
    /// read-set index, or `None` when tracking is elided.
    pub fn add_to_read_set(
        &mut self,
        storage_id: StorageId,
        lock_id: UniversalLockId,
        owner: LockablePtr,
        observed: XctId,
        immutable_record: bool,
    ) -> CodeResult<Option<u32>> {
        if !self.read_set_tracking_enabled(immutable_record) {
            return Ok(None);
        }
        self.add_to_read_set_force(storage_id, lock_id, owner, observed)
            .map(Some)
    }

    /// Always tracks, regardless of isolation level.
    pub fn add_to_read_set_force(
        &mut self,
        storage_id: StorageId,
        lock_id: UniversalLockId,
        owner: LockablePtr,
        observed: XctId,
    ) -> CodeResult<u32> {
        if self.read_set.len() >= self.max_read_set {
            return Err(ErrorCode::ReadSetOverflow);
        }
        let index = self.read_set.len() as u32;
        self.read_set.push(ReadXctAccess {
            storage_id,
            lock_id,
            owner,
            observed,
            related_write: None,
        });
        Ok(index)
    }

    /// Adds a pending write. If the same record was read earlier in this
    /// transaction, the read and write entries cross-link so validation
    /// can exempt the self-written record.
    pub fn add_to_write_set(
        &mut self,
        storage_id: StorageId,
        lock_id: UniversalLockId,
        owner: LockablePtr,
        payload: PayloadPtr,
        log: LogRecord,
    ) -> CodeResult<u32> {
        if self.write_set.len() >= self.max_write_set {
            return Err(ErrorCode::WriteSetOverflow);
        }
        let index = self.write_set.len() as u32;
        let mut related_read = None;
        for (read_index, read) in self.read_set.iter_mut().enumerate().rev() {
            if read.owner == owner && read.related_write.is_none() {
                read.related_write = Some(index);
                related_read = Some(read_index as u32);
                break;
            }
        }
        self.write_set.push(WriteXctAccess {
            storage_id,
            lock_id,
            owner,
            payload,
            log,
            related_read,
        });
        Ok(index)
    }

    /// Adds an append to a sequential storage: no lock, no validation.
    pub fn add_to_lock_free_write_set(
        &mut self,
        storage_id: StorageId,
        log: LogRecord,
    ) -> CodeResult<()> {
        if self.lock_free_write_set.len() >= self.max_lock_free_write_set {
            return Err(ErrorCode::WriteSetOverflow);
        }
        self.lock_free_write_set
            .push(LockFreeWriteAccess { storage_id, log });
        Ok(())
    }

    /// Guards a volatile pointer that may be RCU-swapped before commit.
    pub fn add_to_pointer_set(
        &mut self,
        address: DualPtrRef,
        observed: VolatilePagePointer,
    ) -> CodeResult<()> {
        if self.pointer_set.len() >= MAX_POINTER_SETS {
            return Err(ErrorCode::TooManyReads);
        }
        self.pointer_set.push(PointerAccess { address, observed });
        Ok(())
    }

    /// Re-points an existing pointer-set entry after this transaction
    /// itself installed a new page, so it does not abort on its own swap.
    pub fn overwrite_to_pointer_set(
        &mut self,
        address: DualPtrRef,
        observed: VolatilePagePointer,
    ) {
        for access in self.pointer_set.iter_mut() {
            if std::ptr::eq(access.address.as_ref(), address.as_ref()) {
                access.observed = observed;
                return;
            }
        }
    }

    /// Guards a page's structural version word.
    pub fn add_to_page_version_set(
        &mut self,
        address: PageVersionPtr,
        observed: PageVersionStatus,
    ) -> CodeResult<()> {
        if self.page_version_set.len() >= MAX_PAGE_VERSION_SETS {
            return Err(ErrorCode::TooManyReads);
        }
        self.page_version_set
            .push(PageVersionAccess { address, observed });
        Ok(())
    }

    /// Issues the commit id for a successful precommit.
    ///
    /// The result is strictly greater than this thread's previous id and
    /// than `max_dep_xct_id`, and lies in `*epoch`, advanced by one only
    /// when the ordinal space of the current epoch is exhausted.
    pub fn issue_next_id(&mut self, max_dep_xct_id: XctId, epoch: &mut Epoch) -> XctId {
        debug_assert!(epoch.is_valid());
        debug_assert!(!self.id.is_valid() || !epoch.before(self.id.epoch()));
        debug_assert!(!max_dep_xct_id.is_valid() || !epoch.before(max_dep_xct_id.epoch()));

        let mut max_ordinal = 0;
        if self.id.is_valid() && self.id.epoch() == *epoch {
            max_ordinal = self.id.ordinal();
        }
        if max_dep_xct_id.is_valid() && max_dep_xct_id.epoch() == *epoch {
            max_ordinal = max_ordinal.max(max_dep_xct_id.ordinal());
        }

        let mut ordinal = max_ordinal + 1;
        if ordinal > self.ordinal_limit {
            *epoch = epoch.one_more();
            ordinal = 1;
        }
        let new_id = XctId::new(*epoch, ordinal);
        debug_assert!(!self.id.is_valid() || self.id.before(new_id));
        debug_assert!(!max_dep_xct_id.is_valid() || max_dep_xct_id.data_bits().before(new_id));
        self.id = new_id;
        new_id
    }

    /// Scratch memory valid until the next `activate`.
    pub fn acquire_local_work_memory(&self, size: usize) -> CodeResult<*mut u8> {
        self.local_work_memory.acquire(size)
    }

    /// Copies bytes into the transaction-lifetime arena.
    pub fn copy_to_local_work_memory(&self, bytes: &[u8]) -> CodeResult<*mut u8> {
        self.local_work_memory.copy_in(bytes)
    }

    /// Rebuilds the retrospective lock list from this (aborting)
    /// transaction's CLL and read set.
    pub fn seed_retrospective_lock_list(&mut self) {
        let reads = self
            .read_set
            .iter()
            .map(|read| (read.lock_id, read.owner))
            .collect::<Vec<_>>();
        self.retrospective_lock_list
            .construct(&self.current_lock_list, reads.into_iter());
    }

    pub fn clear_retrospective_lock_list(&mut self) {
        self.retrospective_lock_list.clear();
    }

    pub fn read_set(&self) -> &[ReadXctAccess] {
        &self.read_set
    }

    pub fn write_set(&self) -> &[WriteXctAccess] {
        &self.write_set
    }

    pub fn write_set_mut(&mut self) -> &mut [WriteXctAccess] {
        &mut self.write_set
    }

    pub fn lock_free_write_set(&self) -> &[LockFreeWriteAccess] {
        &self.lock_free_write_set
    }

    pub fn pointer_set(&self) -> &[PointerAccess] {
        &self.pointer_set
    }

    pub fn page_version_set(&self) -> &[PageVersionAccess] {
        &self.page_version_set
    }

    pub fn current_lock_list(&self) -> &CurrentLockList {
        &self.current_lock_list
    }

    pub fn current_lock_list_mut(&mut self) -> &mut CurrentLockList {
        &mut self.current_lock_list
    }

    pub fn retrospective_lock_list(&self) -> &RetrospectiveLockList {
        &self.retrospective_lock_list
    }

    /// Splits the borrows the precommit lock phase needs at once.
    pub fn lock_phase_parts(
        &mut self,
    ) -> (&mut CurrentLockList, &mut u32, &[WriteXctAccess]) {
        (
            &mut self.current_lock_list,
            &mut self.mcs_block_current,
            &self.write_set,
        )
    }
}
