//! # Access Set Entries
//!
//! What a transaction remembers about everything it touched. Entries hold
//! raw pointers into storage memory; the storage layer guarantees record
//! headers and volatile page words are address-stable while the engine
//! lives, and every entry dies with its transaction, which the engine
//! outlives. The newtype wrappers exist to carry that argument exactly
//! once instead of at every use site.

use crate::log::record::LogRecord;
use crate::storage::page::{
    DualPagePointer, PageVersion, PageVersionStatus, StorageId, VolatilePagePointer,
};
use crate::xct::lock_list::UniversalLockId;
use crate::xct::xct_id::{RwLockableXctId, XctId};

/// Stable pointer to a record ownership word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockablePtr(*const RwLockableXctId);

// Record headers are address-stable for the life of the engine, which
// outlives every transaction holding one of these.
unsafe impl Send for LockablePtr {}
unsafe impl Sync for LockablePtr {}

impl LockablePtr {
    pub fn from_ref(owner: &RwLockableXctId) -> LockablePtr {
        LockablePtr(owner as *const RwLockableXctId)
    }

    pub fn as_ref(&self) -> &RwLockableXctId {
        unsafe { &*self.0 }
    }
}

/// Stable pointer to a record's payload bytes.
#[derive(Debug, Clone, Copy)]
pub struct PayloadPtr(*mut u8);

unsafe impl Send for PayloadPtr {}
unsafe impl Sync for PayloadPtr {}

impl PayloadPtr {
    /// `ptr` must stay valid for the life of the storage and only be
    /// written under the record's X lock.
    pub unsafe fn new(ptr: *mut u8) -> PayloadPtr {
        PayloadPtr(ptr)
    }

    pub fn raw(&self) -> *mut u8 {
        self.0
    }
}

/// Stable pointer to a dual page pointer word.
#[derive(Debug, Clone, Copy)]
pub struct DualPtrRef(*const DualPagePointer);

unsafe impl Send for DualPtrRef {}
unsafe impl Sync for DualPtrRef {}

impl DualPtrRef {
    pub fn from_ref(pointer: &DualPagePointer) -> DualPtrRef {
        DualPtrRef(pointer as *const DualPagePointer)
    }

    pub fn as_ref(&self) -> &DualPagePointer {
        unsafe { &*self.0 }
    }
}

/// Stable pointer to a page-version word.
#[derive(Debug, Clone, Copy)]
pub struct PageVersionPtr(*const PageVersion);

unsafe impl Send for PageVersionPtr {}
unsafe impl Sync for PageVersionPtr {}

impl PageVersionPtr {
    pub fn from_ref(version: &PageVersion) -> PageVersionPtr {
        PageVersionPtr(version as *const PageVersion)
    }

    pub fn as_ref(&self) -> &PageVersion {
        unsafe { &*self.0 }
    }
}

/// One tracked record read.
#[derive(Clone, Copy)]
pub struct ReadXctAccess {
    pub storage_id: StorageId,
    pub lock_id: UniversalLockId,
    pub owner: LockablePtr,
    /// The ownership word observed before reading the payload.
    pub observed: XctId,
    /// Index into the write set when this transaction also writes the
    /// record.
    pub related_write: Option<u32>,
}

/// One pending record write.
pub struct WriteXctAccess {
    pub storage_id: StorageId,
    pub lock_id: UniversalLockId,
    pub owner: LockablePtr,
    pub payload: PayloadPtr,
    pub log: LogRecord,
    /// Index into the read set when this transaction also read the record.
    pub related_read: Option<u32>,
}

/// One pending append to a sequential storage. No lock, no validation.
pub struct LockFreeWriteAccess {
    pub storage_id: StorageId,
    pub log: LogRecord,
}

/// Guards a volatile pointer that may be RCU-swapped.
#[derive(Clone, Copy)]
pub struct PointerAccess {
    pub address: DualPtrRef,
    pub observed: VolatilePagePointer,
}

/// Guards a page's structural-modification counter.
#[derive(Clone, Copy)]
pub struct PageVersionAccess {
    pub address: PageVersionPtr,
    pub observed: PageVersionStatus,
}
