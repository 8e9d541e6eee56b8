//! # XctId: the record ownership word
//!
//! A 64-bit word that is simultaneously the commit timestamp, the
//! visibility anchor, and (together with its sibling lock word) the record
//! lock:
//!
//! ```text
//! +------------+-------------+-----------+
//! | epoch (32) | ordinal (24)| flags (8) |
//! +------------+-------------+-----------+
//!
//! flags: bit 0 MOVED         record relocated; payload head holds a
//!                            forwarding pointer
//!        bit 1 DELETED       logical tombstone
//!        bit 2 NEXT_LAYER    pointer to a deeper layer, not a record
//!        bit 3 BEING_WRITTEN payload bytes are mid-update; readers spin
//! ```
//!
//! `(epoch, ordinal)` is strictly monotone per thread across successful
//! commits; `before` compares the pair lexicographically with the modular
//! epoch order. Flags never participate in ordering.
//!
//! [`RwLockableXctId`] pairs the id with an MCS lock word into the 128-bit,
//! 16-byte-aligned header the storage layer embeds in every record.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::epoch::Epoch;
use crate::xct::mcs_lock::McsRwLock;

pub const FLAG_MOVED: u64 = 0x01;
pub const FLAG_DELETED: u64 = 0x02;
pub const FLAG_NEXT_LAYER: u64 = 0x04;
pub const FLAG_BEING_WRITTEN: u64 = 0x08;

const FLAGS_MASK: u64 = 0xFF;
const ORDINAL_SHIFT: u64 = 8;
const ORDINAL_MASK: u64 = 0x00FF_FFFF;
const EPOCH_SHIFT: u64 = 32;

/// 64-bit commit id: `[epoch:32][ordinal:24][flags:8]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XctId(u64);

impl XctId {
    pub const fn invalid() -> XctId {
        XctId(0)
    }

    pub fn new(epoch: Epoch, ordinal: u32) -> XctId {
        debug_assert!(ordinal as u64 <= ORDINAL_MASK);
        XctId(((epoch.raw() as u64) << EPOCH_SHIFT) | ((ordinal as u64) << ORDINAL_SHIFT))
    }

    pub const fn from_raw(raw: u64) -> XctId {
        XctId(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn epoch(self) -> Epoch {
        Epoch::from_raw((self.0 >> EPOCH_SHIFT) as u32)
    }

    pub const fn ordinal(self) -> u32 {
        ((self.0 >> ORDINAL_SHIFT) & ORDINAL_MASK) as u32
    }

    pub fn is_valid(self) -> bool {
        self.epoch().is_valid()
    }

    /// Lexicographic (epoch, ordinal) comparison; flags are ignored.
    pub fn before(self, other: XctId) -> bool {
        debug_assert!(self.is_valid() && other.is_valid());
        if self.epoch() == other.epoch() {
            self.ordinal() < other.ordinal()
        } else {
            self.epoch().before(other.epoch())
        }
    }

    /// Replaces `self` with `other` if `other` is later. Invalid ids never
    /// win; an invalid `self` always loses.
    pub fn store_max(&mut self, other: XctId) {
        if !other.is_valid() {
            return;
        }
        if !self.is_valid() || self.before(other) {
            *self = other;
        }
    }

    pub const fn is_moved(self) -> bool {
        self.0 & FLAG_MOVED != 0
    }

    pub const fn is_deleted(self) -> bool {
        self.0 & FLAG_DELETED != 0
    }

    pub const fn is_next_layer(self) -> bool {
        self.0 & FLAG_NEXT_LAYER != 0
    }

    pub const fn is_being_written(self) -> bool {
        self.0 & FLAG_BEING_WRITTEN != 0
    }

    pub const fn with_flag(self, flag: u64) -> XctId {
        XctId(self.0 | flag)
    }

    pub const fn without_flag(self, flag: u64) -> XctId {
        XctId(self.0 & !flag)
    }

    /// The id with every flag cleared; what validation compares.
    pub const fn data_bits(self) -> XctId {
        XctId(self.0 & !FLAGS_MASK)
    }
}

/// The 128-bit record header: atomic XctId plus the MCS lock word.
///
/// The storage layer guarantees the header is 16-byte aligned and
/// address-stable for the life of the storage, so transactions may hold
/// raw pointers to it across their lifetime.
#[repr(C, align(16))]
pub struct RwLockableXctId {
    id: AtomicU64,
    pub lock: McsRwLock,
}

const _: () = assert!(std::mem::size_of::<RwLockableXctId>() == 16);

impl RwLockableXctId {
    pub fn new() -> RwLockableXctId {
        RwLockableXctId {
            id: AtomicU64::new(0),
            lock: McsRwLock::new(),
        }
    }

    /// Plain load of the ownership word.
    pub fn load(&self) -> XctId {
        XctId(self.id.load(Ordering::Acquire))
    }

    /// Loads the ownership word, spinning out a concurrent payload write.
    /// Use before reading the payload.
    pub fn load_stable(&self) -> XctId {
        loop {
            let id = self.load();
            if !id.is_being_written() {
                return id;
            }
            std::hint::spin_loop();
        }
    }

    /// Marks the payload as mid-update. X-lock holder only.
    pub fn begin_write(&self) {
        let current = self.id.load(Ordering::Relaxed);
        self.id
            .store(current | FLAG_BEING_WRITTEN, Ordering::Release);
    }

    /// Installs a new ownership word, clearing `BEING_WRITTEN`. X-lock
    /// holder only; `(epoch, ordinal)` must strictly advance.
    pub fn set_xct_id(&self, new_id: XctId) {
        debug_assert!(!new_id.is_being_written());
        debug_assert!({
            let current = XctId(self.id.load(Ordering::Relaxed)).data_bits();
            !current.is_valid() || current.before(new_id)
        });
        self.id.store(new_id.raw(), Ordering::Release);
    }

    /// Initializes the word without the advance check, for storage
    /// bootstrap before the record is shared.
    pub fn initialize(&self, id: XctId) {
        self.id.store(id.raw(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_packs_epoch_ordinal_flags() {
        let id = XctId::new(Epoch::from_raw(7), 300);
        assert_eq!(id.epoch(), Epoch::from_raw(7));
        assert_eq!(id.ordinal(), 300);
        assert!(!id.is_deleted());
        let deleted = id.with_flag(FLAG_DELETED);
        assert!(deleted.is_deleted());
        assert_eq!(deleted.without_flag(FLAG_DELETED), id);
    }

    #[test]
    fn before_orders_epoch_then_ordinal() {
        let a = XctId::new(Epoch::from_raw(3), 9);
        let b = XctId::new(Epoch::from_raw(3), 10);
        let c = XctId::new(Epoch::from_raw(4), 1);
        assert!(a.before(b));
        assert!(b.before(c));
        assert!(a.before(c));
        assert!(!b.before(a));
    }

    #[test]
    fn flags_do_not_affect_ordering() {
        let a = XctId::new(Epoch::from_raw(3), 9);
        let b = a.with_flag(FLAG_DELETED);
        assert!(!a.before(b.data_bits()));
        assert!(!b.data_bits().before(a));
    }

    #[test]
    fn store_max_prefers_later_ids() {
        let mut id = XctId::invalid();
        id.store_max(XctId::new(Epoch::from_raw(2), 5));
        assert_eq!(id, XctId::new(Epoch::from_raw(2), 5));
        id.store_max(XctId::new(Epoch::from_raw(2), 3));
        assert_eq!(id, XctId::new(Epoch::from_raw(2), 5));
        id.store_max(XctId::new(Epoch::from_raw(3), 1));
        assert_eq!(id, XctId::new(Epoch::from_raw(3), 1));
    }

    #[test]
    fn lockable_header_is_128_bits() {
        assert_eq!(std::mem::size_of::<RwLockableXctId>(), 16);
        assert_eq!(std::mem::align_of::<RwLockableXctId>(), 16);
    }

    #[test]
    fn set_xct_id_clears_being_written() {
        let header = RwLockableXctId::new();
        header.initialize(XctId::new(Epoch::from_raw(1), 1));
        header.begin_write();
        assert!(header.load().is_being_written());
        header.set_xct_id(XctId::new(Epoch::from_raw(1), 2));
        let current = header.load();
        assert!(!current.is_being_written());
        assert_eq!(current.ordinal(), 2);
    }
}
