//! # Lock Lists: CLL and RLL
//!
//! Deadlock freedom by total order. Every lockable record header has a
//! [`UniversalLockId`], which packs `(storage, page, slot)` so that
//! numeric comparison is the global lock order, and a transaction only
//! acquires locks in strictly ascending id order.
//!
//! The **current lock list** (CLL) is a sorted vector with one entry per
//! lockable the transaction wants: desired mode, taken mode, and the MCS
//! block of a held lock. To take a lock whose id is lower than something
//! already held, the transaction first releases every held entry after it,
//! takes the new lock, and lets the ascending walk re-acquire the rest.
//! Upgrades go in place when the holder is alone; otherwise demote,
//! then re-acquire as exclusive at the right position.
//!
//! The **retrospective lock list** (RLL) is what an abort leaves behind:
//! every lock the attempt wanted (its CLL) plus shared intents for
//! everything it read. The next `activate` pre-seeds the CLL from the RLL
//! so the retry takes the contested locks up-front, in order, before
//! re-running the work: a per-thread, self-tuning answer to repeated
//! aborts.

use crate::storage::page::StorageId;
use crate::xct::access::LockablePtr;
use crate::xct::mcs_lock::{LockMode, McsBlockIndex, McsContext, TryLockOutcome};

const PAGE_BITS: u64 = 28;
const SLOT_BITS: u64 = 20;
const PAGE_SHIFT: u64 = SLOT_BITS;
const STORAGE_SHIFT: u64 = SLOT_BITS + PAGE_BITS;

/// Totally orders all lockable record headers in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UniversalLockId(u64);

impl UniversalLockId {
    pub fn new(storage_id: StorageId, page_index: u64, slot: u32) -> UniversalLockId {
        debug_assert!(storage_id < (1 << 16));
        debug_assert!(page_index < (1 << PAGE_BITS));
        debug_assert!((slot as u64) < (1 << SLOT_BITS));
        UniversalLockId(
            ((storage_id as u64) << STORAGE_SHIFT) | (page_index << PAGE_SHIFT) | slot as u64,
        )
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// One lockable the transaction wants (and may hold).
pub struct LockEntry {
    pub id: UniversalLockId,
    pub owner: LockablePtr,
    pub preferred_mode: LockMode,
    pub taken_mode: Option<LockMode>,
    pub mcs_block: McsBlockIndex,
}

impl LockEntry {
    fn is_satisfied(&self) -> bool {
        match (self.taken_mode, self.preferred_mode) {
            (Some(LockMode::Exclusive), _) => true,
            (Some(LockMode::Shared), LockMode::Shared) => true,
            _ => false,
        }
    }
}

/// The ordered per-transaction lock list.
pub struct CurrentLockList {
    entries: Vec<LockEntry>,
}

impl CurrentLockList {
    pub fn new() -> CurrentLockList {
        CurrentLockList {
            entries: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        debug_assert!(self.entries.iter().all(|e| e.taken_mode.is_none()));
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when no entry currently holds a lock.
    pub fn no_locks_held(&self) -> bool {
        self.entries.iter().all(|e| e.taken_mode.is_none())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[LockEntry] {
        &self.entries
    }

    /// Finds or inserts the entry for `id`, escalating the preferred mode
    /// if a stronger one is requested. Returns the entry's position.
    pub fn get_or_add(
        &mut self,
        id: UniversalLockId,
        owner: LockablePtr,
        preferred_mode: LockMode,
    ) -> usize {
        match self.entries.binary_search_by_key(&id, |e| e.id) {
            Ok(pos) => {
                if preferred_mode == LockMode::Exclusive {
                    self.entries[pos].preferred_mode = LockMode::Exclusive;
                }
                pos
            }
            Err(pos) => {
                self.entries.insert(
                    pos,
                    LockEntry {
                        id,
                        owner,
                        preferred_mode,
                        taken_mode: None,
                        mcs_block: 0,
                    },
                );
                pos
            }
        }
    }

    /// Seeds entries (not yet acquired) from a retrospective list.
    /// Must be called on an empty list; preserves the RLL's order.
    pub fn prepopulate_from_retrospective(&mut self, rll: &RetrospectiveLockList) {
        debug_assert!(self.entries.is_empty());
        for entry in &rll.entries {
            self.entries.push(LockEntry {
                id: entry.id,
                owner: entry.owner,
                preferred_mode: entry.preferred_mode,
                taken_mode: None,
                mcs_block: 0,
            });
        }
    }

    /// True when this transaction holds the exclusive lock for `id`.
    pub fn is_exclusively_locked_by_self(&self, id: UniversalLockId) -> bool {
        match self.entries.binary_search_by_key(&id, |e| e.id) {
            Ok(pos) => self.entries[pos].taken_mode == Some(LockMode::Exclusive),
            Err(_) => false,
        }
    }

    /// Acquires every entry in ascending order, in its preferred mode.
    ///
    /// Walking ascending keeps the invariant by construction, except when
    /// an earlier entry needs (re-)acquisition while later entries are
    /// already held; then the later ones are released first and the walk
    /// re-acquires them. Blocking waits are deadlock-free because every
    /// transaction requests in the same global order.
    pub fn acquire_all_ascending(&mut self, ctx: &McsContext<'_>, cursor: &mut u32) {
        let mut idx = 0;
        while idx < self.entries.len() {
            if !self.entries[idx].is_satisfied() {
                if self.any_taken_after(idx) {
                    self.release_after_position(idx, ctx);
                }
                self.acquire_at(idx, ctx, cursor);
            }
            idx += 1;
        }
    }

    fn any_taken_after(&self, idx: usize) -> bool {
        self.entries[idx + 1..].iter().any(|e| e.taken_mode.is_some())
    }

    /// Acquires the entry at `idx` in its preferred mode, upgrading or
    /// demote-reacquiring as needed. Every held entry after `idx` must
    /// already be released.
    fn acquire_at(&mut self, idx: usize, ctx: &McsContext<'_>, cursor: &mut u32) {
        debug_assert!(!self.any_taken_after(idx));
        let entry = &mut self.entries[idx];
        let owner = entry.owner;
        match (entry.taken_mode, entry.preferred_mode) {
            (Some(LockMode::Exclusive), _) | (Some(LockMode::Shared), LockMode::Shared) => {}
            (Some(LockMode::Shared), LockMode::Exclusive) => {
                let lock = &owner.as_ref().lock;
                match lock.try_upgrade(ctx, cursor) {
                    Some(block) => {
                        entry.taken_mode = Some(LockMode::Exclusive);
                        entry.mcs_block = block;
                    }
                    None => {
                        // Demote, then re-acquire as exclusive.
                        lock.unlock(LockMode::Shared, ctx, entry.mcs_block);
                        entry.taken_mode = None;
                        entry.mcs_block = 0;
                        let block = lock.lock(LockMode::Exclusive, ctx, cursor);
                        entry.taken_mode = Some(LockMode::Exclusive);
                        entry.mcs_block = block;
                    }
                }
            }
            (None, mode) => {
                let block = owner.as_ref().lock.lock(mode, ctx, cursor);
                entry.taken_mode = Some(mode);
                entry.mcs_block = block;
            }
        }
    }

    /// Tries to take the entry at `idx` without blocking.
    pub fn try_acquire_at(
        &mut self,
        idx: usize,
        ctx: &McsContext<'_>,
        cursor: &mut u32,
    ) -> TryLockOutcome {
        let entry = &mut self.entries[idx];
        if entry.is_satisfied() {
            return TryLockOutcome::Acquired(entry.mcs_block);
        }
        let mode = entry.preferred_mode;
        let outcome = entry.owner.as_ref().lock.try_lock(mode, ctx, cursor);
        if let TryLockOutcome::Acquired(block) = outcome {
            entry.taken_mode = Some(mode);
            entry.mcs_block = block;
        }
        outcome
    }

    /// Releases every held entry at a position strictly after `idx`, in
    /// descending order.
    pub fn release_after_position(&mut self, idx: usize, ctx: &McsContext<'_>) {
        for pos in (idx + 1..self.entries.len()).rev() {
            self.release_at(pos, ctx);
        }
    }

    /// Releases everything held, in descending order.
    pub fn release_all(&mut self, ctx: &McsContext<'_>) {
        for pos in (0..self.entries.len()).rev() {
            self.release_at(pos, ctx);
        }
    }

    fn release_at(&mut self, pos: usize, ctx: &McsContext<'_>) {
        let entry = &mut self.entries[pos];
        if let Some(mode) = entry.taken_mode.take() {
            entry.owner.as_ref().lock.unlock(mode, ctx, entry.mcs_block);
            entry.mcs_block = 0;
        }
    }
}

impl Default for CurrentLockList {
    fn default() -> Self {
        Self::new()
    }
}

/// A lock the previous attempt wanted, remembered across the abort.
#[derive(Clone, Copy)]
pub struct RetrospectiveEntry {
    pub id: UniversalLockId,
    pub owner: LockablePtr,
    pub preferred_mode: LockMode,
}

/// Lock set surviving from the previous abort of the same logical
/// transaction.
pub struct RetrospectiveLockList {
    entries: Vec<RetrospectiveEntry>,
}

impl RetrospectiveLockList {
    pub fn new() -> RetrospectiveLockList {
        RetrospectiveLockList {
            entries: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[RetrospectiveEntry] {
        &self.entries
    }

    /// Rebuilds the list from an aborting transaction's CLL plus shared
    /// intents for its reads. CLL modes win over read intents.
    pub fn construct(
        &mut self,
        cll: &CurrentLockList,
        reads: impl Iterator<Item = (UniversalLockId, LockablePtr)>,
    ) {
        self.entries.clear();
        for entry in cll.entries() {
            self.entries.push(RetrospectiveEntry {
                id: entry.id,
                owner: entry.owner,
                preferred_mode: entry.preferred_mode,
            });
        }
        for (id, owner) in reads {
            match self.entries.binary_search_by_key(&id, |e| e.id) {
                Ok(_) => {} // already wanted, keep the stronger CLL mode
                Err(pos) => self.entries.insert(
                    pos,
                    RetrospectiveEntry {
                        id,
                        owner,
                        preferred_mode: LockMode::Shared,
                    },
                ),
            }
        }
        debug_assert!(self.entries.windows(2).all(|w| w[0].id < w[1].id));
    }

    pub fn contains(&self, id: UniversalLockId) -> bool {
        self.entries.binary_search_by_key(&id, |e| e.id).is_ok()
    }
}

impl Default for RetrospectiveLockList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xct::mcs_lock::McsBlockArena;
    use crate::xct::xct_id::RwLockableXctId;

    fn setup() -> (Vec<RwLockableXctId>, Vec<McsBlockArena>) {
        let records = (0..4).map(|_| RwLockableXctId::new()).collect();
        (records, vec![McsBlockArena::new()])
    }

    fn id(slot: u32) -> UniversalLockId {
        UniversalLockId::new(1, 0, slot)
    }

    #[test]
    fn universal_lock_id_orders_by_storage_page_slot() {
        let a = UniversalLockId::new(1, 0, 5);
        let b = UniversalLockId::new(1, 0, 6);
        let c = UniversalLockId::new(1, 1, 0);
        let d = UniversalLockId::new(2, 0, 0);
        assert!(a < b && b < c && c < d);
    }

    #[test]
    fn get_or_add_keeps_entries_sorted() {
        let (records, _) = setup();
        let mut cll = CurrentLockList::new();
        cll.get_or_add(id(2), LockablePtr::from_ref(&records[2]), LockMode::Shared);
        cll.get_or_add(id(0), LockablePtr::from_ref(&records[0]), LockMode::Exclusive);
        cll.get_or_add(id(1), LockablePtr::from_ref(&records[1]), LockMode::Shared);
        let ids: Vec<_> = cll.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![id(0), id(1), id(2)]);
    }

    #[test]
    fn get_or_add_escalates_preferred_mode() {
        let (records, _) = setup();
        let mut cll = CurrentLockList::new();
        let pos = cll.get_or_add(id(0), LockablePtr::from_ref(&records[0]), LockMode::Shared);
        assert_eq!(cll.entries()[pos].preferred_mode, LockMode::Shared);
        let pos = cll.get_or_add(id(0), LockablePtr::from_ref(&records[0]), LockMode::Exclusive);
        assert_eq!(cll.entries()[pos].preferred_mode, LockMode::Exclusive);
        assert_eq!(cll.len(), 1);
    }

    #[test]
    fn acquire_all_takes_every_preferred_mode() {
        let (records, arenas) = setup();
        let ctx = McsContext {
            arenas: &arenas,
            thread_id: 0,
        };
        let mut cursor = 0;
        let mut cll = CurrentLockList::new();
        cll.get_or_add(id(0), LockablePtr::from_ref(&records[0]), LockMode::Exclusive);
        cll.get_or_add(id(1), LockablePtr::from_ref(&records[1]), LockMode::Shared);
        cll.acquire_all_ascending(&ctx, &mut cursor);
        assert!(records[0].lock.is_locked_exclusive());
        assert_eq!(records[1].lock.reader_count(), 1);
        assert!(cll.is_exclusively_locked_by_self(id(0)));
        assert!(!cll.is_exclusively_locked_by_self(id(1)));
        cll.release_all(&ctx);
        assert!(!records[0].lock.is_locked_exclusive());
        assert_eq!(records[1].lock.reader_count(), 0);
        assert!(cll.no_locks_held());
    }

    #[test]
    fn lower_insert_releases_and_reacquires_later_locks() {
        let (records, arenas) = setup();
        let ctx = McsContext {
            arenas: &arenas,
            thread_id: 0,
        };
        let mut cursor = 0;
        let mut cll = CurrentLockList::new();
        cll.get_or_add(id(2), LockablePtr::from_ref(&records[2]), LockMode::Exclusive);
        cll.acquire_all_ascending(&ctx, &mut cursor);
        assert!(records[2].lock.is_locked_exclusive());

        // A new, lower lock arrives; the walk must let go of id(2) first,
        // then end up holding both.
        cll.get_or_add(id(0), LockablePtr::from_ref(&records[0]), LockMode::Exclusive);
        cll.acquire_all_ascending(&ctx, &mut cursor);
        assert!(records[0].lock.is_locked_exclusive());
        assert!(records[2].lock.is_locked_exclusive());
        cll.release_all(&ctx);
    }

    #[test]
    fn sole_reader_upgrades_in_place() {
        let (records, arenas) = setup();
        let ctx = McsContext {
            arenas: &arenas,
            thread_id: 0,
        };
        let mut cursor = 0;
        let mut cll = CurrentLockList::new();
        cll.get_or_add(id(1), LockablePtr::from_ref(&records[1]), LockMode::Shared);
        cll.acquire_all_ascending(&ctx, &mut cursor);
        assert_eq!(records[1].lock.reader_count(), 1);

        cll.get_or_add(id(1), LockablePtr::from_ref(&records[1]), LockMode::Exclusive);
        cll.acquire_all_ascending(&ctx, &mut cursor);
        assert!(records[1].lock.is_locked_exclusive());
        assert_eq!(records[1].lock.reader_count(), 0);
        cll.release_all(&ctx);
    }

    #[test]
    fn rll_construct_merges_cll_and_reads() {
        let (records, _) = setup();
        let mut cll = CurrentLockList::new();
        cll.get_or_add(id(1), LockablePtr::from_ref(&records[1]), LockMode::Exclusive);
        let mut rll = RetrospectiveLockList::new();
        rll.construct(
            &cll,
            vec![
                (id(0), LockablePtr::from_ref(&records[0])),
                (id(1), LockablePtr::from_ref(&records[1])),
            ]
            .into_iter(),
        );
        assert_eq!(rll.len(), 2);
        assert_eq!(rll.entries()[0].id, id(0));
        assert_eq!(rll.entries()[0].preferred_mode, LockMode::Shared);
        // The CLL's exclusive intent wins over the read intent.
        assert_eq!(rll.entries()[1].preferred_mode, LockMode::Exclusive);
    }

    #[test]
    fn prepopulate_preserves_rll_order_without_acquiring() {
        let (records, _) = setup();
        let mut cll = CurrentLockList::new();
        cll.get_or_add(id(3), LockablePtr::from_ref(&records[3]), LockMode::Exclusive);
        let mut rll = RetrospectiveLockList::new();
        rll.construct(
            &cll,
            std::iter::once((id(0), LockablePtr::from_ref(&records[0]))),
        );

        let mut fresh = CurrentLockList::new();
        fresh.prepopulate_from_retrospective(&rll);
        assert_eq!(fresh.len(), 2);
        assert!(fresh.no_locks_held());
        assert_eq!(fresh.entries()[0].id, id(0));
        assert_eq!(fresh.entries()[1].id, id(3));
    }
}
