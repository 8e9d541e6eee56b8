//! # Transaction Manager
//!
//! Drives begin / precommit / abort and the Silo-style validation
//! protocol:
//!
//! 1. **Lock**: every write's exclusive lock is merged into the CLL and
//!    taken in ascending universal-lock-id order (releasing and
//!    re-acquiring later entries when a lower id arrives late), which
//!    makes waiting deadlock-free.
//! 2. **Fence**: the thread publishes its in-commit epoch marker and
//!    reads the global epoch it will commit in.
//! 3. **Validate**: every read-set entry must still carry the observed
//!    ownership word; every pointer-set and page-version-set entry must
//!    be unchanged. Any difference aborts.
//! 4. **Apply**: a fresh commit id (strictly after everything this
//!    transaction depends on) is installed into each written record under
//!    the `BEING_WRITTEN` bracket, appends materialize, and the log
//!    records publish to the thread's log buffer.
//! 5. **Release**: locks go in descending order; the RLL clears on
//!    success or is reseeded on abort.
//!
//! A failed precommit aborts internally: locks released, RLL seeded from
//! the CLL and read set, transaction deactivated. The caller sees
//! `RaceAbort` and may simply begin again; the pre-seeded CLL then takes
//! the contested locks up-front.
//!
//! The manager also owns the **pause barrier**: `pause_all_xcts` stops
//! new transactions from starting and waits until every active one
//! drains, giving `drop_volatiles` its quiescent window.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::epoch::{Epoch, EpochClock};
use crate::error::{CodeResult, ErrorCode};
use crate::log::manager::LogManager;
use crate::log::record::LogRecord;
use crate::storage::StorageManager;
use crate::thread::ThreadContext;
use crate::xct::access::WriteXctAccess;
use crate::xct::mcs_lock::{LockMode, McsContext};
use crate::xct::xct_id::{XctId, FLAG_BEING_WRITTEN};
use crate::xct::{IsolationLevel, Xct};

struct PauseState {
    pause_requested: bool,
    active_xcts: u32,
}

struct PauseBarrier {
    state: Mutex<PauseState>,
    /// Workers wait here while a pause is in effect.
    resume_cv: Condvar,
    /// The pauser waits here for active transactions to drain.
    drained_cv: Condvar,
}

pub struct XctManager {
    clock: Arc<EpochClock>,
    storages: Arc<StorageManager>,
    log: Arc<LogManager>,
    pause: PauseBarrier,
}

/// Releases the transaction pause when dropped.
pub struct PauseGuard<'a> {
    manager: &'a XctManager,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.manager.pause.state.lock();
        state.pause_requested = false;
        self.manager.pause.resume_cv.notify_all();
    }
}

impl XctManager {
    pub fn new(
        clock: Arc<EpochClock>,
        storages: Arc<StorageManager>,
        log: Arc<LogManager>,
    ) -> XctManager {
        XctManager {
            clock,
            storages,
            log,
            pause: PauseBarrier {
                state: Mutex::new(PauseState {
                    pause_requested: false,
                    active_xcts: 0,
                }),
                resume_cv: Condvar::new(),
                drained_cv: Condvar::new(),
            },
        }
    }

    /// Begins a transaction on this thread context. If the previous
    /// attempt aborted, the locks it wanted are re-acquired up-front, in
    /// ascending order, before control returns to the caller.
    pub fn begin_xct(
        &self,
        ctx: &mut ThreadContext,
        isolation_level: IsolationLevel,
    ) -> CodeResult<()> {
        if ctx.xct.is_active() {
            return Err(ErrorCode::AlreadyActiveXct);
        }
        {
            let mut state = self.pause.state.lock();
            while state.pause_requested {
                self.pause.resume_cv.wait(&mut state);
            }
            state.active_xcts += 1;
        }
        ctx.xct.activate(isolation_level);
        if !ctx.xct.current_lock_list().is_empty() {
            let mcs = McsContext {
                arenas: ctx.arenas.as_slice(),
                thread_id: ctx.thread_id,
            };
            let (cll, cursor, _) = ctx.xct.lock_phase_parts();
            cll.acquire_all_ascending(&mcs, cursor);
            trace!(
                thread_id = ctx.thread_id,
                locks = cll.len(),
                "retrospective locks taken up-front"
            );
        }
        Ok(())
    }

    /// Aborts the active transaction: locks released in descending order,
    /// the retrospective lock list seeded for the retry.
    pub fn abort_xct(&self, ctx: &mut ThreadContext) -> CodeResult<()> {
        if !ctx.xct.is_active() {
            return Err(ErrorCode::NoActiveXct);
        }
        let mcs = McsContext {
            arenas: ctx.arenas.as_slice(),
            thread_id: ctx.thread_id,
        };
        Self::abort_internal(&mut ctx.xct, &mcs);
        self.leave_barrier();
        Ok(())
    }

    fn abort_internal(xct: &mut Xct, mcs: &McsContext<'_>) {
        xct.seed_retrospective_lock_list();
        xct.current_lock_list_mut().release_all(mcs);
        xct.deactivate();
    }

    /// Runs the commit protocol. On success `commit_epoch` receives the
    /// epoch the commit id lies in; hand it to [`wait_for_commit`]
    /// for durability. On `RaceAbort` the transaction has already been
    /// aborted (RLL seeded); the caller retries with a fresh `begin_xct`.
    ///
    /// [`wait_for_commit`]: XctManager::wait_for_commit
    pub fn precommit_xct(
        &self,
        ctx: &mut ThreadContext,
        commit_epoch: &mut Epoch,
    ) -> CodeResult<()> {
        if !ctx.xct.is_active() {
            return Err(ErrorCode::NoActiveXct);
        }
        let mcs = McsContext {
            arenas: ctx.arenas.as_slice(),
            thread_id: ctx.thread_id,
        };

        if ctx.xct.is_read_only() {
            // No locks to take, no id to issue; only validation.
            let valid = Self::validate(&ctx.xct);
            ctx.xct.current_lock_list_mut().release_all(&mcs);
            if !valid {
                Self::abort_internal(&mut ctx.xct, &mcs);
                self.leave_barrier();
                return Err(ErrorCode::RaceAbort);
            }
            *commit_epoch = self.clock.current_global();
            ctx.xct.clear_retrospective_lock_list();
            ctx.xct.deactivate();
            self.leave_barrier();
            return Ok(());
        }

        // Phase 1: exclusive locks for all writes, in ascending id order.
        {
            let (cll, cursor, writes) = ctx.xct.lock_phase_parts();
            for write in writes {
                cll.get_or_add(write.lock_id, write.owner, LockMode::Exclusive);
            }
            cll.acquire_all_ascending(&mcs, cursor);
        }

        // Fence: publish the in-commit marker, then take the epoch this
        // commit will stamp. Re-read until both agree so the log manager
        // can never push the durable epoch past us.
        let epoch = loop {
            let global = self.clock.current_global();
            ctx.log_buffer.mark_in_commit(global);
            if self.clock.current_global() == global {
                break global;
            }
        };

        // Phase 2: validation.
        if !Self::validate(&ctx.xct) {
            ctx.log_buffer.clear_in_commit();
            Self::abort_internal(&mut ctx.xct, &mcs);
            self.leave_barrier();
            debug!(thread_id = ctx.thread_id, "precommit validation failed");
            return Err(ErrorCode::RaceAbort);
        }

        // Commit id: strictly after everything read or written.
        let mut max_dep = XctId::invalid();
        for read in ctx.xct.read_set() {
            max_dep.store_max(read.observed.data_bits());
        }
        for write in ctx.xct.write_set() {
            max_dep.store_max(write.owner.as_ref().load().data_bits());
        }
        let mut commit_in = epoch;
        let id = ctx.xct.issue_next_id(max_dep, &mut commit_in);

        // Phase 3: apply writes under the BEING_WRITTEN bracket, then
        // materialize appends, then publish the log.
        for write in ctx.xct.write_set() {
            let owner = write.owner.as_ref();
            owner.begin_write();
            Self::apply_write(write);
            owner.set_xct_id(id);
        }
        for index in 0..ctx.xct.lock_free_write_set().len() {
            let LogRecord::Append { storage_id, data } = ctx.xct.lock_free_write_set()[index].log
            else {
                continue;
            };
            if let Err(code) =
                self.storages
                    .apply_append(storage_id, ctx.thread_id, data.as_slice(), id)
            {
                // Pool exhaustion mid-apply: the locked writes already
                // carry the new id, so this commit is half-materialized.
                // Unwind the bookkeeping and surface the failure; the
                // engine needs operator attention.
                tracing::error!(storage_id, code = code.code(), "append apply failed mid-commit");
                ctx.log_buffer.clear_in_commit();
                ctx.xct.current_lock_list_mut().release_all(&mcs);
                ctx.xct.clear_retrospective_lock_list();
                ctx.xct.deactivate();
                self.leave_barrier();
                return Err(code);
            }
        }
        for write in ctx.xct.write_set() {
            ctx.log_buffer.append(&write.log, id);
        }
        for lock_free in ctx.xct.lock_free_write_set() {
            ctx.log_buffer.append(&lock_free.log, id);
        }
        ctx.log_buffer.clear_in_commit();

        // Release descending; forget the retrospective list on success.
        ctx.xct.current_lock_list_mut().release_all(&mcs);
        ctx.xct.clear_retrospective_lock_list();
        *commit_epoch = id.epoch();
        ctx.xct.deactivate();
        self.leave_barrier();
        Ok(())
    }

    /// Blocks until all records with epoch ≤ `epoch` are durable on disk.
    pub fn wait_for_commit(&self, epoch: Epoch) -> CodeResult<()> {
        self.log.wait_for_commit(epoch).map_err(|_| ErrorCode::IoError)
    }

    /// The read validation law plus the pointer and page-version guards.
    fn validate(xct: &Xct) -> bool {
        for read in xct.read_set() {
            let current = read.owner.as_ref().load_stable();
            let observed = read.observed;
            // With the lock word split from the id word, our own pending
            // writes have not touched the id yet, so plain inequality of
            // the data bits (including MOVED/DELETED) means a real race.
            if current.without_flag(FLAG_BEING_WRITTEN)
                != observed.without_flag(FLAG_BEING_WRITTEN)
            {
                // A MOVED owner would forward to the relocated record
                // here; neither implemented storage relocates records.
                return false;
            }
        }
        for pointer in xct.pointer_set() {
            if pointer.address.as_ref().volatile() != pointer.observed {
                return false;
            }
        }
        for version in xct.page_version_set() {
            if version.address.as_ref().status() != version.observed {
                return false;
            }
        }
        true
    }

    fn apply_write(write: &WriteXctAccess) {
        match &write.log {
            LogRecord::Overwrite {
                payload_offset,
                data,
                ..
            } => unsafe {
                let bytes = data.as_slice();
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    write.payload.raw().add(*payload_offset as usize),
                    bytes.len(),
                );
            },
            LogRecord::Increment {
                payload_offset,
                delta,
                ..
            } => unsafe {
                let target = write.payload.raw().add(*payload_offset as usize);
                let mut bytes = [0u8; 8];
                std::ptr::copy_nonoverlapping(target, bytes.as_mut_ptr(), 8);
                let updated = i64::from_le_bytes(bytes).wrapping_add(*delta);
                std::ptr::copy_nonoverlapping(updated.to_le_bytes().as_ptr(), target, 8);
            },
            LogRecord::Append { .. } => {
                debug_assert!(false, "appends live in the lock-free write set");
            }
        }
    }

    fn leave_barrier(&self) {
        let mut state = self.pause.state.lock();
        state.active_xcts -= 1;
        if state.pause_requested && state.active_xcts == 0 {
            self.pause.drained_cv.notify_all();
        }
    }

    /// Stops new transactions and waits for active ones to drain. The
    /// returned guard resumes everything on drop. Snapshot pipeline only;
    /// the pause lasts milliseconds.
    pub fn pause_all_xcts(&self) -> PauseGuard<'_> {
        let mut state = self.pause.state.lock();
        state.pause_requested = true;
        while state.active_xcts > 0 {
            self.pause.drained_cv.wait(&mut state);
        }
        drop(state);
        debug!("all transactions paused");
        PauseGuard { manager: self }
    }
}
