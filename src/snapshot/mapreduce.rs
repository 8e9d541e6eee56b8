//! # Map-Reduce Worker Base
//!
//! Mappers and reducers share one lifecycle, driven by the gleaner's
//! per-epoch barrier:
//!
//! ```text
//! handle_initialize
//!   └─ wait_for_next_epoch ── handle_epoch ── wait_for_next_epoch ── …
//! handle_uninitialize              (always, even after errors)
//! increment exit_count, wake gleaner
//! ```
//!
//! `wait_for_next_epoch` is where the barrier lives: the worker
//! increments the completed counter (waking the gleaner when it was the
//! last), then sleeps until the gleaner publishes the next processing
//! epoch or requests a stop. A worker whose next epoch would pass the
//! snapshot's `valid_until_epoch` exits the loop instead of sleeping.
//!
//! Errors never unwind past the loop: they bump the shared error counter,
//! wake the gleaner, and fall through to `handle_uninitialize`.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

use eyre::Result;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::epoch::Epoch;

/// Shared control block between the gleaner and its workers.
pub struct GleanerControl {
    /// First epoch of the snapshot range is `base.one_more()`.
    pub base_epoch: Epoch,
    pub valid_until_epoch: Epoch,
    /// Epoch currently being drained through the workers.
    processing_epoch: AtomicU32,
    completed_count: AtomicU16,
    all_count: u16,
    error_count: AtomicU16,
    exit_count: AtomicU16,
    stop_requested: AtomicBool,
    /// Workers wait here, keyed on the processing epoch value.
    epoch_gate: Mutex<()>,
    epoch_cv: Condvar,
    /// The gleaner waits here for the barrier or for errors.
    gleaner_gate: Mutex<()>,
    gleaner_cv: Condvar,
}

impl GleanerControl {
    pub fn new(base_epoch: Epoch, valid_until_epoch: Epoch, all_count: u16) -> GleanerControl {
        GleanerControl {
            base_epoch,
            valid_until_epoch,
            processing_epoch: AtomicU32::new(0),
            completed_count: AtomicU16::new(0),
            all_count,
            error_count: AtomicU16::new(0),
            exit_count: AtomicU16::new(0),
            stop_requested: AtomicBool::new(false),
            epoch_gate: Mutex::new(()),
            epoch_cv: Condvar::new(),
            gleaner_gate: Mutex::new(()),
            gleaner_cv: Condvar::new(),
        }
    }

    pub fn all_count(&self) -> u16 {
        self.all_count
    }

    pub fn processing_epoch(&self) -> Epoch {
        Epoch::from_raw(self.processing_epoch.load(Ordering::Acquire))
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        let _gate = self.epoch_gate.lock();
        self.epoch_cv.notify_all();
    }

    pub fn error_count(&self) -> u16 {
        self.error_count.load(Ordering::Acquire)
    }

    pub fn increment_error_count(&self) {
        self.error_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn exit_count(&self) -> u16 {
        self.exit_count.load(Ordering::Acquire)
    }

    fn increment_completed_count(&self) -> u16 {
        self.completed_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Wakes the gleaner's wait loop.
    pub fn wakeup_gleaner(&self) {
        let _gate = self.gleaner_gate.lock();
        self.gleaner_cv.notify_all();
    }

    /// Gleaner side: publishes the next processing epoch and releases the
    /// workers waiting for it.
    pub fn publish_processing_epoch(&self, epoch: Epoch) {
        self.completed_count.store(0, Ordering::Release);
        let _gate = self.epoch_gate.lock();
        self.processing_epoch.store(epoch.raw(), Ordering::Release);
        self.epoch_cv.notify_all();
    }

    /// Gleaner side: waits until every worker finished the current epoch,
    /// an error surfaced, or every worker exited.
    pub fn wait_for_barrier(&self) {
        let mut gate = self.gleaner_gate.lock();
        loop {
            if self.completed_count.load(Ordering::Acquire) >= self.all_count
                || self.error_count() > 0
                || self.exit_count() >= self.all_count
            {
                return;
            }
            self.gleaner_cv.wait(&mut gate);
        }
    }

    /// Gleaner side: waits for every worker to exit.
    pub fn wait_for_exit(&self) {
        let mut gate = self.gleaner_gate.lock();
        while self.exit_count() < self.all_count {
            self.gleaner_cv.wait(&mut gate);
        }
    }
}

/// One mapper or reducer. `run_worker` drives the lifecycle.
pub trait MapReduceWorker {
    fn name(&self) -> String;
    fn control(&self) -> &GleanerControl;
    fn handle_initialize(&mut self) -> Result<()>;
    /// Work for the current processing epoch.
    fn handle_epoch(&mut self) -> Result<()>;
    fn handle_uninitialize(&mut self) -> Result<()>;
}

/// The shared worker loop.
pub fn run_worker<W: MapReduceWorker>(worker: &mut W) {
    let name = worker.name();
    info!(worker = %name, "snapshot worker started");

    match worker.handle_initialize() {
        Err(init_error) => {
            error!(worker = %name, error = %init_error, "failed to initialize");
            worker.control().increment_error_count();
            worker.control().wakeup_gleaner();
        }
        Ok(()) => {
            let mut current: Option<Epoch> = None;
            if wait_for_next_epoch(worker.control(), &name, &mut current) {
                while !worker.control().is_stop_requested() {
                    debug!(worker = %name, epoch = %worker.control().processing_epoch(), "processing");
                    if let Err(exec_error) = worker.handle_epoch() {
                        error!(worker = %name, error = %exec_error, "error while processing");
                        worker.control().increment_error_count();
                        worker.control().wakeup_gleaner();
                        break;
                    }
                    if !wait_for_next_epoch(worker.control(), &name, &mut current) {
                        break;
                    }
                }
            }
        }
    }

    if let Err(uninit_error) = worker.handle_uninitialize() {
        // The gleaner is winding down either way; just account the error.
        error!(worker = %name, error = %uninit_error, "failed to uninitialize");
        worker.control().increment_error_count();
    }

    worker.control().exit_count.fetch_add(1, Ordering::AcqRel);
    worker.control().wakeup_gleaner();
    info!(worker = %name, "snapshot worker stopped");
}

/// Reports the current epoch complete and sleeps until the next one.
/// Returns false when the worker should exit (range done or stop).
fn wait_for_next_epoch(
    control: &GleanerControl,
    name: &str,
    current: &mut Option<Epoch>,
) -> bool {
    let next = current
        .map(|epoch| epoch.one_more())
        .unwrap_or_else(|| control.base_epoch.one_more());

    let value_after = control.increment_completed_count();
    debug_assert!(value_after <= control.all_count());
    if value_after == control.all_count() {
        // Last one in: the current epoch is fully processed.
        debug!(worker = %name, "last to complete; waking gleaner");
        control.wakeup_gleaner();
    }

    if control.valid_until_epoch.before(next) {
        debug!(worker = %name, "epoch range exhausted");
        return false;
    }

    let mut gate = control.epoch_gate.lock();
    while control.processing_epoch() != next && !control.is_stop_requested() {
        control.epoch_cv.wait(&mut gate);
    }
    drop(gate);
    *current = Some(next);
    !control.is_stop_requested()
}
