//! # Snapshot Manager
//!
//! Owns the snapshot lifecycle: remembers the latest published snapshot,
//! runs the gleaner (periodically, when the volatile pool runs low, or
//! on explicit request), and serializes runs so only one snapshot is ever
//! in flight. A failed or stopped run changes nothing; the previous
//! snapshot remains the latest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::options::EngineOptions;
use crate::epoch::EpochClock;
use crate::error::ErrorCode;
use crate::log::manager::LogManager;
use crate::memory::PagePool;
use crate::snapshot::gleaner::{error_code_of, GleanResult, LogGleaner};
use crate::snapshot::snapshot::Snapshot;
use crate::snapshot::writer::SnapshotPageCache;
use crate::storage::StorageManager;
use crate::xct::XctManager;

pub struct SnapshotManager {
    options: Arc<EngineOptions>,
    clock: Arc<EpochClock>,
    storages: Arc<StorageManager>,
    pool: Arc<PagePool>,
    xct: Arc<XctManager>,
    log: Arc<LogManager>,
    cache: Arc<SnapshotPageCache>,
    previous: Mutex<Option<Snapshot>>,
    /// Serializes gleaner runs.
    run_lock: Mutex<()>,
    trigger_gate: Mutex<bool>,
    trigger_cv: Condvar,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SnapshotManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: Arc<EngineOptions>,
        clock: Arc<EpochClock>,
        storages: Arc<StorageManager>,
        pool: Arc<PagePool>,
        xct: Arc<XctManager>,
        log: Arc<LogManager>,
        cache: Arc<SnapshotPageCache>,
        previous: Option<Snapshot>,
    ) -> Arc<SnapshotManager> {
        Arc::new(SnapshotManager {
            options,
            clock,
            storages,
            pool,
            xct,
            log,
            cache,
            previous: Mutex::new(previous),
            run_lock: Mutex::new(()),
            trigger_gate: Mutex::new(false),
            trigger_cv: Condvar::new(),
            stop: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        self.previous.lock().clone()
    }

    /// Starts the background trigger thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.thread.lock();
        if guard.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        let interval = Duration::from_millis(self.options.snapshot.snapshot_interval_milliseconds);
        let handle = std::thread::Builder::new()
            .name("pactdb-snapshot".to_string())
            .spawn(move || {
                info!("snapshot manager started");
                loop {
                    {
                        let mut gate = manager.trigger_gate.lock();
                        if !*gate {
                            manager.trigger_cv.wait_for(&mut gate, interval);
                        }
                        *gate = false;
                    }
                    if manager.stop.load(Ordering::Acquire) {
                        break;
                    }
                    if !manager.snapshot_due() {
                        continue;
                    }
                    match manager.take_snapshot() {
                        Ok(result) => info!(
                            snapshot_id = result.snapshot.id,
                            dropped_pages = result.dropped_pages,
                            "periodic snapshot complete"
                        ),
                        Err(error) => {
                            if error_code_of(&error) == Some(ErrorCode::SnapshotInvalidEpoch) {
                                debug!("nothing new to snapshot");
                            } else {
                                warn!(%error, "snapshot attempt failed");
                            }
                        }
                    }
                }
                info!("snapshot manager stopped");
            })
            .expect("spawning snapshot manager");
        *guard = Some(handle);
    }

    fn snapshot_due(&self) -> bool {
        // The interval elapsed (that is what woke us), or the volatile
        // pool is under pressure. A threshold of 100 disables the
        // pool-pressure trigger.
        let percent = self.options.snapshot.snapshot_trigger_page_pool_percent;
        let durable_moved = {
            let previous = self.previous.lock();
            match previous.as_ref() {
                Some(snapshot) => {
                    let durable = self.clock.durable();
                    durable.is_valid() && snapshot.valid_until_epoch.before(durable)
                }
                None => self.clock.durable().is_valid(),
            }
        };
        durable_moved || (percent < 100 && self.pool.free_percent() < percent)
    }

    /// Runs one snapshot now, on the calling thread. Exactly one runs at
    /// a time; concurrent callers queue on the run lock.
    pub fn take_snapshot(&self) -> Result<GleanResult> {
        let _run = self.run_lock.lock();
        // Everything committed so far must be durable to be eligible.
        self.log.flush_now()?;
        let previous = self.previous.lock().clone();
        let gleaner = LogGleaner {
            options: Arc::clone(&self.options),
            clock: Arc::clone(&self.clock),
            storages: Arc::clone(&self.storages),
            pool: Arc::clone(&self.pool),
            xct: Arc::clone(&self.xct),
            log: Arc::clone(&self.log),
            cache: Arc::clone(&self.cache),
            stop: Arc::clone(&self.stop),
        };
        let result = gleaner.execute(previous.as_ref())?;
        *self.previous.lock() = Some(result.snapshot.clone());
        Ok(result)
    }

    /// Requests a snapshot. With `wait_completion` the snapshot runs on
    /// this thread and the result returns; otherwise the background
    /// thread is nudged.
    pub fn trigger_snapshot_immediate(
        &self,
        wait_completion: bool,
    ) -> Result<Option<GleanResult>> {
        if wait_completion {
            self.take_snapshot().map(Some)
        } else {
            *self.trigger_gate.lock() = true;
            self.trigger_cv.notify_all();
            Ok(None)
        }
    }

    /// Stops the background thread. Idempotent; never interrupts a
    /// snapshot mid-run (the run lock serializes).
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        {
            let mut gate = self.trigger_gate.lock();
            *gate = true;
            self.trigger_cv.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}
