//! # Log Manager: Durability and the Epoch Advancer
//!
//! Owns the per-thread log files and the engine's two epoch atomics. A
//! dedicated advancer thread periodically runs one *tick*:
//!
//! 1. Advance the global epoch (new commits stamp the new epoch).
//! 2. Drain every thread's log buffer and append the bytes to that
//!    thread's log file.
//! 3. `fsync` the files that received data.
//! 4. Publish the durable epoch as
//!    `min(previous global, min(in-flight commit markers) − 1)` and
//!    persist the marker, then wake `wait_for_commit` waiters.
//!
//! The in-flight markers make step 4 safe: a committer publishes its
//! intended epoch *before* reading the epoch it commits in (and re-reads
//! the clock until both agree), so any unpublished commit the drain might
//! have missed is visible in the marker scan and holds the durable epoch
//! back.
//!
//! Ticks also run synchronously inside `wait_for_commit`, so durability
//! waits make progress even with a long advancer interval.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::options::LogOptions;
use crate::epoch::{Epoch, EpochClock};
use crate::log::buffer::ThreadLogBuffer;

/// Persisted alongside the log files at every flush boundary.
#[derive(Debug, Serialize, Deserialize)]
struct DurableMarker {
    durable_epoch: u32,
}

const DURABLE_MARKER_FILE: &str = "durable_epoch.json";

struct LogFile {
    file: File,
    dirty: bool,
}

struct LogManagerInner {
    clock: Arc<EpochClock>,
    buffers: Vec<Arc<ThreadLogBuffer>>,
    files: Vec<Mutex<LogFile>>,
    folder: PathBuf,
    /// Serializes ticks between the advancer thread and synchronous
    /// `wait_for_commit` callers.
    tick_lock: Mutex<()>,
    durable_gate: Mutex<()>,
    durable_cv: Condvar,
    stop: AtomicBool,
    stop_gate: Mutex<()>,
    stop_cv: Condvar,
}

pub struct LogManager {
    inner: Arc<LogManagerInner>,
    flush_interval: Duration,
    advancer: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl LogManager {
    /// Opens the per-thread log files. `truncate_existing` discards any
    /// prior content. Used when the engine restarts from a snapshot, at
    /// which point everything the snapshot covers is redundant and
    /// everything past it is lost by design.
    pub fn new(
        options: &LogOptions,
        base_path: &Path,
        clock: Arc<EpochClock>,
        buffers: Vec<Arc<ThreadLogBuffer>>,
        truncate_existing: bool,
    ) -> Result<LogManager> {
        let folder = base_path.join(&options.folder_path);
        std::fs::create_dir_all(&folder)
            .wrap_err_with(|| format!("creating log folder {}", folder.display()))?;
        let mut files = Vec::with_capacity(buffers.len());
        for buffer in &buffers {
            let path = Self::file_path(&folder, buffer.thread_id());
            let mut open_options = OpenOptions::new();
            open_options.create(true);
            if truncate_existing {
                open_options.write(true).truncate(true);
            } else {
                open_options.append(true);
            }
            let file = open_options
                .open(&path)
                .wrap_err_with(|| format!("opening log file {}", path.display()))?;
            files.push(Mutex::new(LogFile { file, dirty: false }));
        }
        Ok(LogManager {
            inner: Arc::new(LogManagerInner {
                clock,
                buffers,
                files,
                folder,
                tick_lock: Mutex::new(()),
                durable_gate: Mutex::new(()),
                durable_cv: Condvar::new(),
                stop: AtomicBool::new(false),
                stop_gate: Mutex::new(()),
                stop_cv: Condvar::new(),
            }),
            flush_interval: Duration::from_millis(options.flush_interval_milliseconds),
            advancer: Mutex::new(None),
        })
    }

    fn file_path(folder: &Path, thread_id: u16) -> PathBuf {
        folder.join(format!("thread_{thread_id:04}.log"))
    }

    pub fn log_file_paths(&self) -> Vec<PathBuf> {
        self.inner
            .buffers
            .iter()
            .map(|b| Self::file_path(&self.inner.folder, b.thread_id()))
            .collect()
    }

    /// Starts the advancer thread. Idempotent.
    pub fn start(&self) {
        let mut guard = self.advancer.lock();
        if guard.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let interval = self.flush_interval;
        let handle = std::thread::Builder::new()
            .name("pactdb-log-advancer".to_string())
            .spawn(move || {
                info!("log advancer started");
                loop {
                    {
                        let mut gate = inner.stop_gate.lock();
                        if inner.stop.load(Ordering::Acquire) {
                            break;
                        }
                        inner.stop_cv.wait_for(&mut gate, interval);
                    }
                    if inner.stop.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(error) = inner.tick() {
                        warn!(%error, "log tick failed; commits cannot become durable");
                    }
                }
                info!("log advancer stopped");
            })
            .expect("spawning log advancer");
        *guard = Some(handle);
    }

    /// Stops the advancer and runs one final tick so everything published
    /// so far becomes durable. Idempotent.
    pub fn stop(&self) -> Result<()> {
        self.inner.stop.store(true, Ordering::Release);
        {
            let _gate = self.inner.stop_gate.lock();
            self.inner.stop_cv.notify_all();
        }
        if let Some(handle) = self.advancer.lock().take() {
            let _ = handle.join();
        }
        self.inner.tick()
    }

    /// Blocks until every record with epoch ≤ `epoch` is on disk.
    pub fn wait_for_commit(&self, epoch: Epoch) -> Result<()> {
        if !epoch.is_valid() {
            return Ok(());
        }
        loop {
            let durable = self.inner.clock.durable();
            if durable.is_valid() && !durable.before(epoch) {
                return Ok(());
            }
            // Drive a tick ourselves rather than waiting a full advancer
            // interval.
            self.inner.tick()?;
            let durable = self.inner.clock.durable();
            if durable.is_valid() && !durable.before(epoch) {
                return Ok(());
            }
            let mut gate = self.inner.durable_gate.lock();
            self.inner
                .durable_cv
                .wait_for(&mut gate, Duration::from_millis(5));
        }
    }

    /// One advance-drain-fsync-publish cycle, callable from any thread.
    pub fn flush_now(&self) -> Result<()> {
        self.inner.tick()
    }
}

impl LogManagerInner {
    fn tick(&self) -> Result<()> {
        let _guard = self.tick_lock.lock();
        let previous_global = self.clock.current_global();
        let new_global = self.clock.advance_global();
        debug!(%previous_global, %new_global, "epoch advanced");

        // Drain buffers into files.
        let mut any_dirty = false;
        for (index, buffer) in self.buffers.iter().enumerate() {
            let bytes = buffer.drain();
            if bytes.is_empty() {
                continue;
            }
            let mut log_file = self.files[index].lock();
            log_file
                .file
                .write_all(&bytes)
                .wrap_err_with(|| format!("appending to log of thread {}", buffer.thread_id()))?;
            log_file.dirty = true;
            any_dirty = true;
        }
        if any_dirty {
            for file in &self.files {
                let mut log_file = file.lock();
                if log_file.dirty {
                    log_file.file.sync_data().wrap_err("fsync log file")?;
                    log_file.dirty = false;
                }
            }
        }

        // The durable epoch may not pass any in-flight commit.
        let mut candidate = Some(previous_global);
        for buffer in &self.buffers {
            let marker = buffer.in_commit_epoch();
            if !marker.is_valid() {
                continue;
            }
            if marker == Epoch::initial() {
                candidate = None;
                break;
            }
            let limit = marker.one_less();
            candidate = match candidate {
                Some(current) if current.before(limit) => Some(current),
                Some(_) => Some(limit),
                None => None,
            };
        }

        if let Some(durable) = candidate {
            if durable.is_valid() {
                let previous = self.clock.durable();
                if !previous.is_valid() || previous.before(durable) {
                    self.persist_durable_marker(durable)?;
                    self.clock.publish_durable(durable);
                    self.durable_cv.notify_all();
                }
            }
        }
        Ok(())
    }

    fn persist_durable_marker(&self, durable: Epoch) -> Result<()> {
        let marker = DurableMarker {
            durable_epoch: durable.raw(),
        };
        let path = self.folder.join(DURABLE_MARKER_FILE);
        std::fs::write(&path, serde_json::to_string(&marker)?)
            .wrap_err_with(|| format!("persisting durable marker {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::{ArenaSlice, LogRecord};
    use crate::xct::xct_id::XctId;

    fn manager_with_buffers(
        dir: &Path,
        threads: u16,
    ) -> (LogManager, Vec<Arc<ThreadLogBuffer>>, Arc<EpochClock>) {
        let clock = Arc::new(EpochClock::new());
        let buffers: Vec<_> = (0..threads)
            .map(|t| Arc::new(ThreadLogBuffer::new(t, 64 * 1024)))
            .collect();
        let manager = LogManager::new(
            &LogOptions::default(),
            dir,
            Arc::clone(&clock),
            buffers.clone(),
            false,
        )
        .unwrap();
        (manager, buffers, clock)
    }

    fn append_one(buffer: &ThreadLogBuffer, epoch: u32) {
        let data = b"payload";
        let record = LogRecord::Overwrite {
            storage_id: 1,
            offset: 0,
            payload_offset: 0,
            data: unsafe { ArenaSlice::new(data.as_ptr(), data.len()) },
        };
        buffer.append(&record, XctId::new(Epoch::from_raw(epoch), 1));
    }

    #[test]
    fn tick_advances_global_and_publishes_durable() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, buffers, clock) = manager_with_buffers(dir.path(), 1);
        append_one(&buffers[0], 1);
        manager.flush_now().unwrap();
        assert_eq!(clock.current_global(), Epoch::from_raw(2));
        assert_eq!(clock.durable(), Epoch::from_raw(1));
    }

    #[test]
    fn in_flight_marker_holds_durable_back() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, buffers, clock) = manager_with_buffers(dir.path(), 2);
        // Move past the initial epoch first.
        manager.flush_now().unwrap();
        manager.flush_now().unwrap();
        assert_eq!(clock.current_global(), Epoch::from_raw(3));

        assert_eq!(clock.durable(), Epoch::from_raw(2));
        // A commit in flight at the current global epoch caps durable at
        // its epoch minus one, so durable cannot advance past it.
        buffers[1].mark_in_commit(Epoch::from_raw(3));
        manager.flush_now().unwrap();
        assert_eq!(clock.durable(), Epoch::from_raw(2));

        buffers[1].clear_in_commit();
        manager.flush_now().unwrap();
        assert_eq!(clock.durable(), Epoch::from_raw(4));
    }

    #[test]
    fn wait_for_commit_returns_once_durable() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, buffers, clock) = manager_with_buffers(dir.path(), 1);
        append_one(&buffers[0], 1);
        manager.wait_for_commit(Epoch::from_raw(1)).unwrap();
        assert!(!clock.durable().before(Epoch::from_raw(1)));
        let log = std::fs::read(&manager.log_file_paths()[0]).unwrap();
        assert!(!log.is_empty());
    }

    #[test]
    fn durable_marker_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, buffers, _clock) = manager_with_buffers(dir.path(), 1);
        append_one(&buffers[0], 1);
        manager.flush_now().unwrap();
        let marker_path = dir
            .path()
            .join(&LogOptions::default().folder_path)
            .join(DURABLE_MARKER_FILE);
        let marker: DurableMarker =
            serde_json::from_str(&std::fs::read_to_string(marker_path).unwrap()).unwrap();
        assert_eq!(marker.durable_epoch, 1);
    }
}
