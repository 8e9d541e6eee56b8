//! # Engine Lifecycle
//!
//! The engine is the process-wide resource every subsystem hangs off.
//! Initialization is ordered: memory pools, then the log subsystem,
//! then storages (restored from the latest snapshot manifest if one
//! exists), then the snapshot manager, then the transaction manager's
//! barrier state. Teardown reverses it. `shutdown` is idempotent:
//! it can be called explicitly for error handling, and `Drop` calls it
//! again harmlessly.
//!
//! Worker threads get a preallocated [`ThreadContext`] by index and own
//! it for their lifetime; contexts refer back to the engine through
//! `Arc`s and ids rather than references, which is what lets a context
//! move into a thread.
//!
//! ```ignore
//! let engine = Engine::open(EngineOptions::default())?;
//! let mut ctx = engine.thread_context(0)?;
//! let accounts = engine.storage_manager().create_array("accounts", 16, 1024)?;
//! engine.xct_manager().begin_xct(&mut ctx, IsolationLevel::Serializable)?;
//! accounts.as_array()?.overwrite_record(ctx.xct_mut(), 7, &amount, 0)?;
//! let mut commit_epoch = Epoch::invalid();
//! engine.xct_manager().precommit_xct(&mut ctx, &mut commit_epoch)?;
//! engine.xct_manager().wait_for_commit(commit_epoch)?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use parking_lot::Mutex;
use tracing::info;

use crate::config::options::EngineOptions;
use crate::epoch::{Epoch, EpochClock};
use crate::log::buffer::ThreadLogBuffer;
use crate::log::manager::LogManager;
use crate::memory::PagePool;
use crate::snapshot::manager::SnapshotManager;
use crate::snapshot::snapshot::SnapshotManifest;
use crate::snapshot::writer::{SnapshotFileSet, SnapshotPageCache};
use crate::storage::StorageManager;
use crate::thread::ThreadContext;
use crate::xct::mcs_lock::McsBlockArena;
use crate::xct::XctManager;

pub struct Engine {
    options: Arc<EngineOptions>,
    clock: Arc<EpochClock>,
    pool: Arc<PagePool>,
    cache: Arc<SnapshotPageCache>,
    storages: Arc<StorageManager>,
    log: Arc<LogManager>,
    xct: Arc<XctManager>,
    snapshot: Arc<SnapshotManager>,
    contexts: Mutex<Vec<Option<ThreadContext>>>,
    running: AtomicBool,
}

impl Engine {
    /// Opens (or re-opens) an engine over `options.base_path`. When a
    /// snapshot manifest exists there, every storage it describes is
    /// restored and the epoch clock resumes past the snapshot's range.
    pub fn open(options: EngineOptions) -> Result<Engine> {
        options.save()?;
        let options = Arc::new(options);
        let manifest = SnapshotManifest::load(&options.base_path)?;

        let clock = Arc::new(match &manifest {
            Some(manifest) => EpochClock::resume(
                manifest.valid_until_epoch.one_more(),
                Epoch::invalid(),
            ),
            None => EpochClock::new(),
        });

        // Memory first: the page pool and the snapshot page cache.
        let pool = Arc::new(PagePool::new(options.memory.page_pool_pages as usize));
        let node_dirs = (0..options.numa_node_count)
            .map(|node| {
                options
                    .base_path
                    .join(options.snapshot.convert_folder_path_pattern(node))
            })
            .collect();
        let cache = Arc::new(SnapshotPageCache::new(SnapshotFileSet::new(node_dirs)));

        // Log subsystem.
        let buffers: Vec<Arc<ThreadLogBuffer>> = (0..options.thread_count)
            .map(|thread| {
                Arc::new(ThreadLogBuffer::new(
                    thread,
                    options.log.log_buffer_kb as usize * 1024,
                ))
            })
            .collect();
        // A restart from a snapshot starts the log over: everything the
        // snapshot covers is redundant, everything past it is lost by
        // design (no log replay).
        let log = Arc::new(LogManager::new(
            &options.log,
            &options.base_path,
            Arc::clone(&clock),
            buffers.clone(),
            manifest.is_some(),
        )?);

        // Storages, restored from the manifest when present.
        let storages = Arc::new(StorageManager::new(
            Arc::clone(&pool),
            Arc::clone(&cache),
            options.thread_count,
        ));
        if let Some(manifest) = &manifest {
            storages.restore(&manifest.storages)?;
            info!(
                snapshot_id = manifest.snapshot_id,
                storages = manifest.storages.len(),
                "storages restored from snapshot"
            );
        }

        // Transaction manager, then the snapshot manager that pauses it.
        let xct = Arc::new(XctManager::new(
            Arc::clone(&clock),
            Arc::clone(&storages),
            Arc::clone(&log),
        ));
        let snapshot = SnapshotManager::new(
            Arc::clone(&options),
            Arc::clone(&clock),
            Arc::clone(&storages),
            Arc::clone(&pool),
            Arc::clone(&xct),
            Arc::clone(&log),
            Arc::clone(&cache),
            manifest.as_ref().map(|m| m.to_snapshot()),
        );

        let arenas = Arc::new(
            (0..options.thread_count)
                .map(|_| McsBlockArena::new())
                .collect::<Vec<_>>(),
        );
        let contexts = (0..options.thread_count)
            .map(|thread| {
                Some(ThreadContext::new(
                    thread,
                    &options,
                    Arc::clone(&buffers[thread as usize]),
                    Arc::clone(&arenas),
                ))
            })
            .collect();

        log.start();
        snapshot.start();
        info!(
            base_path = %options.base_path.display(),
            threads = options.thread_count,
            nodes = options.numa_node_count,
            "engine started"
        );
        Ok(Engine {
            options,
            clock,
            pool,
            cache,
            storages,
            log,
            xct,
            snapshot,
            contexts: Mutex::new(contexts),
            running: AtomicBool::new(true),
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn epoch_clock(&self) -> &Arc<EpochClock> {
        &self.clock
    }

    pub fn page_pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    pub fn snapshot_page_cache(&self) -> &Arc<SnapshotPageCache> {
        &self.cache
    }

    pub fn storage_manager(&self) -> &Arc<StorageManager> {
        &self.storages
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn xct_manager(&self) -> &Arc<XctManager> {
        &self.xct
    }

    pub fn snapshot_manager(&self) -> &Arc<SnapshotManager> {
        &self.snapshot
    }

    /// Hands out the preallocated context for `thread_id`. Each context
    /// can be taken once; the owning thread keeps it for its lifetime.
    pub fn thread_context(&self, thread_id: u16) -> Result<ThreadContext> {
        let mut contexts = self.contexts.lock();
        let Some(slot) = contexts.get_mut(thread_id as usize) else {
            bail!(
                "thread id {thread_id} out of range ({} contexts)",
                contexts.len()
            );
        };
        match slot.take() {
            Some(ctx) => Ok(ctx),
            None => bail!("thread context {thread_id} already taken"),
        }
    }

    /// Returns a context so another thread may take it later.
    pub fn return_thread_context(&self, ctx: ThreadContext) {
        let mut contexts = self.contexts.lock();
        let index = ctx.thread_id() as usize;
        contexts[index] = Some(ctx);
    }

    /// Stops background threads and flushes the log. Idempotent; `Drop`
    /// calls it too.
    pub fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        // Reverse of initialization: snapshot manager first, then log.
        self.snapshot.stop();
        self.log.stop()?;
        info!("engine shut down");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
