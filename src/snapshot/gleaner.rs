//! # Log Gleaner
//!
//! Orchestrates one snapshot end to end:
//!
//! 1. Pick the epoch range `(base, valid_until]`: everything durable that
//!    no previous snapshot covers.
//! 2. Spawn one mapper and one reducer per NUMA node and drain the range
//!    epoch by epoch through the completed-count barrier.
//! 3. Run composers per (storage, partition) over the reducers' sorted
//!    streams, writing new pages through per-node snapshot writers.
//! 4. `construct_root` per storage, seal the snapshot files, publish the
//!    manifest (the atomic rename), install the new root pointers.
//! 5. Pause transactions and `drop_volatiles` partition by partition,
//!    dropping each storage's root volatile page only when every
//!    partition reported the snapshot fully covers it.
//!
//! Worker errors accumulate in the control block; a nonzero error count
//! or an external stop abandons the run before anything publishes; the
//! previous snapshot stays intact.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::config::options::EngineOptions;
use crate::epoch::{Epoch, EpochClock};
use crate::error::ErrorCode;
use crate::log::manager::LogManager;
use crate::log::record::ParsedFrame;
use crate::memory::{DroppedChunk, PagePool};
use crate::snapshot::mapper::{LogMapper, ReducerInbox};
use crate::snapshot::mapreduce::{run_worker, GleanerControl};
use crate::snapshot::reducer::LogReducer;
use crate::snapshot::snapshot::{Snapshot, SnapshotManifest};
use crate::snapshot::writer::{SnapshotPageCache, SnapshotWriter};
use crate::storage::composer::{
    ComposeArguments, Composer, ConstructRootArguments, DropResult, DropVolatilesArguments,
};
use crate::storage::page::{Page, SnapshotPagePointer, StorageId};
use crate::storage::{node_of_thread, StorageManager};
use crate::xct::XctManager;

pub struct LogGleaner {
    pub options: Arc<EngineOptions>,
    pub clock: Arc<EpochClock>,
    pub storages: Arc<StorageManager>,
    pub pool: Arc<PagePool>,
    pub xct: Arc<XctManager>,
    pub log: Arc<LogManager>,
    pub cache: Arc<SnapshotPageCache>,
    pub stop: Arc<AtomicBool>,
}

pub struct GleanResult {
    pub snapshot: Snapshot,
    pub manifest_path: PathBuf,
    pub dropped_pages: u64,
    /// Whether every storage's volatile tree was fully covered and
    /// dropped (the AND over all storages' combined drop results).
    pub dropped_all: bool,
}

impl LogGleaner {
    fn node_dir(&self, node: u16) -> PathBuf {
        self.options
            .base_path
            .join(self.options.snapshot.convert_folder_path_pattern(node))
    }

    pub fn execute(&self, previous: Option<&Snapshot>) -> Result<GleanResult> {
        let valid_until = self.clock.durable();
        if !valid_until.is_valid() {
            return Err(ErrorCode::SnapshotInvalidEpoch.into());
        }
        let base = previous
            .map(|snapshot| snapshot.valid_until_epoch)
            .unwrap_or_else(|| Epoch::initial().one_less());
        if !base.before(valid_until) {
            return Err(ErrorCode::SnapshotInvalidEpoch.into());
        }
        let snapshot_id = previous.map(|snapshot| snapshot.id).unwrap_or(0) + 1;
        let nodes = self.options.numa_node_count;
        info!(
            snapshot_id,
            %base,
            %valid_until,
            nodes,
            "gleaning log records into a new snapshot"
        );

        // Map-reduce over the epoch range.
        let control = Arc::new(GleanerControl::new(base, valid_until, nodes * 2));
        let inboxes: Arc<Vec<ReducerInbox>> =
            Arc::new((0..nodes).map(|_| ReducerInbox::new()).collect());
        let log_paths = self.log.log_file_paths();

        let mut mapper_handles = Vec::new();
        let mut reducer_handles = Vec::new();
        for node in 0..nodes {
            let files: Vec<(u16, PathBuf)> = log_paths
                .iter()
                .enumerate()
                .filter(|(thread, _)| node_of_thread(*thread as u16, nodes) == node)
                .map(|(thread, path)| (thread as u16, path.clone()))
                .collect();
            let mut mapper = LogMapper::new(
                Arc::clone(&control),
                node,
                Arc::clone(&self.storages),
                nodes,
                files,
                Arc::clone(&inboxes),
                self.options.snapshot.log_mapper_bucket_kb,
            );
            mapper_handles.push(
                std::thread::Builder::new()
                    .name(format!("pactdb-mapper-{node}"))
                    .spawn(move || run_worker(&mut mapper))
                    .expect("spawning mapper"),
            );

            let mut reducer = LogReducer::new(
                Arc::clone(&control),
                node,
                Arc::clone(&inboxes),
                self.options.snapshot.log_reducer_buffer_mb,
                self.node_dir(node).join("tmp"),
            );
            reducer_handles.push(
                std::thread::Builder::new()
                    .name(format!("pactdb-reducer-{node}"))
                    .spawn(move || {
                        run_worker(&mut reducer);
                        reducer.into_output()
                    })
                    .expect("spawning reducer"),
            );
        }

        // Drive the per-epoch barrier.
        control.wait_for_barrier();
        let mut epoch = base.one_more();
        while !valid_until.before(epoch) {
            if control.error_count() > 0 || self.stop.load(Ordering::Acquire) {
                control.request_stop();
                break;
            }
            debug!(%epoch, "publishing processing epoch");
            control.publish_processing_epoch(epoch);
            control.wait_for_barrier();
            epoch = epoch.one_more();
        }
        control.wait_for_exit();
        for handle in mapper_handles {
            let _ = handle.join();
        }
        let mut streams_per_partition: Vec<HashMap<StorageId, Vec<ParsedFrame>>> = Vec::new();
        for handle in reducer_handles {
            match handle.join() {
                Ok(Ok(output)) => streams_per_partition.push(output),
                Ok(Err(error)) => {
                    control.increment_error_count();
                    warn!(%error, "reducer output failed");
                    streams_per_partition.push(HashMap::new());
                }
                Err(_) => {
                    control.increment_error_count();
                    streams_per_partition.push(HashMap::new());
                }
            }
        }
        if control.error_count() > 0 {
            bail!(
                "snapshot {snapshot_id} aborted: {} worker error(s); nothing published",
                control.error_count()
            );
        }
        if self.stop.load(Ordering::Acquire) {
            return Err(ErrorCode::SnapshotStopped.into());
        }

        // Compose new pages, partition by partition. Reads of previous
        // snapshot pages go through the engine-wide file set so its maps
        // are shared with the hot-path page cache.
        let fileset = self.cache.fileset();
        let mut writers = Vec::with_capacity(nodes as usize);
        for node in 0..nodes {
            writers.push(SnapshotWriter::create(&self.node_dir(node), snapshot_id, node as u8)?);
        }

        let storages = self.storages.all_storages();
        let mut root_pointers: HashMap<StorageId, SnapshotPagePointer> = HashMap::new();
        let empty_stream: Vec<ParsedFrame> = Vec::new();
        for storage in &storages {
            let composer = Composer::new(storage);
            let mut root_info_pages: Vec<Box<Page>> = Vec::new();
            for partition in 0..nodes {
                let stream = streams_per_partition[partition as usize]
                    .get(&storage.id())
                    .unwrap_or(&empty_stream);
                let root_info = Page::new_zeroed();
                let mut args = ComposeArguments {
                    snapshot_writer: &mut writers[partition as usize],
                    previous_files: fileset,
                    log_stream: stream,
                    base_epoch: base,
                    partition,
                    partitions: nodes,
                    stop_requested: &self.stop,
                    root_info_page: &root_info,
                };
                composer.compose(&mut args)?;
                root_info_pages.push(root_info);
            }
            let mut args = ConstructRootArguments {
                snapshot_writer: &mut writers[0],
                previous_files: fileset,
                root_info_pages: &root_info_pages,
            };
            let root_pointer = composer.construct_root(&mut args)?;
            root_pointers.insert(storage.id(), root_pointer);
        }
        for writer in writers {
            writer.finish()?;
        }

        // Publish: manifest rename is the commit point of the snapshot.
        let snapshot = Snapshot {
            id: snapshot_id,
            base_epoch: base,
            valid_until_epoch: valid_until,
            root_pointers: root_pointers.clone(),
        };
        let mut metadata = self.storages.metadata_snapshot();
        for meta in &mut metadata {
            if let Some(pointer) = root_pointers.get(&meta.id) {
                meta.root_snapshot_pointer = *pointer;
            }
        }
        let manifest = SnapshotManifest {
            snapshot_id,
            base_epoch: base,
            valid_until_epoch: valid_until,
            storages: metadata,
        };
        let manifest_path = manifest.publish(&self.options.base_path)?;
        for storage in &storages {
            if let Some(pointer) = root_pointers.get(&storage.id()) {
                storage.install_root_snapshot(*pointer);
            }
        }
        info!(snapshot_id, manifest = %manifest_path.display(), "snapshot published");

        // Drop volatile pages under the global transaction pause.
        let mut dropped_all = true;
        let dropped_pages = {
            let pause = self.xct.pause_all_xcts();
            let mut chunk = DroppedChunk::new(&self.pool);
            for storage in &storages {
                let composer = Composer::new(storage);
                let new_root_pointer = root_pointers[&storage.id()];
                let mut combined = DropResult::new(&snapshot);
                for partition in 0..nodes {
                    let mut args = DropVolatilesArguments {
                        snapshot: &snapshot,
                        partition,
                        partitions: nodes,
                        dropped_chunk: &mut chunk,
                        policy: self.options.snapshot.keep_volatile_policy,
                        fileset,
                        new_root_pointer,
                    };
                    let result = composer.drop_volatiles(&mut args);
                    combined.combine(&result);
                }
                dropped_all &= combined.safe_to_drop_root(&snapshot) && combined.dropped_all;
                if combined.safe_to_drop_root(&snapshot) {
                    let mut root_chunk = DroppedChunk::new(&self.pool);
                    let args = DropVolatilesArguments {
                        snapshot: &snapshot,
                        partition: 0,
                        partitions: nodes,
                        dropped_chunk: &mut root_chunk,
                        policy: self.options.snapshot.keep_volatile_policy,
                        fileset,
                        new_root_pointer,
                    };
                    composer.drop_root_volatile(&args);
                }
                debug!(
                    storage_id = storage.id(),
                    max_observed = %combined.max_observed,
                    dropped_all = combined.dropped_all,
                    "volatile drop finished for storage"
                );
            }
            chunk.flush();
            let dropped = chunk.dropped_total();
            drop(chunk);
            drop(pause);
            dropped
        };
        info!(snapshot_id, dropped_pages, "volatile pages returned to the pool");

        Ok(GleanResult {
            snapshot,
            manifest_path,
            dropped_pages,
            dropped_all,
        })
    }
}

/// Maps a gleaner failure to its stable code when one applies.
pub fn error_code_of(report: &eyre::Report) -> Option<ErrorCode> {
    report.downcast_ref::<ErrorCode>().copied()
}
