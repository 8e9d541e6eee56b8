//! # Log Mapper
//!
//! One mapper per NUMA node. It owns the log files of the worker threads
//! on its node and, for each processing epoch, scans them forward,
//! routing every record to the reducer of the partition that owns it
//! (array records by offset range, sequential records by the source
//! thread's node). Records are staged in per-partition buckets and
//! flushed to the reducer inboxes when a bucket fills, so mappers talk to
//! reducers in batches rather than per record.
//!
//! Commit epochs are nondecreasing within one thread's log file, which is
//! what makes the cursor scheme work: everything before the cursor is
//! older than the current processing epoch, everything after is newer.

use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::epoch::Epoch;
use crate::log::record::{parse_frame, LogKind, ParsedFrame};
use crate::snapshot::mapreduce::{GleanerControl, MapReduceWorker};
use crate::storage::StorageManager;

/// Frames staged for one reducer.
pub struct ReducerInbox {
    frames: Mutex<Vec<ParsedFrame>>,
}

impl ReducerInbox {
    pub fn new() -> ReducerInbox {
        ReducerInbox {
            frames: Mutex::new(Vec::new()),
        }
    }

    pub fn push_batch(&self, batch: &mut Vec<ParsedFrame>) {
        if batch.is_empty() {
            return;
        }
        self.frames.lock().append(batch);
    }

    pub fn drain(&self) -> Vec<ParsedFrame> {
        std::mem::take(&mut self.frames.lock())
    }
}

impl Default for ReducerInbox {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LogMapper {
    control: Arc<GleanerControl>,
    node: u16,
    storages: Arc<StorageManager>,
    partitions: u16,
    /// (source thread, log file path) for every thread on this node.
    files: Vec<(u16, PathBuf)>,
    /// Whole-file read buffers, filled at initialize.
    buffers: Vec<Vec<u8>>,
    cursors: Vec<usize>,
    inboxes: Arc<Vec<ReducerInbox>>,
    buckets: Vec<Vec<ParsedFrame>>,
    bucket_bytes: Vec<usize>,
    bucket_capacity: usize,
}

impl LogMapper {
    pub fn new(
        control: Arc<GleanerControl>,
        node: u16,
        storages: Arc<StorageManager>,
        partitions: u16,
        files: Vec<(u16, PathBuf)>,
        inboxes: Arc<Vec<ReducerInbox>>,
        bucket_kb: u32,
    ) -> LogMapper {
        LogMapper {
            control,
            node,
            storages,
            partitions,
            files,
            buffers: Vec::new(),
            cursors: Vec::new(),
            inboxes,
            buckets: (0..partitions).map(|_| Vec::new()).collect(),
            bucket_bytes: vec![0; partitions as usize],
            bucket_capacity: bucket_kb as usize * 1024,
        }
    }

    fn route(&mut self, source_thread: u16, frame: ParsedFrame) {
        let storage = match self.storages.get(frame.header.storage_id) {
            Ok(storage) => storage,
            Err(_) => {
                warn!(
                    storage_id = frame.header.storage_id,
                    "log record for missing storage; skipped"
                );
                return;
            }
        };
        let partition = storage.partition_of_frame(&frame, source_thread, self.partitions);
        let bytes = frame.header.frame_len as usize;
        let bucket = &mut self.buckets[partition as usize];
        bucket.push(frame);
        self.bucket_bytes[partition as usize] += bytes;
        if self.bucket_bytes[partition as usize] >= self.bucket_capacity {
            self.inboxes[partition as usize].push_batch(bucket);
            self.bucket_bytes[partition as usize] = 0;
        }
    }

    fn flush_all_buckets(&mut self) {
        for partition in 0..self.partitions as usize {
            let bucket = &mut self.buckets[partition];
            self.inboxes[partition].push_batch(bucket);
            self.bucket_bytes[partition] = 0;
        }
    }
}

impl MapReduceWorker for LogMapper {
    fn name(&self) -> String {
        format!("mapper-{}", self.node)
    }

    fn control(&self) -> &GleanerControl {
        &self.control
    }

    fn handle_initialize(&mut self) -> Result<()> {
        self.buffers = self
            .files
            .iter()
            .map(|(_, path)| {
                std::fs::read(path).wrap_err_with(|| format!("reading log {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        self.cursors = vec![0; self.files.len()];
        Ok(())
    }

    fn handle_epoch(&mut self) -> Result<()> {
        let target = self.control.processing_epoch();
        let base = self.control.base_epoch;
        for file_index in 0..self.files.len() {
            let source_thread = self.files[file_index].0;
            loop {
                let cursor = self.cursors[file_index];
                let bytes = &self.buffers[file_index][cursor..];
                let Some((frame, consumed)) = parse_frame(bytes) else {
                    break; // end of file (or torn tail)
                };
                if frame.header.log_kind() == Some(LogKind::Filler) {
                    self.cursors[file_index] += consumed;
                    continue;
                }
                let epoch = Epoch::from_raw(frame.header.epoch);
                if target.before(epoch) {
                    break; // belongs to a later processing epoch
                }
                self.cursors[file_index] += consumed;
                if epoch == target {
                    debug_assert!(base.before(epoch));
                    self.route(source_thread, frame);
                }
                // Anything older was covered by a previous snapshot.
            }
        }
        self.flush_all_buckets();
        debug!(node = self.node, epoch = %target, "mapper epoch drained");
        Ok(())
    }

    fn handle_uninitialize(&mut self) -> Result<()> {
        self.buffers.clear();
        self.cursors.clear();
        Ok(())
    }
}
