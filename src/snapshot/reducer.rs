//! # Log Reducer
//!
//! One reducer per NUMA node / partition. Each epoch it drains its inbox
//! and accumulates the records; when the accumulation buffer exceeds its
//! budget, the records sort and spill to an on-disk run (in the wire
//! frame format). When the gleaner asks for the final output, the
//! in-memory batch and every spilled run merge into one stream per
//! storage, sorted by `(storage, key, epoch, ordinal)`, which is the
//! order composers consume.
//!
//! Epoch comparison inside the sort key is relative to the snapshot's
//! base epoch, so the key stays monotone even across an epoch-counter
//! wrap.

use std::collections::BinaryHeap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Context, Result};
use hashbrown::HashMap;
use tracing::{debug, info};

use crate::epoch::Epoch;
use crate::log::record::{parse_frame, ParsedFrame, LOG_FRAME_HEADER_SIZE};
use crate::snapshot::mapper::ReducerInbox;
use crate::snapshot::mapreduce::{GleanerControl, MapReduceWorker};
use crate::storage::page::StorageId;
use zerocopy::IntoBytes;

/// Sort key: (storage, record key, epoch distance from base, ordinal).
fn sort_key(frame: &ParsedFrame, base: Epoch) -> (u32, u64, u32, u32) {
    (
        frame.header.storage_id,
        frame.header.offset,
        frame.header.epoch.wrapping_sub(base.raw()),
        frame.header.ordinal,
    )
}

pub struct LogReducer {
    control: Arc<GleanerControl>,
    node: u16,
    inbox: Arc<Vec<ReducerInbox>>,
    buffer: Vec<ParsedFrame>,
    buffer_bytes: usize,
    buffer_capacity: usize,
    spill_dir: PathBuf,
    runs: Vec<PathBuf>,
}

impl LogReducer {
    pub fn new(
        control: Arc<GleanerControl>,
        node: u16,
        inbox: Arc<Vec<ReducerInbox>>,
        buffer_mb: u32,
        spill_dir: PathBuf,
    ) -> LogReducer {
        LogReducer {
            control,
            node,
            inbox,
            buffer: Vec::new(),
            buffer_bytes: 0,
            buffer_capacity: buffer_mb as usize * 1024 * 1024,
            spill_dir,
            runs: Vec::new(),
        }
    }

    fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let base = self.control.base_epoch;
        self.buffer.sort_by_key(|frame| sort_key(frame, base));
        let path = self
            .spill_dir
            .join(format!("reducer_{}_run_{:04}.sorted", self.node, self.runs.len()));
        let mut file = std::io::BufWriter::new(
            std::fs::File::create(&path)
                .wrap_err_with(|| format!("creating run file {}", path.display()))?,
        );
        for frame in self.buffer.drain(..) {
            write_frame(&mut file, &frame)?;
        }
        file.flush().wrap_err("flushing run file")?;
        info!(node = self.node, run = %path.display(), "reducer spilled a sorted run");
        self.runs.push(path);
        self.buffer_bytes = 0;
        Ok(())
    }

    /// Final, sorted per-storage streams. Consumes the reducer after the
    /// worker loop has exited.
    pub fn into_output(mut self) -> Result<HashMap<StorageId, Vec<ParsedFrame>>> {
        // Mappers race the per-epoch drain; by the time the gleaner joins
        // the workers every mapper has flushed, so one final drain picks
        // up whatever the last epoch's drain missed.
        self.buffer.extend(self.inbox[self.node as usize].drain());
        let base = self.control.base_epoch;
        self.buffer.sort_by_key(|frame| sort_key(frame, base));

        // Load the spilled runs back; each is already sorted.
        let mut sources: Vec<Vec<ParsedFrame>> = Vec::new();
        for path in &self.runs {
            let bytes = std::fs::read(path)
                .wrap_err_with(|| format!("reading run file {}", path.display()))?;
            let mut frames = Vec::new();
            let mut cursor = 0;
            while let Some((frame, consumed)) = parse_frame(&bytes[cursor..]) {
                frames.push(frame);
                cursor += consumed;
            }
            sources.push(frames);
            let _ = std::fs::remove_file(path);
        }
        sources.push(std::mem::take(&mut self.buffer));

        // K-way merge.
        let mut heap = BinaryHeap::new();
        let mut cursors = vec![0usize; sources.len()];
        for (index, source) in sources.iter().enumerate() {
            if let Some(frame) = source.first() {
                heap.push(std::cmp::Reverse((sort_key(frame, base), index)));
            }
        }
        let mut output: HashMap<StorageId, Vec<ParsedFrame>> = HashMap::new();
        while let Some(std::cmp::Reverse((_, index))) = heap.pop() {
            let frame = sources[index][cursors[index]].clone();
            cursors[index] += 1;
            if let Some(next) = sources[index].get(cursors[index]) {
                heap.push(std::cmp::Reverse((sort_key(next, base), index)));
            }
            output
                .entry(frame.header.storage_id)
                .or_default()
                .push(frame);
        }
        Ok(output)
    }
}

fn write_frame(out: &mut impl Write, frame: &ParsedFrame) -> Result<()> {
    out.write_all(frame.header.as_bytes())?;
    out.write_all(&frame.payload)?;
    let written = LOG_FRAME_HEADER_SIZE + frame.payload.len();
    let padding = frame.header.frame_len as usize - written;
    if padding > 0 {
        out.write_all(&vec![0u8; padding])?;
    }
    Ok(())
}

impl MapReduceWorker for LogReducer {
    fn name(&self) -> String {
        format!("reducer-{}", self.node)
    }

    fn control(&self) -> &GleanerControl {
        &self.control
    }

    fn handle_initialize(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.spill_dir)
            .wrap_err_with(|| format!("creating spill dir {}", self.spill_dir.display()))?;
        Ok(())
    }

    fn handle_epoch(&mut self) -> Result<()> {
        let batch = self.inbox[self.node as usize].drain();
        for frame in batch {
            self.buffer_bytes += frame.header.frame_len as usize;
            self.buffer.push(frame);
        }
        if self.buffer_bytes >= self.buffer_capacity {
            self.spill()?;
        }
        debug!(
            node = self.node,
            epoch = %self.control.processing_epoch(),
            buffered = self.buffer.len(),
            "reducer epoch accumulated"
        );
        Ok(())
    }

    fn handle_uninitialize(&mut self) -> Result<()> {
        Ok(())
    }
}
