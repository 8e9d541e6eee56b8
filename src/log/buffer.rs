//! # Per-Thread Log Buffer
//!
//! A single-producer (the owning worker thread) / single-consumer (the log
//! manager's flusher) byte ring. The producer appends fully formed log
//! frames at commit time; the flusher drains whatever is published and
//! appends it verbatim to the thread's log file, so the file is the same
//! frame stream the ring carried.
//!
//! ## Wrap discipline
//!
//! Frames never straddle the physical end of the ring. When a frame does
//! not fit in the remaining contiguous space, a `Filler` frame consumes the
//! tail of the ring; when the space left *after* a frame would be too small
//! to hold even a frame header, the frame's own padding is extended to the
//! boundary. Either way, every frame start always has at least a header's
//! worth of contiguous space, so the drained byte stream needs no
//! out-of-band wrap markers.
//!
//! ## The in-commit marker
//!
//! `in_commit_epoch` publishes the epoch a commit is about to stamp,
//! before the commit reads its final epoch. The epoch advancer takes the
//! minimum across threads so the durable epoch can never overtake a commit
//! that is still publishing its records.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::epoch::Epoch;
use crate::log::record::{LogFrameHeader, LogRecord, LOG_FRAME_HEADER_SIZE};
use crate::xct::xct_id::XctId;
use zerocopy::IntoBytes;

pub struct ThreadLogBuffer {
    thread_id: u16,
    capacity: u64,
    data: UnsafeCell<Box<[u8]>>,
    /// Consumer position, absolute (monotone).
    head: AtomicU64,
    /// Producer position, absolute (monotone).
    tail: AtomicU64,
    /// Epoch of an in-flight commit on this thread; `INVALID_EPOCH` when
    /// idle.
    in_commit_epoch: AtomicU32,
}

// Producer and consumer touch disjoint regions, ordered by head/tail.
unsafe impl Send for ThreadLogBuffer {}
unsafe impl Sync for ThreadLogBuffer {}

impl ThreadLogBuffer {
    pub fn new(thread_id: u16, capacity_bytes: usize) -> ThreadLogBuffer {
        assert!(capacity_bytes % 8 == 0 && capacity_bytes >= 4096);
        ThreadLogBuffer {
            thread_id,
            capacity: capacity_bytes as u64,
            data: UnsafeCell::new(vec![0u8; capacity_bytes].into_boxed_slice()),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            in_commit_epoch: AtomicU32::new(0),
        }
    }

    pub fn thread_id(&self) -> u16 {
        self.thread_id
    }

    /// Publishes the epoch this thread is about to commit in. SeqCst so
    /// the advancer's marker scan and the committer's epoch read order
    /// globally.
    pub fn mark_in_commit(&self, epoch: Epoch) {
        self.in_commit_epoch.store(epoch.raw(), Ordering::SeqCst);
    }

    pub fn clear_in_commit(&self) {
        self.in_commit_epoch.store(0, Ordering::SeqCst);
    }

    pub fn in_commit_epoch(&self) -> Epoch {
        Epoch::from_raw(self.in_commit_epoch.load(Ordering::SeqCst))
    }

    /// Appends one record as a frame. Owner thread only. Spins (yielding)
    /// when the ring is full until the flusher catches up.
    pub fn append(&self, record: &LogRecord, commit_id: XctId) {
        let len = record.frame_len() as u64;
        assert!(len + LOG_FRAME_HEADER_SIZE as u64 <= self.capacity);
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Acquire);
            let free = self.capacity - (tail - head);
            let contiguous = self.capacity - (tail % self.capacity);
            debug_assert!(contiguous >= LOG_FRAME_HEADER_SIZE as u64);

            if len > contiguous {
                // Close out the physical tail with a filler frame.
                if free < contiguous {
                    std::thread::yield_now();
                    continue;
                }
                let filler = LogFrameHeader::filler(contiguous as u32);
                let slot = self.slot_mut(tail, contiguous as usize);
                slot[..LOG_FRAME_HEADER_SIZE].copy_from_slice(filler.as_bytes());
                slot[LOG_FRAME_HEADER_SIZE..].fill(0);
                self.tail.store(tail + contiguous, Ordering::Release);
                continue;
            }

            // Extend the frame to the boundary if what would remain could
            // not hold a header.
            let mut actual = len;
            let remaining = contiguous - len;
            if remaining > 0 && remaining < LOG_FRAME_HEADER_SIZE as u64 {
                actual = contiguous;
            }
            if free < actual {
                std::thread::yield_now();
                continue;
            }
            let slot = self.slot_mut(tail, actual as usize);
            record.serialize_into(commit_id, slot);
            self.tail.store(tail + actual, Ordering::Release);
            return;
        }
    }

    /// Drains all published bytes, in logical order. Flusher only.
    pub fn drain(&self) -> Vec<u8> {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Relaxed);
        if head == tail {
            return Vec::new();
        }
        let total = (tail - head) as usize;
        let mut out = Vec::with_capacity(total);
        let first_offset = (head % self.capacity) as usize;
        let first_len = total.min(self.capacity as usize - first_offset);
        out.extend_from_slice(self.slot(head, first_len));
        if first_len < total {
            out.extend_from_slice(self.slot(head + first_len as u64, total - first_len));
        }
        self.head.store(tail, Ordering::Release);
        out
    }

    pub fn pending_bytes(&self) -> u64 {
        self.tail.load(Ordering::Acquire) - self.head.load(Ordering::Acquire)
    }

    fn slot(&self, position: u64, len: usize) -> &[u8] {
        let offset = (position % self.capacity) as usize;
        debug_assert!(offset + len <= self.capacity as usize);
        unsafe {
            let base = (*self.data.get()).as_ptr();
            std::slice::from_raw_parts(base.add(offset), len)
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn slot_mut(&self, position: u64, len: usize) -> &mut [u8] {
        let offset = (position % self.capacity) as usize;
        debug_assert!(offset + len <= self.capacity as usize);
        unsafe {
            let base = (*self.data.get()).as_mut_ptr();
            std::slice::from_raw_parts_mut(base.add(offset), len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::{parse_frame, ArenaSlice, LogKind};

    fn overwrite_record(payload: &[u8]) -> LogRecord {
        LogRecord::Overwrite {
            storage_id: 1,
            offset: 0,
            payload_offset: 0,
            data: unsafe { ArenaSlice::new(payload.as_ptr(), payload.len()) },
        }
    }

    fn commit_id(epoch: u32, ordinal: u32) -> XctId {
        XctId::new(Epoch::from_raw(epoch), ordinal)
    }

    fn parse_stream(bytes: &[u8]) -> Vec<(LogKind, Vec<u8>)> {
        let mut frames = Vec::new();
        let mut cursor = 0;
        while cursor < bytes.len() {
            let (frame, consumed) = parse_frame(&bytes[cursor..]).expect("well-formed stream");
            frames.push((frame.header.log_kind().unwrap(), frame.payload));
            cursor += consumed;
        }
        frames
    }

    #[test]
    fn append_then_drain_round_trips() {
        let buffer = ThreadLogBuffer::new(0, 4096);
        buffer.append(&overwrite_record(b"one"), commit_id(2, 1));
        buffer.append(&overwrite_record(b"two"), commit_id(2, 2));
        let bytes = buffer.drain();
        let frames = parse_stream(&bytes);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].1, b"one");
        assert_eq!(frames[1].1, b"two");
        assert_eq!(buffer.pending_bytes(), 0);
    }

    #[test]
    fn drain_on_empty_buffer_is_empty() {
        let buffer = ThreadLogBuffer::new(0, 4096);
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn wrapping_inserts_fillers_not_torn_frames() {
        let buffer = ThreadLogBuffer::new(0, 4096);
        let payload = vec![7u8; 300];
        // Append/drain enough times to wrap the ring several times.
        let mut seen = 0;
        for round in 0..40 {
            buffer.append(&overwrite_record(&payload), commit_id(2, round + 1));
            let bytes = buffer.drain();
            for (kind, body) in parse_stream(&bytes) {
                match kind {
                    LogKind::Filler => {}
                    LogKind::Overwrite => {
                        assert_eq!(body, payload);
                        seen += 1;
                    }
                    other => panic!("unexpected frame {other:?}"),
                }
            }
        }
        assert_eq!(seen, 40);
    }

    #[test]
    fn in_commit_marker_round_trips() {
        let buffer = ThreadLogBuffer::new(3, 4096);
        assert!(!buffer.in_commit_epoch().is_valid());
        buffer.mark_in_commit(Epoch::from_raw(9));
        assert_eq!(buffer.in_commit_epoch(), Epoch::from_raw(9));
        buffer.clear_in_commit();
        assert!(!buffer.in_commit_epoch().is_valid());
    }
}
