//! # Log Records and On-Disk Framing
//!
//! A committed write travels as a tagged log record. In memory (inside a
//! transaction's write set) a record is a [`LogRecord`] whose payload bytes
//! live in the transaction's local work memory. On disk (and in the
//! per-thread log buffer) it is a length-prefixed frame:
//!
//! ```text
//! +--------------------+----------------------+
//! | LogFrameHeader(48) | payload (0..n bytes) |
//! +--------------------+----------------------+
//! ```
//!
//! The header is a `zerocopy` struct so the mapper can scan log files
//! without a deserialization step. `checksum` is CRC-64/ECMA-182 over the
//! payload; a mismatch means a torn tail write and is treated as
//! end-of-log by scanners.
//!
//! Frames are 8-byte aligned in the buffer and in files. A `Filler` frame
//! bridges the gap when a record would straddle the ring-buffer wrap point.

use crc::{Crc, CRC_64_ECMA_182};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::epoch::Epoch;
use crate::storage::page::StorageId;
use crate::xct::xct_id::XctId;

pub const LOG_FRAME_HEADER_SIZE: usize = 48;
pub const LOG_FRAME_ALIGN: usize = 8;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Discriminates log record variants on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogKind {
    /// Alignment/wrap padding; carries no payload meaning.
    Filler = 0,
    /// Full or partial overwrite of a record payload.
    Overwrite = 1,
    /// Add a little-endian i64 delta at a payload offset.
    Increment = 2,
    /// Append a record to a sequential storage.
    Append = 3,
}

impl LogKind {
    pub fn from_raw(raw: u8) -> Option<LogKind> {
        match raw {
            0 => Some(LogKind::Filler),
            1 => Some(LogKind::Overwrite),
            2 => Some(LogKind::Increment),
            3 => Some(LogKind::Append),
            _ => None,
        }
    }
}

/// Fixed-size frame header preceding every log payload. Field order is
/// chosen so the struct has no implicit padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct LogFrameHeader {
    /// Total frame length: header + payload + alignment padding.
    pub frame_len: u32,
    pub kind: u8,
    _pad0: u8,
    _pad1: u16,
    pub storage_id: u32,
    /// Commit epoch stamped at publish time.
    pub epoch: u32,
    /// In-epoch commit ordinal (low 24 bits used).
    pub ordinal: u32,
    /// Byte offset within the record payload this frame applies at.
    pub payload_offset: u32,
    /// Record offset (array) or sequence hint (sequential).
    pub offset: u64,
    pub payload_len: u32,
    _pad2: u32,
    /// CRC-64/ECMA-182 over the payload bytes.
    pub checksum: u64,
}

const _: () = assert!(std::mem::size_of::<LogFrameHeader>() == LOG_FRAME_HEADER_SIZE);

impl LogFrameHeader {
    pub fn filler(frame_len: u32) -> LogFrameHeader {
        LogFrameHeader {
            frame_len,
            kind: LogKind::Filler as u8,
            _pad0: 0,
            _pad1: 0,
            storage_id: 0,
            epoch: 0,
            ordinal: 0,
            offset: 0,
            payload_offset: 0,
            payload_len: 0,
            _pad2: 0,
            checksum: 0,
        }
    }

    pub fn log_kind(&self) -> Option<LogKind> {
        LogKind::from_raw(self.kind)
    }

    pub fn epoch_value(&self) -> Epoch {
        Epoch::from_raw(self.epoch)
    }

    pub fn payload_matches(&self, payload: &[u8]) -> bool {
        self.checksum == CRC64.checksum(payload)
    }
}

/// Rounds a frame length up to the wire alignment.
pub fn aligned_frame_len(payload_len: usize) -> usize {
    let raw = LOG_FRAME_HEADER_SIZE + payload_len;
    (raw + LOG_FRAME_ALIGN - 1) & !(LOG_FRAME_ALIGN - 1)
}

/// Payload bytes parked in a transaction's local work memory. Valid until
/// the owning transaction's next `activate`, which outlives every use (the
/// write set is drained at commit or abort).
#[derive(Debug, Clone, Copy)]
pub struct ArenaSlice {
    ptr: *const u8,
    len: u32,
}

// The arena outlives the transaction that parked the bytes, and the bytes
// are immutable once parked.
unsafe impl Send for ArenaSlice {}
unsafe impl Sync for ArenaSlice {}

impl ArenaSlice {
    /// `ptr` must point at `len` initialized bytes that stay valid and
    /// unmodified for the lifetime of the owning transaction.
    pub unsafe fn new(ptr: *const u8, len: usize) -> ArenaSlice {
        ArenaSlice {
            ptr,
            len: len as u32,
        }
    }

    pub fn empty() -> ArenaSlice {
        ArenaSlice {
            ptr: std::ptr::NonNull::<u8>::dangling().as_ptr(),
            len: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.len as usize) }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// An in-memory, not-yet-published log record.
#[derive(Debug, Clone, Copy)]
pub enum LogRecord {
    Overwrite {
        storage_id: StorageId,
        offset: u64,
        payload_offset: u32,
        data: ArenaSlice,
    },
    Increment {
        storage_id: StorageId,
        offset: u64,
        payload_offset: u32,
        delta: i64,
    },
    Append {
        storage_id: StorageId,
        data: ArenaSlice,
    },
}

impl LogRecord {
    pub fn storage_id(&self) -> StorageId {
        match self {
            LogRecord::Overwrite { storage_id, .. }
            | LogRecord::Increment { storage_id, .. }
            | LogRecord::Append { storage_id, .. } => *storage_id,
        }
    }

    /// Serialized frame length, aligned.
    pub fn frame_len(&self) -> usize {
        match self {
            LogRecord::Overwrite { data, .. } => aligned_frame_len(data.len()),
            LogRecord::Increment { .. } => aligned_frame_len(8),
            LogRecord::Append { data, .. } => aligned_frame_len(data.len()),
        }
    }

    /// Serializes this record, stamped with the commit id, into `out`.
    /// `out` must be at least `self.frame_len()` bytes and stay 8-byte
    /// aligned in length; any excess becomes frame padding.
    pub fn serialize_into(&self, commit_id: XctId, out: &mut [u8]) {
        debug_assert!(out.len() >= self.frame_len());
        debug_assert!(out.len() % LOG_FRAME_ALIGN == 0);
        let (kind, storage_id, offset, payload_offset, payload): (
            LogKind,
            StorageId,
            u64,
            u32,
            &[u8],
        ) = match self {
            LogRecord::Overwrite {
                storage_id,
                offset,
                payload_offset,
                data,
            } => (
                LogKind::Overwrite,
                *storage_id,
                *offset,
                *payload_offset,
                data.as_slice(),
            ),
            LogRecord::Increment {
                storage_id,
                offset,
                payload_offset,
                delta,
            } => {
                // Delta travels as its own little payload; serialize below.
                let bytes = delta.to_le_bytes();
                out[LOG_FRAME_HEADER_SIZE..LOG_FRAME_HEADER_SIZE + 8].copy_from_slice(&bytes);
                let header = LogFrameHeader {
                    frame_len: out.len() as u32,
                    kind: LogKind::Increment as u8,
                    _pad0: 0,
                    _pad1: 0,
                    storage_id: *storage_id,
                    epoch: commit_id.epoch().raw(),
                    ordinal: commit_id.ordinal(),
                    offset: *offset,
                    payload_offset: *payload_offset,
                    payload_len: 8,
                    _pad2: 0,
                    checksum: CRC64.checksum(&bytes),
                };
                out[..LOG_FRAME_HEADER_SIZE].copy_from_slice(header.as_bytes());
                zero_tail(out, LOG_FRAME_HEADER_SIZE + 8);
                return;
            }
            LogRecord::Append { storage_id, data } => {
                (LogKind::Append, *storage_id, 0, 0, data.as_slice())
            }
        };
        let header = LogFrameHeader {
            frame_len: out.len() as u32,
            kind: kind as u8,
            _pad0: 0,
            _pad1: 0,
            storage_id,
            epoch: commit_id.epoch().raw(),
            ordinal: commit_id.ordinal(),
            offset,
            payload_offset,
            payload_len: payload.len() as u32,
            _pad2: 0,
            checksum: CRC64.checksum(payload),
        };
        out[..LOG_FRAME_HEADER_SIZE].copy_from_slice(header.as_bytes());
        out[LOG_FRAME_HEADER_SIZE..LOG_FRAME_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        zero_tail(out, LOG_FRAME_HEADER_SIZE + payload.len());
    }
}

fn zero_tail(out: &mut [u8], from: usize) {
    for byte in &mut out[from..] {
        *byte = 0;
    }
}

/// A frame parsed back out of a buffer or file.
#[derive(Debug, Clone)]
pub struct ParsedFrame {
    pub header: LogFrameHeader,
    pub payload: Vec<u8>,
}

/// Parses the frame at the head of `bytes`. Returns `None` on a truncated
/// or corrupt frame (normal at the tail of a file mid-write).
pub fn parse_frame(bytes: &[u8]) -> Option<(ParsedFrame, usize)> {
    if bytes.len() < LOG_FRAME_HEADER_SIZE {
        return None;
    }
    let header =
        LogFrameHeader::read_from_bytes(&bytes[..LOG_FRAME_HEADER_SIZE]).ok()?;
    let frame_len = header.frame_len as usize;
    if frame_len < LOG_FRAME_HEADER_SIZE
        || frame_len % LOG_FRAME_ALIGN != 0
        || frame_len > bytes.len()
    {
        return None;
    }
    header.log_kind()?;
    let payload_end = LOG_FRAME_HEADER_SIZE + header.payload_len as usize;
    if payload_end > frame_len {
        return None;
    }
    let payload = bytes[LOG_FRAME_HEADER_SIZE..payload_end].to_vec();
    if !header.payload_matches(&payload) {
        return None;
    }
    Some((ParsedFrame { header, payload }, frame_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::Epoch;

    fn commit_id(epoch: u32, ordinal: u32) -> XctId {
        XctId::new(Epoch::from_raw(epoch), ordinal)
    }

    #[test]
    fn header_is_48_bytes() {
        assert_eq!(LOG_FRAME_HEADER_SIZE, 48);
    }

    #[test]
    fn overwrite_round_trips() {
        let data = b"hello world";
        let record = LogRecord::Overwrite {
            storage_id: 9,
            offset: 42,
            payload_offset: 16,
            data: unsafe { ArenaSlice::new(data.as_ptr(), data.len()) },
        };
        let mut out = vec![0u8; record.frame_len()];
        record.serialize_into(commit_id(5, 77), &mut out);

        let (frame, consumed) = parse_frame(&out).expect("valid frame");
        assert_eq!(consumed, out.len());
        assert_eq!(frame.header.log_kind(), Some(LogKind::Overwrite));
        assert_eq!(frame.header.storage_id, 9);
        assert_eq!(frame.header.offset, 42);
        assert_eq!(frame.header.payload_offset, 16);
        assert_eq!(frame.header.epoch, 5);
        assert_eq!(frame.header.ordinal, 77);
        assert_eq!(frame.payload, data);
    }

    #[test]
    fn increment_carries_its_delta() {
        let record = LogRecord::Increment {
            storage_id: 3,
            offset: 8,
            payload_offset: 0,
            delta: -17,
        };
        let mut out = vec![0u8; record.frame_len()];
        record.serialize_into(commit_id(2, 1), &mut out);

        let (frame, _) = parse_frame(&out).expect("valid frame");
        assert_eq!(frame.header.log_kind(), Some(LogKind::Increment));
        assert_eq!(i64::from_le_bytes(frame.payload.try_into().unwrap()), -17);
    }

    #[test]
    fn frames_are_8_byte_aligned() {
        for payload_len in [0usize, 1, 7, 8, 9, 100] {
            assert_eq!(aligned_frame_len(payload_len) % LOG_FRAME_ALIGN, 0);
        }
    }

    #[test]
    fn corrupt_payload_is_rejected() {
        let data = b"payload";
        let record = LogRecord::Append {
            storage_id: 1,
            data: unsafe { ArenaSlice::new(data.as_ptr(), data.len()) },
        };
        let mut out = vec![0u8; record.frame_len()];
        record.serialize_into(commit_id(1, 1), &mut out);
        out[LOG_FRAME_HEADER_SIZE] ^= 0xFF;
        assert!(parse_frame(&out).is_none());
    }

    #[test]
    fn truncated_frame_is_end_of_log() {
        let data = b"payload";
        let record = LogRecord::Append {
            storage_id: 1,
            data: unsafe { ArenaSlice::new(data.as_ptr(), data.len()) },
        };
        let mut out = vec![0u8; record.frame_len()];
        record.serialize_into(commit_id(1, 1), &mut out);
        assert!(parse_frame(&out[..out.len() - 4]).is_none());
    }
}
