//! # Error Codes
//!
//! PactDB splits error handling into two layers, mirroring how the hot
//! transactional path and the orchestration path have very different needs:
//!
//! - **Hot paths** (record reads/writes, precommit, lock acquisition) return
//!   `Result<T, ErrorCode>`. `ErrorCode` is a fieldless, `Copy`, `#[repr(u16)]`
//!   enum with stable integer discriminants, so a failed operation costs one
//!   register and callers can match on codes across versions.
//! - **Orchestration paths** (engine lifecycle, log flushing, the snapshot
//!   pipeline) use `eyre::Result` with `wrap_err` context chains. `ErrorCode`
//!   implements `std::error::Error`, so it converts into an `eyre::Report`
//!   at the boundary with `?`.
//!
//! ## Taxonomy
//!
//! - Transient: `RaceAbort`. Callers retry; the retrospective lock list is
//!   seeded so the retry acquires contested locks up-front.
//! - Capacity: the `*Overflow` codes and `NoMoreLocalWorkMemory`. Returned to
//!   the caller, typically retried after widening buffers or splitting the
//!   transaction.
//! - Snapshot: `SnapshotStopped` (external stop during gleaning, nothing
//!   published) and `SnapshotInvalidEpoch` (requested range not durable).
//! - I/O: recoverable at the snapshot layer, fatal at the log layer (the
//!   durable epoch cannot advance, which blocks `wait_for_commit`).
//!
//! Discriminant values are part of the on-the-wire/application contract.
//! Never renumber; append only.

use thiserror::Error;

/// Stable error codes returned by transactional and storage operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u16)]
pub enum ErrorCode {
    /// Read validation or lock acquisition detected a concurrent race.
    /// Abort and retry; the RLL remembers the locks this attempt wanted.
    #[error("transaction aborted due to a concurrent race")]
    RaceAbort = 1,

    /// The read set reached its configured capacity.
    #[error("read set overflow")]
    ReadSetOverflow = 2,

    /// The write set reached its configured capacity.
    #[error("write set overflow")]
    WriteSetOverflow = 3,

    /// The pointer set or page-version set reached its hard cap of 1024
    /// entries.
    #[error("too many tracked reads (pointer/page-version sets full)")]
    TooManyReads = 4,

    /// The per-thread bump arena for transaction scratch is exhausted.
    #[error("no more local work memory")]
    NoMoreLocalWorkMemory = 6,

    /// A stop was requested while a snapshot was being taken. Nothing was
    /// published.
    #[error("snapshot stopped by request")]
    SnapshotStopped = 7,

    /// The requested snapshot epoch range is not durable yet or is already
    /// covered by a previous snapshot.
    #[error("invalid epoch range for snapshot")]
    SnapshotInvalidEpoch = 8,

    /// An I/O operation failed. Details travel on the eyre chain at the
    /// layer that hit the failure.
    #[error("I/O error")]
    IoError = 9,

    /// No storage with the given id or name exists.
    #[error("storage not found")]
    StorageNotFound = 10,

    /// A record offset beyond the storage's size was requested.
    #[error("record offset out of range")]
    InvalidOffset = 11,

    /// All transaction slots are occupied.
    #[error("too many concurrent transactions")]
    TooManyConcurrentXcts = 12,

    /// `begin_xct` was called while a transaction is already active on this
    /// thread context.
    #[error("a transaction is already active on this thread")]
    AlreadyActiveXct = 13,

    /// An operation that requires an active transaction was called without
    /// one.
    #[error("no active transaction on this thread")]
    NoActiveXct = 14,

    /// Payload offset/length does not fit in the record payload.
    #[error("payload range out of bounds")]
    InvalidPayloadRange = 15,

    /// The volatile page pool has no free pages left.
    #[error("no free volatile pages")]
    NoFreeVolatilePages = 16,
}

impl ErrorCode {
    /// The stable integer value of this code.
    pub const fn code(self) -> u16 {
        self as u16
    }
}

/// Result alias for hot-path operations.
pub type CodeResult<T> = Result<T, ErrorCode>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_integers() {
        assert_eq!(ErrorCode::RaceAbort.code(), 1);
        assert_eq!(ErrorCode::ReadSetOverflow.code(), 2);
        assert_eq!(ErrorCode::NoMoreLocalWorkMemory.code(), 6);
        assert_eq!(ErrorCode::SnapshotStopped.code(), 7);
        assert_eq!(ErrorCode::IoError.code(), 9);
    }

    #[test]
    fn codes_display_a_message() {
        let msg = ErrorCode::RaceAbort.to_string();
        assert!(msg.contains("race"));
    }

    #[test]
    fn codes_convert_into_eyre_reports() {
        fn inner() -> eyre::Result<()> {
            Err(ErrorCode::SnapshotStopped)?
        }
        let report = inner().unwrap_err();
        assert!(report.to_string().contains("stopped"));
    }
}
