//! # Transactions
//!
//! Optimistic concurrency control with per-record versioning. The moving
//! parts, bottom up:
//!
//! - [`xct_id`]: the 64-bit commit id that doubles as the record ownership
//!   word, and the 128-bit lockable header wrapping it.
//! - [`mcs_lock`]: the MCS-style reader/writer lock living in the second
//!   half of that header.
//! - [`lock_list`]: per-transaction ordered lock bookkeeping, the current
//!   lock list (CLL) that enforces deadlock-free ascending acquisition and
//!   the retrospective lock list (RLL) that carries lessons across aborts.
//! - [`access`]: the read/write/pointer/page-version set entry types.
//! - [`xct`]: the per-thread transaction object owning all of the above.
//! - [`manager`]: begin/precommit/abort driver running the epoch-fenced
//!   validation protocol, plus the global transaction-pause barrier the
//!   snapshot pipeline uses while dropping volatile pages.

pub mod access;
pub mod lock_list;
pub mod manager;
pub mod mcs_lock;
pub mod xct;
pub mod xct_id;

pub use manager::XctManager;
pub use xct::Xct;
pub use xct_id::{RwLockableXctId, XctId};

/// Transaction isolation levels.
///
/// `Serializable` tracks every record read for commit-time validation.
/// `Snapshot` elides read tracking and observes whatever record versions
/// are current when read; writes still go through the full commit
/// protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    Serializable,
    Snapshot,
}
