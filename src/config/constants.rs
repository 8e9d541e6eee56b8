//! # Engine Constants
//!
//! All fixed numeric values, grouped so that interdependent constants sit
//! next to each other. When changing any constant here, walk its dependents
//! below before committing to the new value.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (64 bytes, fixed)
//!       │
//!       ├─> PAGE_PAYLOAD_SIZE (derived: PAGE_SIZE - PAGE_HEADER_SIZE)
//!       │     Array leaf pages pack whole record slots into this area;
//!       │     interior pages pack DualPagePointer entries (16 bytes each).
//!       │
//!       └─> SNAPSHOT_IO_BUFFER_PAGES
//!             The snapshot writer batches this many pages per write call.
//!
//! XCT_ORDINAL_BITS (24)
//!       │
//!       ├─> MAX_ORDINAL (derived)
//!       │     issue_next_id advances the epoch and resets the ordinal to 1
//!       │     when a thread commits MAX_ORDINAL times inside one epoch.
//!       │
//!       └─> XctId layout [epoch:32][ordinal:24][flags:8]; changing the
//!           width changes the on-record word and the log frame stamp.
//!
//! MAX_POINTER_SETS / MAX_PAGE_VERSION_SETS (1024 each)
//!       Hard caps; exceeding returns TooManyReads
//!       rather than reallocating mid-transaction.
//!
//! MCS_BLOCKS_PER_THREAD (4096)
//!       Upper bound on lock acquisitions (current + retried) within one
//!       transaction. Must be >= default max write set size, since precommit
//!       takes one block per write lock, plus slack for release/reacquire
//!       cycles during ascending-order repair.
//! ```

/// Size of every page, volatile and snapshot alike.
pub const PAGE_SIZE: usize = 4096;

/// Fixed bytes reserved at the head of each page for the page header.
pub const PAGE_HEADER_SIZE: usize = 64;

/// Usable bytes per page after the header.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Bit width of the in-epoch ordinal inside an XctId.
pub const XCT_ORDINAL_BITS: u32 = 24;

/// Largest ordinal an XctId can carry before the epoch must advance.
pub const MAX_ORDINAL: u32 = (1 << XCT_ORDINAL_BITS) - 1;

/// Hard cap on pointer-set entries per transaction.
pub const MAX_POINTER_SETS: usize = 1024;

/// Hard cap on page-version-set entries per transaction.
pub const MAX_PAGE_VERSION_SETS: usize = 1024;

/// MCS queue blocks preallocated per thread context.
pub const MCS_BLOCKS_PER_THREAD: usize = 4096;

/// Dropped volatile pages are batch-returned to the pool in chunks of this
/// many offsets.
pub const DROPPED_CHUNK_CAPACITY: usize = 128;

/// Pages the snapshot writer accumulates before issuing one sequential
/// write.
pub const SNAPSHOT_IO_BUFFER_PAGES: usize = 64;

/// Placeholder substituted with the NUMA node number in snapshot folder
/// patterns.
pub const NODE_PATTERN: &str = "$NODE$";
