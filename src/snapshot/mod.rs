//! # Snapshot Pipeline
//!
//! Converts durable log epochs into immutable on-disk pages, then drops
//! the volatile pages those snapshots cover:
//!
//! ```text
//! log files ──mappers──▶ partitioned records ──reducers──▶ sorted runs
//!     ──composers──▶ new snapshot pages ──construct_root──▶ root pages
//!     ──manifest rename──▶ published ──pause + drop_volatiles──▶ memory back
//! ```
//!
//! [`manager`] owns triggering and the latest-snapshot state;
//! [`gleaner`] orchestrates one run; [`mapreduce`]/[`mapper`]/[`reducer`]
//! are the per-node workers; [`writer`] is the on-disk page I/O; and
//! [`snapshot`] is the metadata + manifest.

pub mod gleaner;
pub mod manager;
pub mod mapper;
pub mod mapreduce;
pub mod reducer;
pub mod snapshot;
pub mod writer;

pub use manager::SnapshotManager;
pub use snapshot::{Snapshot, SnapshotManifest};
pub use writer::{SnapshotFileSet, SnapshotPageCache, SnapshotWriter};
