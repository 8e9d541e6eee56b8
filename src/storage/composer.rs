//! # Composer: Per-Storage Snapshot Page Construction
//!
//! One composer instance works on behalf of exactly one (storage,
//! partition, snapshot) triple. The gleaner hands it the previous snapshot
//! files, this partition's pre-sorted log stream, and a snapshot writer;
//! the composer merges old pages with the log into new pages and emits a
//! single root-info page describing the children it produced. After all
//! partitions finish, `construct_root` merges the root-info pages into the
//! storage's new root snapshot page, and `drop_volatiles` (running under
//! the global transaction pause) retires volatile pages the snapshot now
//! fully covers.
//!
//! There is deliberately no trait object here: `StorageType` discriminates
//! and every entry point dispatches with an exhaustive `match`, keeping
//! the hot path free of virtual calls and the variants honest.

use std::sync::atomic::AtomicBool;

use eyre::Result;

use crate::config::options::KeepVolatilePolicy;
use crate::epoch::Epoch;
use crate::log::record::ParsedFrame;
use crate::memory::DroppedChunk;
use crate::snapshot::snapshot::Snapshot;
use crate::snapshot::writer::{SnapshotFileSet, SnapshotWriter};
use crate::storage::page::{Page, SnapshotPagePointer};
use crate::storage::Storage;

/// Arguments for [`Composer::compose`].
pub struct ComposeArguments<'a> {
    /// Writes out composed pages.
    pub snapshot_writer: &'a mut SnapshotWriter,
    /// To read pages of the previous snapshot.
    pub previous_files: &'a SnapshotFileSet,
    /// This partition's log records, sorted by (key, epoch, ordinal).
    pub log_stream: &'a [ParsedFrame],
    /// Every log record is strictly after this epoch.
    pub base_epoch: Epoch,
    pub partition: u16,
    pub partitions: u16,
    /// Checked between emitted pages; a stop aborts the snapshot.
    pub stop_requested: &'a AtomicBool,
    /// [out] Pointers and key information needed to construct the root.
    pub root_info_page: &'a Page,
}

/// Arguments for [`Composer::construct_root`].
pub struct ConstructRootArguments<'a> {
    pub snapshot_writer: &'a mut SnapshotWriter,
    pub previous_files: &'a SnapshotFileSet,
    /// Root-info pages output by every partition's `compose`.
    pub root_info_pages: &'a [Box<Page>],
}

/// Arguments for [`Composer::drop_volatiles`].
pub struct DropVolatilesArguments<'a, 'pool> {
    pub snapshot: &'a Snapshot,
    pub partition: u16,
    pub partitions: u16,
    /// Batches dropped pages back to the volatile pool.
    pub dropped_chunk: &'a mut DroppedChunk<'pool>,
    pub policy: KeepVolatilePolicy,
    /// To read the freshly published root page for pointer installation.
    pub fileset: &'a SnapshotFileSet,
    /// The storage's new root snapshot page.
    pub new_root_pointer: SnapshotPagePointer,
}

/// What `drop_volatiles` observed under one subtree.
#[derive(Debug, Clone, Copy)]
pub struct DropResult {
    /// Largest epoch observed recursively, floored at the snapshot's
    /// `valid_until_epoch` so `combine` is a plain max.
    pub max_observed: Epoch,
    /// Whether every volatile page under the walked subtree was dropped.
    pub dropped_all: bool,
}

impl DropResult {
    pub fn new(snapshot: &Snapshot) -> DropResult {
        DropResult {
            max_observed: snapshot.valid_until_epoch,
            dropped_all: true,
        }
    }

    /// Folds a sibling partition's result into this one.
    pub fn combine(&mut self, other: &DropResult) {
        self.max_observed.store_max(other.max_observed);
        self.dropped_all &= other.dropped_all;
    }

    /// Accounts one record's commit epoch during the walk.
    pub fn on_record_observed(&mut self, epoch: Epoch) {
        if self.max_observed.before(epoch) {
            self.max_observed = epoch;
            self.dropped_all = false;
        }
    }

    /// True when no partition saw anything newer than the snapshot; only
    /// then may the storage's root volatile page be dropped.
    pub fn safe_to_drop_root(&self, snapshot: &Snapshot) -> bool {
        self.dropped_all && self.max_observed == snapshot.valid_until_epoch
    }
}

/// Composer facade; selects the storage-specific implementation.
pub struct Composer<'a> {
    storage: &'a Storage,
}

impl<'a> Composer<'a> {
    pub fn new(storage: &'a Storage) -> Composer<'a> {
        Composer { storage }
    }

    /// Merges previous snapshot pages with the sorted log stream into new
    /// leaf/chunk pages, then emits the root-info page.
    pub fn compose(&self, args: &mut ComposeArguments<'_>) -> Result<()> {
        match self.storage {
            Storage::Array(array) => array.composer().compose(args),
            Storage::Sequential(sequential) => sequential.composer().compose(args),
        }
    }

    /// Builds the storage's new root snapshot page from all partitions'
    /// root-info pages. Called once per storage by the gleaner.
    pub fn construct_root(
        &self,
        args: &mut ConstructRootArguments<'_>,
    ) -> Result<SnapshotPagePointer> {
        match self.storage {
            Storage::Array(array) => array.composer().construct_root(args),
            Storage::Sequential(sequential) => sequential.composer().construct_root(args),
        }
    }

    /// Retires volatile pages fully covered by the snapshot. Runs under
    /// the global transaction pause.
    pub fn drop_volatiles(&self, args: &mut DropVolatilesArguments<'_, '_>) -> DropResult {
        match self.storage {
            Storage::Array(array) => array.composer().drop_volatiles(args),
            Storage::Sequential(sequential) => sequential.composer().drop_volatiles(args),
        }
    }

    /// Drops the root volatile page. Only called when every partition
    /// reported no modifications past the snapshot.
    pub fn drop_root_volatile(&self, args: &DropVolatilesArguments<'_, '_>) {
        match self.storage {
            Storage::Array(array) => array.composer().drop_root_volatile(args),
            Storage::Sequential(sequential) => sequential.composer().drop_root_volatile(args),
        }
    }
}
