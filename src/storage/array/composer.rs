//! # Array Composer
//!
//! Builds the array storage's share of a snapshot. `compose` walks the
//! leaves of its partition in order; a leaf with no log records reuses the
//! previous snapshot's page untouched (the root-info entry simply points
//! at the old page), otherwise the previous page (or a fresh initial
//! leaf) is copied and the partition's log records are replayed onto it
//! in (epoch, ordinal) order. `construct_root` merges every partition's
//! root-info into the new root page, keeping previous-pointer entries for
//! leaves nobody touched. `drop_volatiles` installs the new leaf pointers
//! into the volatile tree and retires leaves the snapshot fully covers.
//!
//! Root-info page layout: `record_count` entries of
//! `(leaf_index: u64, snapshot_pointer: u64)` pairs in the payload.

use std::sync::atomic::Ordering;

use eyre::Result;
use tracing::{debug, warn};

use crate::epoch::Epoch;
use crate::error::ErrorCode;
use crate::log::record::{LogKind, ParsedFrame};
use crate::storage::array::ArrayStorage;
use crate::storage::composer::{
    ComposeArguments, ConstructRootArguments, DropResult, DropVolatilesArguments,
};
use crate::storage::page::{Page, PageType, SnapshotPagePointer, VolatilePagePointer};
use crate::config::options::KeepVolatilePolicy;
use crate::xct::xct_id::XctId;

pub struct ArrayComposer<'a> {
    storage: &'a ArrayStorage,
}

impl<'a> ArrayComposer<'a> {
    pub fn new(storage: &'a ArrayStorage) -> ArrayComposer<'a> {
        ArrayComposer { storage }
    }

    pub fn compose(&self, args: &mut ComposeArguments<'_>) -> Result<()> {
        let storage = self.storage;
        let previous_root = self.load_previous_root(args)?;
        args.root_info_page.init_header(
            storage.id(),
            PageType::ArrayRoot,
            args.partition as u8,
            0,
            0,
            0,
        );
        let mut entries = 0u32;
        let mut cursor = 0usize;
        for leaf in 0..storage.leaf_count() {
            if storage.partition_of_leaf(leaf, args.partitions) != args.partition {
                continue;
            }
            if args.stop_requested.load(Ordering::Acquire) {
                return Err(ErrorCode::SnapshotStopped.into());
            }
            let base = leaf * storage.records_per_leaf() as u64;
            let end = base + storage.leaf_record_count(leaf) as u64;
            let leaf_frames_start = cursor;
            while cursor < args.log_stream.len() && args.log_stream[cursor].header.offset < end {
                debug_assert!(args.log_stream[cursor].header.offset >= base);
                cursor += 1;
            }
            let frames = &args.log_stream[leaf_frames_start..cursor];

            let previous_child = previous_root
                .as_ref()
                .map(|root| ArrayStorage::child_dual(root, leaf).snapshot())
                .filter(|pointer| !pointer.is_null());

            if frames.is_empty() {
                if let Some(pointer) = previous_child {
                    // Untouched since the last snapshot: reuse the page.
                    Self::push_root_info(args.root_info_page, &mut entries, leaf, pointer);
                    continue;
                }
            }

            let page = Page::new_zeroed();
            match previous_child {
                Some(pointer) => args.previous_files.read_page(pointer, &page)?,
                None => storage.init_fresh_leaf(&page, leaf),
            }
            for frame in frames {
                self.apply_frame(&page, base, frame);
            }
            let pointer = args.snapshot_writer.write_page(&page)?;
            Self::push_root_info(args.root_info_page, &mut entries, leaf, pointer);
        }
        debug_assert_eq!(cursor, args.log_stream.len());
        args.root_info_page.set_record_count(entries);
        debug!(
            storage_id = storage.id(),
            partition = args.partition,
            leaves = entries,
            "array partition composed"
        );
        Ok(())
    }

    fn apply_frame(&self, page: &Page, base: u64, frame: &ParsedFrame) {
        let slot = (frame.header.offset - base) as u32;
        let (owner, payload_base) = self.storage.record_parts(page, slot);
        match frame.header.log_kind() {
            Some(LogKind::Overwrite) => unsafe {
                std::ptr::copy_nonoverlapping(
                    frame.payload.as_ptr(),
                    payload_base.add(frame.header.payload_offset as usize),
                    frame.payload.len(),
                );
            },
            Some(LogKind::Increment) => unsafe {
                let target = payload_base.add(frame.header.payload_offset as usize);
                let mut bytes = [0u8; 8];
                std::ptr::copy_nonoverlapping(target, bytes.as_mut_ptr(), 8);
                let delta = i64::from_le_bytes(frame.payload.as_slice().try_into().unwrap());
                let updated = i64::from_le_bytes(bytes).wrapping_add(delta);
                std::ptr::copy_nonoverlapping(updated.to_le_bytes().as_ptr(), target, 8);
            },
            other => {
                debug_assert!(false, "unexpected array log kind {other:?}");
            }
        }
        // Frames arrive (epoch, ordinal)-sorted per offset, so the last
        // applied id is the newest.
        owner.initialize(XctId::new(
            Epoch::from_raw(frame.header.epoch),
            frame.header.ordinal,
        ));
    }

    fn push_root_info(root_info: &Page, entries: &mut u32, leaf: u64, pointer: SnapshotPagePointer) {
        unsafe {
            let base = (root_info.payload_ptr() as *mut u64).add((*entries as usize) * 2);
            base.write_unaligned(leaf);
            base.add(1).write_unaligned(pointer.raw());
        }
        *entries += 1;
    }

    fn read_root_info(root_info: &Page, index: u32) -> (u64, SnapshotPagePointer) {
        unsafe {
            let base = (root_info.payload_ptr() as *const u64).add(index as usize * 2);
            (
                base.read_unaligned(),
                SnapshotPagePointer::from_raw(base.add(1).read_unaligned()),
            )
        }
    }

    fn load_previous_root(&self, args: &ComposeArguments<'_>) -> Result<Option<Box<Page>>> {
        let pointer = self.storage.root_pointer().snapshot();
        if pointer.is_null() {
            return Ok(None);
        }
        let page = Page::new_zeroed();
        args.previous_files.read_page(pointer, &page)?;
        Ok(Some(page))
    }

    pub fn construct_root(
        &self,
        args: &mut ConstructRootArguments<'_>,
    ) -> Result<SnapshotPagePointer> {
        let storage = self.storage;
        let page = Page::new_zeroed();
        let previous = storage.root_pointer().snapshot();
        if previous.is_null() {
            page.init_header(
                storage.id(),
                PageType::ArrayRoot,
                0,
                0,
                0,
                storage.leaf_count() as u32,
            );
        } else {
            args.previous_files.read_page(previous, &page)?;
        }
        for root_info in args.root_info_pages {
            let count = root_info.header().record_count;
            for index in 0..count {
                let (leaf, pointer) = Self::read_root_info(root_info, index);
                ArrayStorage::child_dual(&page, leaf).set_snapshot(pointer);
            }
        }
        let pointer = args.snapshot_writer.write_page(&page)?;
        Ok(pointer)
    }

    pub fn drop_volatiles(&self, args: &mut DropVolatilesArguments<'_, '_>) -> DropResult {
        let storage = self.storage;
        let mut result = DropResult::new(args.snapshot);

        let new_root = Page::new_zeroed();
        if let Err(error) = args.fileset.read_page(args.new_root_pointer, &new_root) {
            warn!(%error, "cannot read new root page; keeping volatile pages");
            result.dropped_all = false;
            return result;
        }

        let root_volatile = storage.root_pointer().volatile();
        if root_volatile.is_null() {
            return result;
        }
        let root_page = storage.pool().resolve(root_volatile);
        for leaf in 0..storage.leaf_count() {
            if storage.partition_of_leaf(leaf, args.partitions) != args.partition {
                continue;
            }
            let dual = ArrayStorage::child_dual(root_page, leaf);
            let new_child = ArrayStorage::child_dual(&new_root, leaf).snapshot();
            if !new_child.is_null() {
                dual.set_snapshot(new_child);
            }
            let volatile = dual.volatile();
            if volatile.is_null() {
                continue;
            }
            let page = storage.pool().resolve(volatile);
            let mut clean = true;
            for slot in 0..storage.leaf_record_count(leaf) {
                let (owner, _) = self.storage.record_parts(page, slot);
                let epoch = owner.load().epoch();
                if args.snapshot.valid_until_epoch.before(epoch) {
                    clean = false;
                }
                result.on_record_observed(epoch);
            }
            if clean && matches!(args.policy, KeepVolatilePolicy::DropAll | KeepVolatilePolicy::KeepRoots) {
                dual.set_volatile(VolatilePagePointer::null());
                args.dropped_chunk.add(volatile);
            } else if clean {
                // Policy kept a fully covered page resident.
                result.dropped_all = false;
            } else {
                result.dropped_all = false;
            }
        }
        result
    }

    pub fn drop_root_volatile(&self, args: &DropVolatilesArguments<'_, '_>) {
        let storage = self.storage;
        storage.install_root_snapshot(args.new_root_pointer);
        if matches!(args.policy, KeepVolatilePolicy::KeepAll | KeepVolatilePolicy::KeepRoots) {
            return;
        }
        let root_volatile = storage.root_pointer().volatile();
        if root_volatile.is_null() {
            return;
        }
        storage
            .root_pointer()
            .set_volatile(VolatilePagePointer::null());
        storage.pool().release(root_volatile);
        debug!(storage_id = storage.id(), "array root volatile dropped");
    }
}
