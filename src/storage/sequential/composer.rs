//! # Sequential Composer
//!
//! The easiest composer: appends have no keys to merge, so `compose`
//! simply packs this partition's (epoch, ordinal)-ordered log records
//! into fresh snapshot chunks. `construct_root` concatenates the previous
//! root's chunk list with every partition's new chunks; history only
//! grows. `drop_volatiles` retires the chunk-chain prefixes the snapshot
//! now covers; a chunk holding even one newer record stays, and the
//! storage's truncate epoch keeps scans from double-reading what the
//! snapshot serves.

use std::sync::atomic::Ordering;

use eyre::{bail, Result};
use tracing::debug;

use crate::config::PAGE_PAYLOAD_SIZE;
use crate::epoch::Epoch;
use crate::error::ErrorCode;
use crate::log::record::LogKind;
use crate::storage::composer::{
    ComposeArguments, ConstructRootArguments, DropResult, DropVolatilesArguments,
};
use crate::storage::page::{Page, PageType, SnapshotPagePointer, VolatilePagePointer};
use crate::storage::sequential::{
    collect_entries_epochs, entry_len, write_entry, SequentialStorage,
};
use crate::config::options::KeepVolatilePolicy;
use crate::storage::node_of_thread;
use crate::xct::xct_id::XctId;

pub struct SequentialComposer<'a> {
    storage: &'a SequentialStorage,
}

impl<'a> SequentialComposer<'a> {
    pub fn new(storage: &'a SequentialStorage) -> SequentialComposer<'a> {
        SequentialComposer { storage }
    }

    pub fn compose(&self, args: &mut ComposeArguments<'_>) -> Result<()> {
        let storage = self.storage;
        args.root_info_page.init_header(
            storage.id(),
            PageType::SequentialChunk,
            args.partition as u8,
            0,
            0,
            0,
        );
        let mut entries = 0u32;
        let mut page: Option<Box<Page>> = None;
        let mut fill = 0usize;
        let mut chunk_seq = 0u64;

        for frame in args.log_stream {
            if args.stop_requested.load(Ordering::Acquire) {
                return Err(ErrorCode::SnapshotStopped.into());
            }
            debug_assert_eq!(frame.header.log_kind(), Some(LogKind::Append));
            let needed = entry_len(frame.payload.len());
            if page.is_some() && fill + needed > PAGE_PAYLOAD_SIZE {
                let full = page.take().unwrap();
                full.set_record_count(fill as u32);
                let pointer = args.snapshot_writer.write_page(&full)?;
                Self::push_root_info(args.root_info_page, &mut entries, pointer)?;
            }
            if page.is_none() {
                let fresh = Page::new_zeroed();
                fresh.init_header(
                    storage.id(),
                    PageType::SequentialChunk,
                    args.partition as u8,
                    chunk_seq,
                    0,
                    0,
                );
                chunk_seq += 1;
                fill = 0;
                page = Some(fresh);
            }
            let target = page.as_deref().expect("chunk page exists");
            write_entry(
                target,
                fill,
                XctId::new(Epoch::from_raw(frame.header.epoch), frame.header.ordinal),
                &frame.payload,
            );
            fill += needed;
        }
        if let Some(last) = page.take() {
            last.set_record_count(fill as u32);
            let pointer = args.snapshot_writer.write_page(&last)?;
            Self::push_root_info(args.root_info_page, &mut entries, pointer)?;
        }
        args.root_info_page.set_record_count(entries);
        debug!(
            storage_id = storage.id(),
            partition = args.partition,
            chunks = entries,
            "sequential partition composed"
        );
        Ok(())
    }

    fn push_root_info(root_info: &Page, entries: &mut u32, pointer: SnapshotPagePointer) -> Result<()> {
        if *entries as usize >= PAGE_PAYLOAD_SIZE / 8 {
            bail!("sequential root-info page overflow");
        }
        unsafe {
            (root_info.payload_ptr() as *mut u64)
                .add(*entries as usize)
                .write_unaligned(pointer.raw());
        }
        *entries += 1;
        Ok(())
    }

    pub fn construct_root(
        &self,
        args: &mut ConstructRootArguments<'_>,
    ) -> Result<SnapshotPagePointer> {
        let storage = self.storage;
        let page = Page::new_zeroed();
        page.init_header(storage.id(), PageType::SequentialChunk, 0, 0, 0, 0);
        let mut count = 0u32;

        // History only grows: previous chunks stay in front.
        let previous = storage.root_snapshot_pointer();
        if !previous.is_null() {
            let previous_root = Page::new_zeroed();
            args.previous_files.read_page(previous, &previous_root)?;
            let previous_count = previous_root.header().record_count;
            for index in 0..previous_count {
                let pointer = unsafe {
                    (previous_root.payload_ptr() as *const u64)
                        .add(index as usize)
                        .read_unaligned()
                };
                Self::push_root_info(&page, &mut count, SnapshotPagePointer::from_raw(pointer))?;
            }
        }
        for root_info in args.root_info_pages {
            let info_count = root_info.header().record_count;
            for index in 0..info_count {
                let pointer = unsafe {
                    (root_info.payload_ptr() as *const u64)
                        .add(index as usize)
                        .read_unaligned()
                };
                Self::push_root_info(&page, &mut count, SnapshotPagePointer::from_raw(pointer))?;
            }
        }
        page.set_record_count(count);
        args.snapshot_writer.write_page(&page)
    }

    pub fn drop_volatiles(&self, args: &mut DropVolatilesArguments<'_, '_>) -> DropResult {
        let storage = self.storage;
        let mut result = DropResult::new(args.snapshot);
        let valid_until = args.snapshot.valid_until_epoch;
        let keep = matches!(args.policy, KeepVolatilePolicy::KeepAll);

        for (thread_id, chain) in storage.chains().iter().enumerate() {
            if node_of_thread(thread_id as u16, args.partitions) != args.partition {
                continue;
            }
            let mut pointer = chain.head.volatile();
            let mut new_head = VolatilePagePointer::null();
            while !pointer.is_null() {
                let page = storage.pool().resolve(pointer);
                let fill = page.record_count_atomic().load(Ordering::Acquire) as usize;
                let mut chunk_clean = true;
                for epoch in collect_entries_epochs(page, fill) {
                    if valid_until.before(epoch) {
                        chunk_clean = false;
                    }
                    result.on_record_observed(epoch);
                }
                let next = VolatilePagePointer::from_offset(
                    page.next_chunk_atomic().load(Ordering::Acquire),
                );
                // Only the fully covered prefix of a chain may go; the
                // chain stays intact from the first dirty chunk on.
                if chunk_clean && !keep && new_head.is_null() {
                    args.dropped_chunk.add(pointer);
                    if next.is_null() {
                        chain.tail.store(0, Ordering::Release);
                    }
                } else if new_head.is_null() {
                    new_head = pointer;
                    if keep && chunk_clean {
                        result.dropped_all = false;
                    }
                }
                pointer = next;
            }
            chain.head.set_volatile(new_head);
        }
        storage.set_truncate_epoch(valid_until);
        result
    }

    pub fn drop_root_volatile(&self, args: &DropVolatilesArguments<'_, '_>) {
        // Chunk chains were already handled per partition; the root here
        // is only the snapshot-side pointer.
        self.storage.install_root_snapshot(args.new_root_pointer);
    }
}
