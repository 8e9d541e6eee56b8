//! Engine-wide volatile page pool.
//!
//! All volatile pages come from one preallocated slab so that a
//! `VolatilePagePointer` is just a `u32` offset. Offset 0 is reserved as
//! the null pointer. Grabbing zeroes the page; releasing is cheap and
//! usually batched through a [`DroppedChunk`] so `drop_volatiles` does not
//! take the free-list lock once per page.

use parking_lot::Mutex;

use crate::config::DROPPED_CHUNK_CAPACITY;
use crate::error::{CodeResult, ErrorCode};
use crate::storage::page::{Page, PagePoolOffset, VolatilePagePointer};

#[derive(Debug)]
pub struct PagePool {
    pages: Box<[Page]>,
    free: Mutex<Vec<PagePoolOffset>>,
    capacity: usize,
}

impl PagePool {
    /// Allocates a pool with `page_count` usable pages.
    pub fn new(page_count: usize) -> PagePool {
        let total = page_count + 1; // slot 0 is the null page, never used
        // All-zero is a valid initial state for a page.
        let pages: Box<[Page]> = unsafe { Box::new_zeroed_slice(total).assume_init() };
        // Hand out low offsets first so tests see stable numbering.
        let free: Vec<PagePoolOffset> = (1..total as PagePoolOffset).rev().collect();
        PagePool {
            pages,
            free: Mutex::new(free),
            capacity: page_count,
        }
    }

    /// Grabs one zeroed page.
    pub fn grab(&self) -> CodeResult<VolatilePagePointer> {
        let offset = {
            let mut free = self.free.lock();
            free.pop().ok_or(ErrorCode::NoFreeVolatilePages)?
        };
        let page = self.resolve(VolatilePagePointer::from_offset(offset));
        page.zero();
        Ok(VolatilePagePointer::from_offset(offset))
    }

    /// Resolves a non-null pointer to its page.
    pub fn resolve(&self, pointer: VolatilePagePointer) -> &Page {
        debug_assert!(!pointer.is_null());
        &self.pages[pointer.offset() as usize]
    }

    pub fn release(&self, pointer: VolatilePagePointer) {
        debug_assert!(!pointer.is_null());
        self.free.lock().push(pointer.offset());
    }

    pub fn release_batch(&self, offsets: &[PagePoolOffset]) {
        if offsets.is_empty() {
            return;
        }
        self.free.lock().extend_from_slice(offsets);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Percent of the pool currently free, rounded down.
    pub fn free_percent(&self) -> u8 {
        if self.capacity == 0 {
            return 100;
        }
        ((self.free_count() * 100) / self.capacity) as u8
    }
}

/// Per-caller batch of dropped pages, flushed to the pool at capacity and
/// on drop.
pub struct DroppedChunk<'a> {
    pool: &'a PagePool,
    offsets: Vec<PagePoolOffset>,
    dropped_total: u64,
}

impl<'a> DroppedChunk<'a> {
    pub fn new(pool: &'a PagePool) -> DroppedChunk<'a> {
        DroppedChunk {
            pool,
            offsets: Vec::with_capacity(DROPPED_CHUNK_CAPACITY),
            dropped_total: 0,
        }
    }

    pub fn add(&mut self, pointer: VolatilePagePointer) {
        self.offsets.push(pointer.offset());
        self.dropped_total += 1;
        if self.offsets.len() >= DROPPED_CHUNK_CAPACITY {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        self.pool.release_batch(&self.offsets);
        self.offsets.clear();
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }
}

impl Drop for DroppedChunk<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grab_hands_out_distinct_offsets() {
        let pool = PagePool::new(4);
        let a = pool.grab().unwrap();
        let b = pool.grab().unwrap();
        assert_ne!(a, b);
        assert!(!a.is_null());
        assert!(!b.is_null());
    }

    #[test]
    fn exhausted_pool_reports_no_free_pages() {
        let pool = PagePool::new(2);
        pool.grab().unwrap();
        pool.grab().unwrap();
        assert_eq!(pool.grab().unwrap_err(), ErrorCode::NoFreeVolatilePages);
    }

    #[test]
    fn release_makes_a_page_reusable() {
        let pool = PagePool::new(1);
        let a = pool.grab().unwrap();
        pool.release(a);
        let b = pool.grab().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn grabbed_pages_are_zeroed() {
        let pool = PagePool::new(1);
        let a = pool.grab().unwrap();
        let page = pool.resolve(a);
        page.set_record_count(42);
        pool.release(a);
        let b = pool.grab().unwrap();
        assert_eq!(pool.resolve(b).header().record_count, 0);
    }

    #[test]
    fn free_percent_tracks_usage() {
        let pool = PagePool::new(4);
        assert_eq!(pool.free_percent(), 100);
        let _a = pool.grab().unwrap();
        let _b = pool.grab().unwrap();
        assert_eq!(pool.free_percent(), 50);
    }

    #[test]
    fn dropped_chunk_batches_releases() {
        let pool = PagePool::new(8);
        let mut grabbed = Vec::new();
        for _ in 0..8 {
            grabbed.push(pool.grab().unwrap());
        }
        assert_eq!(pool.free_count(), 0);
        {
            let mut chunk = DroppedChunk::new(&pool);
            for pointer in grabbed {
                chunk.add(pointer);
            }
            assert_eq!(chunk.dropped_total(), 8);
        }
        assert_eq!(pool.free_count(), 8);
    }
}
