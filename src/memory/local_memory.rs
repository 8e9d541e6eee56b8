//! Per-thread transaction scratch arena.
//!
//! Backed by a `bumpalo` bump allocator with a hard byte limit. The arena
//! belongs to one thread context; a transaction acquires chunks while it
//! runs and the whole arena resets at the next `activate`. Pointers into
//! the arena are therefore valid exactly until the owning transaction ends,
//! which is the lifetime of the read/write sets that hold them.
//!
//! The base region may move on growth; callers must not hold a pointer
//! across an `acquire` call.

use bumpalo::Bump;

use crate::error::{CodeResult, ErrorCode};

pub struct LocalWorkMemory {
    arena: Bump,
    limit: usize,
}

impl LocalWorkMemory {
    pub fn new(limit_bytes: usize) -> LocalWorkMemory {
        let arena = Bump::new();
        arena.set_allocation_limit(Some(limit_bytes));
        LocalWorkMemory {
            arena,
            limit: limit_bytes,
        }
    }

    /// Acquires `size` bytes of zeroed scratch, aligned to 8.
    /// The returned pointer is valid until [`reset`](Self::reset).
    pub fn acquire(&self, size: usize) -> CodeResult<*mut u8> {
        let layout = std::alloc::Layout::from_size_align(size.max(1), 8)
            .map_err(|_| ErrorCode::NoMoreLocalWorkMemory)?;
        match self.arena.try_alloc_layout(layout) {
            Ok(ptr) => {
                let raw = ptr.as_ptr();
                unsafe { std::ptr::write_bytes(raw, 0, size) };
                Ok(raw)
            }
            Err(_) => Err(ErrorCode::NoMoreLocalWorkMemory),
        }
    }

    /// Copies `bytes` into the arena and returns the stable copy.
    pub fn copy_in(&self, bytes: &[u8]) -> CodeResult<*mut u8> {
        let dest = self.acquire(bytes.len())?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest, bytes.len()) };
        Ok(dest)
    }

    /// Frees everything allocated since the last reset. Called at
    /// transaction begin.
    pub fn reset(&mut self) {
        self.arena.reset();
        self.arena.set_allocation_limit(Some(self.limit));
    }

    pub fn allocated_bytes(&self) -> usize {
        self.arena.allocated_bytes()
    }
}
