//! # MCS-style Reader/Writer Record Lock
//!
//! The second half of every record header is a single `u64` lock word:
//!
//! ```text
//! +----------+---------+------------------+--------------+
//! | x_held(1)| pad(15) | queue_tail (32)  | readers (16) |
//! +----------+---------+------------------+--------------+
//! ```
//!
//! Waiters never spin on the shared word. Each waiter allocates a queue
//! block from its thread's [`McsBlockArena`], swaps itself in as the queue
//! tail, links itself behind the previous tail, and then spins on its own
//! cache line until the predecessor hands it the queue head. The head
//! position implies "no exclusive holder": an X holder keeps headship for
//! the whole hold and releases it only after clearing `x_held`.
//!
//! - Readers with an empty queue take the fast path: a whole-word CAS that
//!   increments `readers`. Queued readers increment `readers` on reaching
//!   the head and immediately pass headship on, so bursts of readers drain
//!   the queue in a grant chain.
//! - Writers at the head wait for `readers == 0`, then set `x_held`.
//! - `try_lock` never blocks: it reports `Conflict` when an incompatible
//!   holder owns the word and `WouldBlock` when only queue waiters are in
//!   the way.
//! - S→X upgrade succeeds in place only for the sole reader with an empty
//!   queue; otherwise the caller demotes and re-acquires through its lock
//!   list.
//!
//! Blocking `lock` is non-cancellable. Queue blocks are bump-allocated per
//! transaction and recycled wholesale at the next transaction begin; a
//! block is never referenced by other threads after its lock is released,
//! which is what makes the recycling safe.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::config::MCS_BLOCKS_PER_THREAD;

/// Packed queue block id: `(thread_id + 1) << 16 | block_index`; 0 = none.
pub type McsBlockIndex = u32;

const READERS_MASK: u64 = 0xFFFF;
const TAIL_SHIFT: u64 = 16;
const TAIL_FIELD: u64 = 0xFFFF_FFFF << TAIL_SHIFT;
const X_HELD: u64 = 1 << 63;

const BLOCK_WAITING: u32 = 1;
const BLOCK_GRANTED: u32 = 2;

/// Lock modes. Shared excludes only Exclusive; Exclusive excludes
/// everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Result of a non-blocking acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLockOutcome {
    /// Lock taken. The block index is 0 for shared acquisitions.
    Acquired(McsBlockIndex),
    /// Only queued waiters are in the way; a blocking lock would park.
    WouldBlock,
    /// An incompatible holder currently owns the lock.
    Conflict,
}

/// One queue waiter slot. Padded to its own cache line so a spinning
/// waiter does not bounce anyone else's line.
#[repr(align(64))]
pub struct McsBlock {
    state: AtomicU32,
    successor: AtomicU32,
}

/// Per-thread slab of queue blocks, owned by the engine and indexed by
/// thread id. Reset (by cursor rewind) at every transaction begin.
pub struct McsBlockArena {
    blocks: Box<[McsBlock]>,
}

impl McsBlockArena {
    pub fn new() -> McsBlockArena {
        let mut blocks = Vec::with_capacity(MCS_BLOCKS_PER_THREAD);
        for _ in 0..MCS_BLOCKS_PER_THREAD {
            blocks.push(McsBlock {
                state: AtomicU32::new(0),
                successor: AtomicU32::new(0),
            });
        }
        McsBlockArena {
            blocks: blocks.into_boxed_slice(),
        }
    }
}

impl Default for McsBlockArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a lock operation needs to reach queue blocks: all threads'
/// arenas plus the calling thread's identity.
#[derive(Clone, Copy)]
pub struct McsContext<'a> {
    pub arenas: &'a [McsBlockArena],
    pub thread_id: u16,
}

impl<'a> McsContext<'a> {
    fn alloc_block(&self, cursor: &mut u32, state: u32) -> McsBlockIndex {
        let index = *cursor;
        let arena = &self.arenas[self.thread_id as usize];
        assert!(
            (index as usize) < arena.blocks.len(),
            "MCS block arena exhausted; transaction takes too many locks"
        );
        *cursor += 1;
        let block = &arena.blocks[index as usize];
        block.successor.store(0, Ordering::Relaxed);
        block.state.store(state, Ordering::Relaxed);
        pack(self.thread_id, index)
    }

    fn resolve(&self, packed: McsBlockIndex) -> &'a McsBlock {
        debug_assert!(packed != 0);
        let thread = (packed >> 16) - 1;
        let index = packed & 0xFFFF;
        &self.arenas[thread as usize].blocks[index as usize]
    }
}

fn pack(thread_id: u16, index: u32) -> McsBlockIndex {
    debug_assert!(index < 0x1_0000);
    ((thread_id as u32 + 1) << 16) | index
}

fn tail_of(word: u64) -> u32 {
    ((word & TAIL_FIELD) >> TAIL_SHIFT) as u32
}

fn readers_of(word: u64) -> u16 {
    (word & READERS_MASK) as u16
}

fn with_tail(word: u64, tail: u32) -> u64 {
    (word & !TAIL_FIELD) | ((tail as u64) << TAIL_SHIFT)
}

/// The lock word itself.
pub struct McsRwLock {
    word: AtomicU64,
}

impl McsRwLock {
    pub fn new() -> McsRwLock {
        McsRwLock {
            word: AtomicU64::new(0),
        }
    }

    /// Non-blocking acquisition. Never enqueues behind a waiter.
    pub fn try_lock(
        &self,
        mode: LockMode,
        ctx: &McsContext<'_>,
        cursor: &mut u32,
    ) -> TryLockOutcome {
        match mode {
            LockMode::Shared => loop {
                let word = self.word.load(Ordering::Acquire);
                if word & X_HELD != 0 {
                    return TryLockOutcome::Conflict;
                }
                if tail_of(word) != 0 || readers_of(word) == READERS_MASK as u16 {
                    return TryLockOutcome::WouldBlock;
                }
                if self
                    .word
                    .compare_exchange(word, word + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return TryLockOutcome::Acquired(0);
                }
            },
            LockMode::Exclusive => loop {
                let word = self.word.load(Ordering::Acquire);
                if word & X_HELD != 0 || readers_of(word) != 0 {
                    return TryLockOutcome::Conflict;
                }
                if tail_of(word) != 0 {
                    return TryLockOutcome::WouldBlock;
                }
                // Free word is exactly zero: no holder, no readers, no tail.
                let me = ctx.alloc_block(cursor, BLOCK_GRANTED);
                if self
                    .word
                    .compare_exchange(0, X_HELD | with_tail(0, me), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return TryLockOutcome::Acquired(me);
                }
                *cursor -= 1;
            },
        }
    }

    /// Blocking acquisition through the MCS queue. Returns the retained
    /// block (0 for shared mode, which detaches before returning).
    pub fn lock(&self, mode: LockMode, ctx: &McsContext<'_>, cursor: &mut u32) -> McsBlockIndex {
        match mode {
            LockMode::Shared => {
                // Fast path: empty queue, no writer.
                loop {
                    let word = self.word.load(Ordering::Acquire);
                    if word & X_HELD != 0
                        || tail_of(word) != 0
                        || readers_of(word) == READERS_MASK as u16
                    {
                        break;
                    }
                    if self
                        .word
                        .compare_exchange(word, word + 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return 0;
                    }
                }
                let me = ctx.alloc_block(cursor, BLOCK_WAITING);
                let pred = self.swap_tail(me);
                if pred != 0 {
                    ctx.resolve(pred).successor.store(me, Ordering::Release);
                    spin_until_granted(ctx.resolve(me));
                }
                // At the head no writer holds the lock; join the readers
                // and hand the head position on.
                debug_assert!(self.word.load(Ordering::Acquire) & X_HELD == 0);
                self.word.fetch_add(1, Ordering::AcqRel);
                self.detach_head(ctx, me);
                0
            }
            LockMode::Exclusive => {
                let me = ctx.alloc_block(cursor, BLOCK_WAITING);
                let pred = self.swap_tail(me);
                if pred != 0 {
                    ctx.resolve(pred).successor.store(me, Ordering::Release);
                    spin_until_granted(ctx.resolve(me));
                }
                // Head position: drain readers, then claim exclusivity.
                let mut spins = 0u32;
                loop {
                    let word = self.word.load(Ordering::Acquire);
                    if readers_of(word) == 0 {
                        debug_assert!(word & X_HELD == 0);
                        if self
                            .word
                            .compare_exchange(
                                word,
                                word | X_HELD,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            return me;
                        }
                        continue;
                    }
                    relax(&mut spins);
                }
            }
        }
    }

    /// Releases a lock taken by `lock` or `try_lock`.
    pub fn unlock(&self, mode: LockMode, ctx: &McsContext<'_>, block: McsBlockIndex) {
        match mode {
            LockMode::Shared => {
                debug_assert_eq!(block, 0);
                let prev = self.word.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(readers_of(prev) > 0);
            }
            LockMode::Exclusive => {
                debug_assert!(block != 0);
                self.word.fetch_and(!X_HELD, Ordering::AcqRel);
                self.detach_head(ctx, block);
            }
        }
    }

    /// In-place S→X upgrade for the sole reader with an empty queue.
    /// Returns the retained X block, or `None` when the caller must demote
    /// and re-acquire in lock-list order.
    pub fn try_upgrade(&self, ctx: &McsContext<'_>, cursor: &mut u32) -> Option<McsBlockIndex> {
        let word = self.word.load(Ordering::Acquire);
        if word & X_HELD != 0 || readers_of(word) != 1 || tail_of(word) != 0 {
            return None;
        }
        let me = ctx.alloc_block(cursor, BLOCK_GRANTED);
        let new = X_HELD | with_tail(0, me);
        if self
            .word
            .compare_exchange(word, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(me)
        } else {
            *cursor -= 1;
            None
        }
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.word.load(Ordering::Acquire) & X_HELD != 0
    }

    pub fn reader_count(&self) -> u16 {
        readers_of(self.word.load(Ordering::Acquire))
    }

    fn swap_tail(&self, me: McsBlockIndex) -> McsBlockIndex {
        loop {
            let word = self.word.load(Ordering::Acquire);
            let new = with_tail(word, me);
            if self
                .word
                .compare_exchange_weak(word, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return tail_of(word);
            }
        }
    }

    /// Gives up the queue head: grant the successor, or clear the tail if
    /// nobody is queued behind us.
    fn detach_head(&self, ctx: &McsContext<'_>, me: McsBlockIndex) {
        let my_block = ctx.resolve(me);
        let mut spins = 0u32;
        loop {
            let successor = my_block.successor.load(Ordering::Acquire);
            if successor != 0 {
                ctx.resolve(successor)
                    .state
                    .store(BLOCK_GRANTED, Ordering::Release);
                return;
            }
            let word = self.word.load(Ordering::Acquire);
            if tail_of(word) == me {
                if self
                    .word
                    .compare_exchange(word, with_tail(word, 0), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            // A successor swapped the tail but has not linked yet.
            relax(&mut spins);
        }
    }
}

impl Default for McsRwLock {
    fn default() -> Self {
        Self::new()
    }
}

fn spin_until_granted(block: &McsBlock) {
    let mut spins = 0u32;
    while block.state.load(Ordering::Acquire) != BLOCK_GRANTED {
        relax(&mut spins);
    }
}

fn relax(spins: &mut u32) {
    *spins += 1;
    if *spins % 256 == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}
