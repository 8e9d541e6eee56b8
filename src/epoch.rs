//! # Epoch Clock
//!
//! Coarse-grained global time. Every commit id carries the epoch it was
//! issued in; the log subsystem advances the global epoch on a timer and
//! publishes a trailing durable epoch once all records of an epoch have been
//! fsynced. The snapshot pipeline only ever consumes fully durable epochs.
//!
//! ## Representation
//!
//! An epoch is a 32-bit cyclic counter. `0` is reserved as the invalid
//! epoch and `1` is the first epoch a fresh engine runs in. Arithmetic wraps
//! around, skipping the invalid value, and comparisons are modular within a
//! half-range window of 2³¹: `a.before(b)` holds iff the cyclic distance
//! from `a` to `b` is in `(0, 2³¹)`. The engine never keeps two live epochs
//! further apart than the window, so the ordering is total in practice.
//!
//! Two atomics in [`EpochClock`] hold the current global epoch and the
//! durable epoch. Only the log manager stores to them; everyone else reads.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Reserved "no epoch" value.
pub const INVALID_EPOCH: u32 = 0;
/// The epoch a fresh engine starts in.
pub const INITIAL_EPOCH: u32 = 1;

const HALF_RANGE: u32 = 1 << 31;

/// A point on the cyclic epoch clock.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch(u32);

impl Epoch {
    pub const fn invalid() -> Epoch {
        Epoch(INVALID_EPOCH)
    }

    pub const fn initial() -> Epoch {
        Epoch(INITIAL_EPOCH)
    }

    pub const fn from_raw(raw: u32) -> Epoch {
        Epoch(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != INVALID_EPOCH
    }

    /// The next epoch, wrapping around and skipping the invalid value.
    pub const fn one_more(self) -> Epoch {
        let next = self.0.wrapping_add(1);
        if next == INVALID_EPOCH {
            Epoch(INITIAL_EPOCH)
        } else {
            Epoch(next)
        }
    }

    /// The previous epoch, wrapping around and skipping the invalid value.
    pub const fn one_less(self) -> Epoch {
        let prev = self.0.wrapping_sub(1);
        if prev == INVALID_EPOCH {
            Epoch(u32::MAX)
        } else {
            Epoch(prev)
        }
    }

    /// This epoch advanced by `count`.
    pub fn add(self, count: u32) -> Epoch {
        let mut e = self;
        for _ in 0..count {
            e = e.one_more();
        }
        e
    }

    /// Modular "strictly earlier than" within the 2³¹ window.
    /// Both sides must be valid.
    pub fn before(self, other: Epoch) -> bool {
        debug_assert!(self.is_valid() && other.is_valid());
        let distance = other.0.wrapping_sub(self.0);
        distance != 0 && distance < HALF_RANGE
    }

    pub fn after(self, other: Epoch) -> bool {
        other.before(self)
    }

    /// Replaces `self` with `other` if `other` is later. An invalid `self`
    /// always loses; an invalid `other` never wins.
    pub fn store_max(&mut self, other: Epoch) {
        if !other.is_valid() {
            return;
        }
        if !self.is_valid() || self.before(other) {
            *self = other;
        }
    }

    pub fn min(self, other: Epoch) -> Epoch {
        if self.before(other) {
            self
        } else {
            other
        }
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Epoch({})", self.0)
        } else {
            write!(f, "Epoch(invalid)")
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The two engine-global epoch atomics. Stored in the engine; written only
/// by the log manager's advancer thread.
pub struct EpochClock {
    current: AtomicU32,
    durable: AtomicU32,
}

impl EpochClock {
    pub fn new() -> EpochClock {
        EpochClock {
            current: AtomicU32::new(INITIAL_EPOCH),
            durable: AtomicU32::new(INVALID_EPOCH),
        }
    }

    /// Resumes the clock from a persisted state, e.g. after loading a
    /// snapshot manifest.
    pub fn resume(current: Epoch, durable: Epoch) -> EpochClock {
        EpochClock {
            current: AtomicU32::new(current.raw()),
            durable: AtomicU32::new(durable.raw()),
        }
    }

    pub fn current_global(&self) -> Epoch {
        Epoch(self.current.load(Ordering::SeqCst))
    }

    pub fn durable(&self) -> Epoch {
        Epoch(self.durable.load(Ordering::SeqCst))
    }

    /// Advances the global epoch by one. Log manager only.
    pub fn advance_global(&self) -> Epoch {
        let next = Epoch(self.current.load(Ordering::SeqCst)).one_more();
        self.current.store(next.raw(), Ordering::SeqCst);
        next
    }

    /// Publishes a new durable epoch. Log manager only; must not regress.
    pub fn publish_durable(&self, epoch: Epoch) {
        debug_assert!(epoch.is_valid());
        debug_assert!({
            let prev = self.durable();
            !prev.is_valid() || prev == epoch || prev.before(epoch)
        });
        self.durable.store(epoch.raw(), Ordering::SeqCst);
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}
