//! Per-slot sequence lock protocol
//!
//! Every slot carries a 64-bit epoch: odd while a writer holds the slot,
//! even when stable. Writers serialize through a compare-and-swap on the
//! even value, so colliding mutations take turns; readers never block, they
//! validate the epoch around their copy and retry on a torn read.
//!
//! The same counter doubles as the change-notification clock: a committed
//! mutation leaves the epoch even and two higher, which is what `poll`
//! watches for.

use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Bounded retry budget for readers under write contention
pub const MAX_READ_RETRIES: u32 = 64;
/// Bounded restart budget for writers losing slot claims
pub const MAX_WRITE_RETRIES: u32 = 256;
/// Busy spins before a backoff starts yielding the CPU
const SPIN_LIMIT: u32 = 64;

/// Exclusive write window on one slot epoch
///
/// Obtained by [`try_begin_write`]; the epoch stays odd until the claim is
/// committed or aborted. Dropping a claim without doing either leaves the
/// slot wedged, so every path must resolve it.
#[must_use]
pub struct WriteClaim<'a> {
    epoch: &'a AtomicU64,
    begun: u64,
}

impl WriteClaim<'_> {
    /// Publish the mutation: epoch becomes `begun + 2`, even again
    #[inline]
    pub fn commit(self) {
        fence(Ordering::Release);
        self.epoch.fetch_add(1, Ordering::Release);
    }

    /// Abandon the claim, restoring the pre-claim epoch
    ///
    /// Only valid when nothing was modified under the claim; observers see
    /// no mutation at all.
    #[inline]
    pub fn abort(self) {
        self.epoch.store(self.begun, Ordering::Release);
    }
}

/// Try to claim a slot for writing by flipping its epoch even to odd
///
/// Returns `None` when another writer holds the slot or wins the race.
#[inline]
pub fn try_begin_write(epoch: &AtomicU64) -> Option<WriteClaim<'_>> {
    let e = epoch.load(Ordering::Relaxed);
    if e & 1 != 0 {
        return None;
    }
    epoch
        .compare_exchange(e, e + 1, Ordering::AcqRel, Ordering::Relaxed)
        .ok()?;
    Some(WriteClaim { epoch, begun: e })
}

/// Begin a validated read: returns the stable epoch, or `None` mid-write
#[inline]
pub fn read_begin(epoch: &AtomicU64) -> Option<u64> {
    let e = epoch.load(Ordering::Acquire);
    (e & 1 == 0).then_some(e)
}

/// Finish a validated read: `true` iff no writer intervened since `begun`
#[inline]
pub fn read_commit(epoch: &AtomicU64, begun: u64) -> bool {
    fence(Ordering::Acquire);
    epoch.load(Ordering::Acquire) == begun
}

/// Spin-then-yield backoff for bounded retry loops
pub struct Backoff {
    step: u32,
}

impl Backoff {
    #[inline]
    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Wait a little: busy-spin first, yield the CPU once contended
    #[inline]
    pub fn snooze(&mut self) {
        if self.step < SPIN_LIMIT {
            for _ in 0..(1 << self.step.min(6)) {
                core::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
