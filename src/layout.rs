//! Shared region layout: bus header, slot table, value arena
//!
//! A bus region is three contiguous parts:
//!
//! ```text
//! | BusHeader | Slot * slots | value arena (slots * max_val_sz bytes) |
//! ```
//!
//! Each slot owns a fixed lane of the value arena at `val_off`. The layout is
//! `#[repr(C)]` and identical in every attached process; `magic`/`version`
//! gate incompatible readers out.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Magic number identifying a bus region ("KVBU")
pub const BUS_MAGIC: u32 = 0x4B56_4255;
/// Version of the region layout (not the library version)
pub const BUS_VERSION: u32 = 1;
/// Key capacity per slot, in bytes
pub const KEY_MAX: usize = 64;

/// Slot states
pub mod slot_state {
    /// Never held an entry since creation or last vacuum; terminates lookups.
    pub const EMPTY: u8 = 0;
    /// Holds a live entry.
    pub const OCCUPIED: u8 = 1;
    /// Held an entry that was unset; skipped by lookups, reusable by inserts.
    pub const TOMBSTONE: u8 = 2;
}

/// Bus header stored at region offset 0
///
/// `slots` and `max_val_sz` are fixed at creation. `magic` is stored last
/// (release) during initialization so a concurrent opener never sees a
/// half-built header.
#[repr(C, align(64))]
pub struct BusHeader {
    /// Magic number ([`BUS_MAGIC`]) published after full initialization
    pub magic: AtomicU32,
    /// Layout version ([`BUS_VERSION`])
    pub version: u32,
    /// Total slot capacity
    pub slots: u32,
    /// Maximum bytes per value
    pub max_val_sz: u32,
    /// Global mutation clock, bumped by every successful set/unset
    pub epoch: AtomicU64,
    /// Auto-vacuum scrubber enable flag; metadata, not part of the data epoch
    pub auto_vacuum: AtomicU32,
}

/// One key-value slot
///
/// `epoch` is the slot's seqlock: odd while a writer holds the slot, even
/// when stable. The plain fields (`key`, `key_len`) are written only inside
/// an odd-epoch window and validated by readers re-checking the epoch.
#[repr(C, align(64))]
pub struct Slot {
    /// FNV-1a hash of the key
    pub hash: AtomicU64,
    /// Per-slot seqlock and change-notification counter
    pub epoch: AtomicU64,
    /// Fixed offset of this slot's lane in the value arena
    pub val_off: u64,
    /// Occupied bytes of the value lane
    pub val_len: AtomicU32,
    /// Occupied bytes of `key`
    pub key_len: UnsafeCell<u32>,
    /// Slot state (empty, occupied, tombstone)
    pub state: AtomicU8,
    /// Key bytes, zero-padded to [`KEY_MAX`]
    pub key: UnsafeCell<[u8; KEY_MAX]>,
}

impl Slot {
    /// Read the key bytes without synchronization
    ///
    /// # Safety
    /// Caller must bracket the read with a stable-epoch check (or hold the
    /// slot's write claim); the returned bytes are garbage otherwise.
    #[inline]
    pub unsafe fn key_bytes(&self) -> ([u8; KEY_MAX], usize) {
        let key = std::ptr::read_volatile(self.key.get());
        let len = std::ptr::read_volatile(self.key_len.get()) as usize;
        (key, len.min(KEY_MAX))
    }

    /// Write the key bytes, zero-padding the remainder of the field
    ///
    /// # Safety
    /// Caller must hold this slot's write claim (odd epoch).
    #[inline]
    pub unsafe fn set_key_bytes(&self, key: &[u8]) {
        debug_assert!(key.len() <= KEY_MAX);
        let buf = self.key.get();
        std::ptr::write_bytes(buf.cast::<u8>(), 0, KEY_MAX);
        std::ptr::copy_nonoverlapping(key.as_ptr(), buf.cast::<u8>(), key.len());
        std::ptr::write_volatile(self.key_len.get(), key.len() as u32);
    }
}

/// Bytes needed for a region of `slots` slots and `max_val_sz`-byte values
pub fn region_size(slots: u32, max_val_sz: u32) -> usize {
    std::mem::size_of::<BusHeader>()
        + slots as usize * std::mem::size_of::<Slot>()
        + slots as usize * max_val_sz as usize
}

/// Byte offset of the slot array within a region
#[inline(always)]
pub const fn slots_offset() -> usize {
    std::mem::size_of::<BusHeader>()
}

/// Byte offset of the value arena within a region
#[inline(always)]
pub fn arena_offset(slots: u32) -> usize {
    slots_offset() + slots as usize * std::mem::size_of::<Slot>()
}

/// Initialize a fresh, zeroed region in place
///
/// Writes every header field and slot, then publishes `magic` with release
/// ordering as the final step.
///
/// # Safety
/// `base` must point to at least [`region_size`] zeroed, writable bytes that
/// no other thread or process is concurrently initializing.
pub unsafe fn init_region(base: *mut u8, slots: u32, max_val_sz: u32) {
    let header = base.cast::<BusHeader>();
    (*header).version = BUS_VERSION;
    (*header).slots = slots;
    (*header).max_val_sz = max_val_sz;
    (*header).epoch = AtomicU64::new(1);
    (*header).auto_vacuum = AtomicU32::new(1);

    let slot_base = base.add(slots_offset()).cast::<Slot>();
    for i in 0..slots as usize {
        let slot = &mut *slot_base.add(i);
        slot.hash = AtomicU64::new(0);
        slot.epoch = AtomicU64::new(0);
        slot.val_off = i as u64 * max_val_sz as u64;
        slot.val_len = AtomicU32::new(0);
        slot.key_len = UnsafeCell::new(0);
        slot.state = AtomicU8::new(slot_state::EMPTY);
        slot.key = UnsafeCell::new([0u8; KEY_MAX]);
    }

    (*header).magic.store(BUS_MAGIC, Ordering::Release);
}

/// Copy of the bus header fields at one instant
#[derive(Debug, Clone)]
pub struct HeaderSnapshot {
    pub magic: u32,
    pub version: u32,
    pub slots: u32,
    pub max_val_sz: u32,
    pub epoch: u64,
    pub auto_vacuum: bool,
}

/// Copy of one slot's fields at one instant
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub hash: u64,
    pub epoch: u64,
    pub val_off: u64,
    pub val_len: u32,
    pub key: String,
}
