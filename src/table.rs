//! Slot table: hashing, probing, and the mutation engine
//!
//! Keys hash with 64-bit FNV-1a and resolve collisions by linear probing
//! from `hash % slots`. An Empty slot terminates a lookup (keys are inserted
//! along the same sequence, so nothing can live past it); Tombstoned slots
//! are skipped by lookups but reused by inserts.
//!
//! Writers claim a slot through its seqlock epoch. Inserts additionally hold
//! the key's home slot for the duration of placement, which serializes
//! concurrent inserts of the same key; without that, two of them could pick
//! different reusable slots and leave a duplicate behind.

use crate::error::{BusError, Result};
use crate::layout::{
    arena_offset, slot_state, slots_offset, BusHeader, Slot, SlotSnapshot, KEY_MAX,
};
use crate::seqlock::{self, Backoff, MAX_READ_RETRIES, MAX_WRITE_RETRIES};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

/// Retries per slot when `list` hits a torn snapshot before skipping it
const LIST_SLOT_RETRIES: u32 = 8;

/// 64-bit FNV-1a over the key bytes
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h = (h ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// Linear probe sequence over the whole table, starting at `hash % slots`
pub struct ProbeSeq {
    start: usize,
    slots: usize,
    step: usize,
}

impl Iterator for ProbeSeq {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.step == self.slots {
            return None;
        }
        let idx = (self.start + self.step) % self.slots;
        self.step += 1;
        Some(idx)
    }
}

enum Attempt<T> {
    Done(T),
    Retry,
}

enum ReadOutcome {
    Hit(usize),
    TooSmall(usize),
    Mismatch,
}

/// Typed view over a mapped bus region
///
/// Carries only raw pointers; the mapping must outlive the table (the bus
/// handle owns both and drops the table first).
pub struct SlotTable {
    base: NonNull<u8>,
    slots: u32,
    max_val_sz: u32,
}

// SAFETY: all shared state behind `base` is either atomic or guarded by the
// per-slot seqlock protocol.
unsafe impl Send for SlotTable {}
unsafe impl Sync for SlotTable {}

impl SlotTable {
    /// Build a view over an initialized region
    ///
    /// # Safety
    /// `base` must point to a region whose header has been validated
    /// (magic, version, mapped size) and which stays mapped for the
    /// lifetime of the table.
    pub unsafe fn from_base(base: NonNull<u8>) -> Self {
        let header = &*base.as_ptr().cast::<BusHeader>();
        Self {
            base,
            slots: header.slots,
            max_val_sz: header.max_val_sz,
        }
    }

    #[inline(always)]
    pub fn header(&self) -> &BusHeader {
        unsafe { &*self.base.as_ptr().cast::<BusHeader>() }
    }

    #[inline(always)]
    pub fn slot_count(&self) -> u32 {
        self.slots
    }

    #[inline(always)]
    pub fn max_val_sz(&self) -> u32 {
        self.max_val_sz
    }

    #[inline(always)]
    pub fn slot(&self, idx: usize) -> &Slot {
        debug_assert!(idx < self.slots as usize);
        unsafe {
            &*self
                .base
                .as_ptr()
                .add(slots_offset())
                .cast::<Slot>()
                .add(idx)
        }
    }

    /// Stable (even) epoch of a slot, for change watchers
    #[inline(always)]
    pub fn slot_epoch(&self, idx: usize) -> u64 {
        self.slot(idx).epoch.load(Ordering::Acquire)
    }

    #[inline]
    pub fn probe(&self, hash: u64) -> ProbeSeq {
        ProbeSeq {
            start: (hash % self.slots as u64) as usize,
            slots: self.slots as usize,
            step: 0,
        }
    }

    #[inline]
    pub fn vacuum_enabled(&self) -> bool {
        self.header().auto_vacuum.load(Ordering::Relaxed) == 1
    }

    #[inline]
    fn lane_ptr(&self, slot: &Slot) -> *mut u8 {
        unsafe {
            self.base
                .as_ptr()
                .add(arena_offset(self.slots))
                .add(slot.val_off as usize)
        }
    }

    /// Racy key comparison used to pick probe targets; every decision built
    /// on it is re-validated under a claim or a stable epoch pair.
    fn slot_key_matches(&self, idx: usize, key: &[u8]) -> bool {
        let (kb, len) = unsafe { self.slot(idx).key_bytes() };
        &kb[..len] == key
    }

    fn validate_key(key: &str) -> Result<&[u8]> {
        let kb = key.as_bytes();
        if kb.is_empty() || kb.len() > KEY_MAX {
            return Err(BusError::InvalidKey {
                max: KEY_MAX,
                got: kb.len(),
            });
        }
        Ok(kb)
    }

    /// Insert or overwrite a key-value pair
    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let kb = Self::validate_key(key)?;
        if value.len() > self.max_val_sz as usize {
            return Err(BusError::ValueTooLarge {
                max: self.max_val_sz as usize,
                got: value.len(),
            });
        }

        let hash = fnv1a(kb);
        let mut backoff = Backoff::new();
        for _ in 0..MAX_WRITE_RETRIES {
            match self.try_set_once(hash, kb, value)? {
                Attempt::Done(()) => return Ok(()),
                Attempt::Retry => backoff.snooze(),
            }
        }
        Err(BusError::Contended)
    }

    fn try_set_once(&self, hash: u64, key: &[u8], value: &[u8]) -> Result<Attempt<()>> {
        // Decide between overwrite and insert from one probe pass.
        let mut reusable: Option<usize> = None;
        let mut overwrite: Option<usize> = None;
        let mut insert_at: Option<usize> = None;
        for idx in self.probe(hash) {
            let slot = self.slot(idx);
            let state = slot.state.load(Ordering::Acquire);
            if state == slot_state::EMPTY {
                insert_at = Some(reusable.unwrap_or(idx));
                break;
            }
            if state == slot_state::TOMBSTONE {
                if reusable.is_none() {
                    reusable = Some(idx);
                }
                continue;
            }
            if slot.hash.load(Ordering::Acquire) == hash && self.slot_key_matches(idx, key) {
                overwrite = Some(idx);
                break;
            }
        }

        if let Some(idx) = overwrite {
            return self.try_overwrite(idx, hash, key, value);
        }
        match insert_at.or(reusable) {
            Some(idx) => self.try_insert(idx, hash, key, value),
            None => Err(BusError::StoreFull),
        }
    }

    fn try_overwrite(&self, idx: usize, hash: u64, key: &[u8], value: &[u8]) -> Result<Attempt<()>> {
        let slot = self.slot(idx);
        let Some(claim) = seqlock::try_begin_write(&slot.epoch) else {
            return Ok(Attempt::Retry);
        };
        // The slot may have changed hands between the probe and the claim.
        if slot.state.load(Ordering::Relaxed) != slot_state::OCCUPIED
            || slot.hash.load(Ordering::Relaxed) != hash
            || !self.slot_key_matches(idx, key)
        {
            claim.abort();
            return Ok(Attempt::Retry);
        }

        unsafe { self.write_value(slot, value) };
        claim.commit();
        self.header().epoch.fetch_add(1, Ordering::Relaxed);
        Ok(Attempt::Done(()))
    }

    fn try_insert(&self, idx: usize, hash: u64, key: &[u8], value: &[u8]) -> Result<Attempt<()>> {
        let home_idx = (hash % self.slots as u64) as usize;
        let home = self.slot(home_idx);
        let target = self.slot(idx);

        let Some(home_claim) = seqlock::try_begin_write(&home.epoch) else {
            return Ok(Attempt::Retry);
        };
        let target_claim = if idx == home_idx {
            None
        } else {
            match seqlock::try_begin_write(&target.epoch) {
                Some(c) => Some(c),
                None => {
                    home_claim.abort();
                    return Ok(Attempt::Retry);
                }
            }
        };

        // With the home slot held no other insert of this key can run, so a
        // full chain re-walk settles the placement: the target must still be
        // reusable, no Empty slot may precede it (a vacuum reclaim would
        // orphan the entry), and the key must not have landed anywhere on
        // the chain in the meantime.
        let target_state = target.state.load(Ordering::Relaxed);
        let mut ok =
            target_state == slot_state::EMPTY || target_state == slot_state::TOMBSTONE;
        if ok {
            let mut reached_target = false;
            for widx in self.probe(hash) {
                if widx == idx {
                    reached_target = true;
                    continue;
                }
                let s = self.slot(widx);
                let state = s.state.load(Ordering::Acquire);
                if state == slot_state::EMPTY {
                    if !reached_target {
                        ok = false;
                    }
                    break;
                }
                if state == slot_state::OCCUPIED
                    && s.hash.load(Ordering::Acquire) == hash
                    && self.slot_key_matches(widx, key)
                {
                    ok = false;
                    break;
                }
            }
        }

        if !ok {
            if let Some(c) = target_claim {
                c.abort();
            }
            home_claim.abort();
            return Ok(Attempt::Retry);
        }

        unsafe {
            self.write_value(target, value);
            target.set_key_bytes(key);
        }
        target.hash.store(hash, Ordering::Release);
        target.state.store(slot_state::OCCUPIED, Ordering::Release);

        match target_claim {
            Some(c) => {
                c.commit();
                // The home slot itself was not modified.
                home_claim.abort();
            }
            None => home_claim.commit(),
        }
        self.header().epoch.fetch_add(1, Ordering::Relaxed);
        Ok(Attempt::Done(()))
    }

    /// # Safety
    /// Caller must hold the slot's write claim.
    unsafe fn write_value(&self, slot: &Slot, value: &[u8]) {
        let dst = self.lane_ptr(slot);
        if self.vacuum_enabled() {
            // Hygiene: old tail bytes never outlive the entry.
            std::ptr::write_bytes(dst, 0, self.max_val_sz as usize);
        }
        std::ptr::copy_nonoverlapping(value.as_ptr(), dst, value.len());
        slot.val_len.store(value.len() as u32, Ordering::Release);
    }

    /// Delete a key, returning the prior value length
    pub fn unset(&self, key: &str) -> Result<Option<usize>> {
        let kb = Self::validate_key(key)?;
        let hash = fnv1a(kb);
        let mut backoff = Backoff::new();
        for _ in 0..MAX_WRITE_RETRIES {
            match self.try_unset_once(hash, kb)? {
                Attempt::Done(res) => return Ok(res),
                Attempt::Retry => backoff.snooze(),
            }
        }
        Err(BusError::Contended)
    }

    fn try_unset_once(&self, hash: u64, key: &[u8]) -> Result<Attempt<Option<usize>>> {
        for idx in self.probe(hash) {
            let slot = self.slot(idx);
            let state = slot.state.load(Ordering::Acquire);
            if state == slot_state::EMPTY {
                return Ok(Attempt::Done(None));
            }
            if state == slot_state::TOMBSTONE {
                continue;
            }
            if slot.hash.load(Ordering::Acquire) != hash || !self.slot_key_matches(idx, key) {
                continue;
            }

            let Some(claim) = seqlock::try_begin_write(&slot.epoch) else {
                return Ok(Attempt::Retry);
            };
            if slot.state.load(Ordering::Relaxed) != slot_state::OCCUPIED
                || slot.hash.load(Ordering::Relaxed) != hash
                || !self.slot_key_matches(idx, key)
            {
                claim.abort();
                return Ok(Attempt::Retry);
            }

            let prior = slot.val_len.load(Ordering::Relaxed) as usize;
            slot.state.store(slot_state::TOMBSTONE, Ordering::Release);
            slot.hash.store(0, Ordering::Release);
            slot.val_len.store(0, Ordering::Release);
            unsafe {
                slot.set_key_bytes(&[]);
                if self.vacuum_enabled() {
                    std::ptr::write_bytes(self.lane_ptr(slot), 0, self.max_val_sz as usize);
                }
            }
            claim.commit();
            self.header().epoch.fetch_add(1, Ordering::Relaxed);
            return Ok(Attempt::Done(Some(prior)));
        }
        Ok(Attempt::Done(None))
    }

    /// Look up a key and copy its value
    ///
    /// `buf = None` queries the required size without copying. A too-small
    /// buffer fails with the size needed; the two-phase callers first probe
    /// with `None`, then call again.
    pub fn get(&self, key: &str, mut buf: Option<&mut [u8]>) -> Result<Option<usize>> {
        let kb = key.as_bytes();
        if kb.is_empty() || kb.len() > KEY_MAX {
            // Such a key can never be stored.
            return Ok(None);
        }
        let hash = fnv1a(kb);
        let got = buf.as_ref().map(|b| b.len());

        for idx in self.probe(hash) {
            let slot = self.slot(idx);
            let state = slot.state.load(Ordering::Acquire);
            if state == slot_state::EMPTY {
                return Ok(None);
            }
            if state == slot_state::TOMBSTONE || slot.hash.load(Ordering::Acquire) != hash {
                continue;
            }
            match self.read_slot_value(idx, kb, buf.as_deref_mut())? {
                ReadOutcome::Hit(len) => return Ok(Some(len)),
                ReadOutcome::TooSmall(need) => {
                    return Err(BusError::BufferTooSmall {
                        need,
                        got: got.unwrap_or(0),
                    })
                }
                ReadOutcome::Mismatch => continue,
            }
        }
        Ok(None)
    }

    fn read_slot_value(
        &self,
        idx: usize,
        key: &[u8],
        mut buf: Option<&mut [u8]>,
    ) -> Result<ReadOutcome> {
        let slot = self.slot(idx);
        let mut backoff = Backoff::new();
        for _ in 0..MAX_READ_RETRIES {
            let Some(begun) = seqlock::read_begin(&slot.epoch) else {
                backoff.snooze();
                continue;
            };

            let (kb, klen) = unsafe { slot.key_bytes() };
            let state = slot.state.load(Ordering::Acquire);
            let len = slot.val_len.load(Ordering::Acquire) as usize;
            let identity_ok = state == slot_state::OCCUPIED && &kb[..klen] == key;
            let mut too_small = false;
            if identity_ok {
                match buf.as_deref_mut() {
                    Some(b) if b.len() >= len => unsafe {
                        std::ptr::copy_nonoverlapping(self.lane_ptr(slot), b.as_mut_ptr(), len);
                    },
                    Some(_) => too_small = true,
                    None => {}
                }
            }

            if !seqlock::read_commit(&slot.epoch, begun) {
                backoff.snooze();
                continue;
            }
            return Ok(if !identity_ok {
                ReadOutcome::Mismatch
            } else if too_small {
                ReadOutcome::TooSmall(len)
            } else {
                ReadOutcome::Hit(len)
            });
        }
        Err(BusError::Contended)
    }

    /// Collect keys of occupied slots in physical table order
    ///
    /// Slots that keep tearing under write traffic are skipped; the result
    /// reflects the table at some point during the scan, not a linearizable
    /// snapshot.
    pub fn collect_keys(&self, max_keys: usize) -> Vec<String> {
        let mut keys = Vec::new();
        for idx in 0..self.slots as usize {
            if keys.len() >= max_keys {
                break;
            }
            let slot = self.slot(idx);
            if slot.state.load(Ordering::Acquire) != slot_state::OCCUPIED {
                continue;
            }
            let mut backoff = Backoff::new();
            for _ in 0..LIST_SLOT_RETRIES {
                let Some(begun) = seqlock::read_begin(&slot.epoch) else {
                    backoff.snooze();
                    continue;
                };
                let (kb, klen) = unsafe { slot.key_bytes() };
                let state = slot.state.load(Ordering::Acquire);
                if !seqlock::read_commit(&slot.epoch, begun) {
                    backoff.snooze();
                    continue;
                }
                if state == slot_state::OCCUPIED {
                    keys.push(String::from_utf8_lossy(&kb[..klen]).into_owned());
                }
                break;
            }
        }
        keys
    }

    /// Find the occupied slot holding `key`, returning its index and the
    /// stable epoch observed at match time
    pub fn find_slot(&self, key: &str) -> Result<Option<(usize, u64)>> {
        let kb = key.as_bytes();
        if kb.is_empty() || kb.len() > KEY_MAX {
            return Ok(None);
        }
        let hash = fnv1a(kb);

        for idx in self.probe(hash) {
            let slot = self.slot(idx);
            let state = slot.state.load(Ordering::Acquire);
            if state == slot_state::EMPTY {
                return Ok(None);
            }
            if state == slot_state::TOMBSTONE || slot.hash.load(Ordering::Acquire) != hash {
                continue;
            }

            let mut backoff = Backoff::new();
            let mut retries = 0;
            loop {
                if retries == MAX_READ_RETRIES {
                    return Err(BusError::Contended);
                }
                retries += 1;
                let Some(begun) = seqlock::read_begin(&slot.epoch) else {
                    backoff.snooze();
                    continue;
                };
                let (kb2, klen) = unsafe { slot.key_bytes() };
                let state = slot.state.load(Ordering::Acquire);
                if !seqlock::read_commit(&slot.epoch, begun) {
                    backoff.snooze();
                    continue;
                }
                if state == slot_state::OCCUPIED && &kb2[..klen] == kb {
                    return Ok(Some((idx, begun)));
                }
                break;
            }
        }
        Ok(None)
    }

    /// Stable copy of a slot's fields for diagnostics
    pub fn slot_snapshot(&self, key: &str) -> Result<Option<SlotSnapshot>> {
        let Some((idx, _)) = self.find_slot(key)? else {
            return Ok(None);
        };
        let slot = self.slot(idx);
        let mut backoff = Backoff::new();
        for _ in 0..MAX_READ_RETRIES {
            let Some(begun) = seqlock::read_begin(&slot.epoch) else {
                backoff.snooze();
                continue;
            };
            let (kb, klen) = unsafe { slot.key_bytes() };
            let hash = slot.hash.load(Ordering::Acquire);
            let val_len = slot.val_len.load(Ordering::Acquire);
            if !seqlock::read_commit(&slot.epoch, begun) {
                backoff.snooze();
                continue;
            }
            return Ok(Some(SlotSnapshot {
                hash,
                epoch: begun,
                val_off: slot.val_off,
                val_len,
                key: String::from_utf8_lossy(&kb[..klen]).into_owned(),
            }));
        }
        Err(BusError::Contended)
    }

    /// Reclaim a tombstoned slot whose probe successor is Empty
    ///
    /// Claims both slots so no insert can slip between the check and the
    /// flip: an in-flight insert either holds one of the claims (our CAS
    /// fails) or re-walks its chain after we commit and restarts. Reclaims
    /// bump only the slot epoch, never the global one.
    pub fn reclaim_tombstone(&self, idx: usize) -> bool {
        let slots = self.slots as usize;
        let succ_idx = (idx + 1) % slots;
        let slot = self.slot(idx);

        if slot.state.load(Ordering::Acquire) != slot_state::TOMBSTONE {
            return false;
        }
        if succ_idx != idx && self.slot(succ_idx).state.load(Ordering::Acquire) != slot_state::EMPTY
        {
            return false;
        }

        let Some(claim) = seqlock::try_begin_write(&slot.epoch) else {
            return false;
        };
        let succ_claim = if succ_idx == idx {
            None
        } else {
            match seqlock::try_begin_write(&self.slot(succ_idx).epoch) {
                Some(c) => Some(c),
                None => {
                    claim.abort();
                    return false;
                }
            }
        };

        let ok = slot.state.load(Ordering::Relaxed) == slot_state::TOMBSTONE
            && (succ_idx == idx
                || self.slot(succ_idx).state.load(Ordering::Relaxed) == slot_state::EMPTY);
        if !ok {
            if let Some(c) = succ_claim {
                c.abort();
            }
            claim.abort();
            return false;
        }

        slot.state.store(slot_state::EMPTY, Ordering::Release);
        slot.hash.store(0, Ordering::Release);
        slot.val_len.store(0, Ordering::Release);
        unsafe {
            slot.set_key_bytes(&[]);
            std::ptr::write_bytes(self.lane_ptr(slot), 0, self.max_val_sz as usize);
        }
        claim.commit();
        if let Some(c) = succ_claim {
            // The successor was only held, never modified.
            c.abort();
        }
        true
    }
}
