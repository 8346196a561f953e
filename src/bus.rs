//! High-level bus API
//!
//! A [`Bus`] is one process-local attachment to a shared region. Any number
//! of handles across any number of processes may operate on the same region
//! concurrently; all coordination happens through the header and slot
//! atomics, never through process-local state.

use crate::error::{BusError, Result};
use crate::layout::{
    self, region_size, BusHeader, HeaderSnapshot, SlotSnapshot, BUS_MAGIC, BUS_VERSION,
};
use crate::shm::ShmRegion;
use crate::table::SlotTable;
use crate::vacuum::Scrubber;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default slot capacity for [`BusConfig`]
const DEFAULT_SLOTS: u32 = 128;
/// Default per-value byte cap for [`BusConfig`]
const DEFAULT_MAX_VAL_SZ: u32 = 4096;

/// How long `open` waits out a creator that has mapped the region but not
/// yet published its magic
const CREATE_GRACE: Duration = Duration::from_millis(250);

/// Busy spins before `poll` starts sleeping
const POLL_SPIN_LIMIT: u32 = 256;
/// First `poll` sleep; doubles up to [`POLL_MAX_BACKOFF`]
const POLL_INITIAL_BACKOFF: Duration = Duration::from_micros(50);
const POLL_MAX_BACKOFF: Duration = Duration::from_millis(2);

/// Attempts `get_vec` makes while the value keeps growing under it
const GET_VEC_ATTEMPTS: u32 = 8;

/// Creation parameters for a bus region
#[derive(Clone)]
pub struct BusConfig {
    /// Total number of key-value slots
    pub slots: u32,
    /// Maximum size in bytes for any single value
    pub max_val_sz: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            slots: DEFAULT_SLOTS,
            max_val_sz: DEFAULT_MAX_VAL_SZ,
        }
    }
}

/// Result of a [`Bus::poll`] wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The key was set or unset after the poll began
    Changed,
    /// The timeout elapsed with no mutation (a key absent for the whole
    /// wait reports the same way)
    TimedOut,
}

pub(crate) struct Attached {
    pub(crate) table: SlotTable,
    region: ShmRegion,
}

impl Attached {
    fn name(&self) -> &str {
        self.region.name()
    }
}

/// Process-local handle to a shared bus region
///
/// Dropping or [`close`](Bus::close)-ing the handle detaches it; the region
/// and its contents live on until [`Bus::unlink`].
pub struct Bus {
    inner: Option<Arc<Attached>>,
    scrubber: Option<Scrubber>,
}

impl Bus {
    /// Create and initialize a new bus region
    ///
    /// Fails with [`BusError::AlreadyExists`] if the name is taken.
    pub fn create(name: &str, config: BusConfig) -> Result<Self> {
        if config.slots == 0 {
            return Err(BusError::InvalidConfig {
                reason: "slots must be non-zero",
            });
        }
        if config.max_val_sz == 0 {
            return Err(BusError::InvalidConfig {
                reason: "max_val_sz must be non-zero",
            });
        }

        let size = region_size(config.slots, config.max_val_sz);
        let region = ShmRegion::create(name, size)?;
        // The region is zero-filled; init publishes the magic last, so a
        // concurrent open never attaches to a half-built header.
        unsafe { layout::init_region(region.as_ptr(), config.slots, config.max_val_sz) };
        debug!(
            name,
            slots = config.slots,
            max_val_sz = config.max_val_sz,
            "created bus region"
        );
        Ok(Self::attach(region))
    }

    /// Attach to an existing bus region
    ///
    /// Fails with [`BusError::NotFound`] if no region of that name exists
    /// and [`BusError::LayoutMismatch`] if the region is not a compatible
    /// bus.
    pub fn open(name: &str) -> Result<Self> {
        let region = ShmRegion::open(name)?;
        Self::validate(&region)?;
        debug!(name, "attached to bus region");
        Ok(Self::attach(region))
    }

    /// Attach to the named region, creating it first if it does not exist
    ///
    /// Race-free against concurrent `_or_` callers: exactly one of them
    /// creates, the rest attach to the fully-initialized result.
    pub fn open_or_create(name: &str, config: BusConfig) -> Result<Self> {
        match Self::open(name) {
            Err(BusError::NotFound { .. }) => {}
            Err(ref e) if Self::is_inflight_create(e) => return Self::open_losing_race(name),
            other => return other,
        }
        match Self::create(name, config) {
            // Lost the creation race; the winner's region is ready.
            Err(BusError::AlreadyExists { .. }) => Self::open_losing_race(name),
            other => other,
        }
    }

    /// Create the named region, attaching instead if it already exists
    pub fn create_or_open(name: &str, config: BusConfig) -> Result<Self> {
        match Self::create(name, config) {
            Err(BusError::AlreadyExists { .. }) => Self::open_losing_race(name),
            other => other,
        }
    }

    /// A failure shape that a concurrent creator causes while it is between
    /// its exclusive create and the magic publish (the region can even be
    /// unsized for a moment)
    fn is_inflight_create(e: &BusError) -> bool {
        matches!(
            e,
            BusError::TruncatedRegion { .. }
                | BusError::Mmap(_)
                | BusError::LayoutMismatch { magic: 0, .. }
        )
    }

    /// Open after losing a creation race, retrying the winner's in-flight
    /// failure shapes within the grace window
    fn open_losing_race(name: &str) -> Result<Self> {
        let deadline = Instant::now() + CREATE_GRACE;
        loop {
            match Self::open(name) {
                Err(ref e) if Self::is_inflight_create(e) && Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                other => return other,
            }
        }
    }

    /// Remove the backing name; attached handles keep working until they
    /// detach
    pub fn unlink(name: &str) -> Result<()> {
        ShmRegion::unlink(name)
    }

    fn attach(region: ShmRegion) -> Self {
        let table = unsafe { SlotTable::from_base(region.as_non_null()) };
        let attached = Arc::new(Attached { table, region });
        let scrubber = Scrubber::spawn(Arc::clone(&attached));
        Self {
            inner: Some(attached),
            scrubber: Some(scrubber),
        }
    }

    fn validate(region: &ShmRegion) -> Result<()> {
        if region.size() < std::mem::size_of::<BusHeader>() {
            return Err(BusError::TruncatedRegion {
                need: std::mem::size_of::<BusHeader>(),
                got: region.size(),
            });
        }
        let header_ptr = region.as_ptr().cast::<BusHeader>();
        let header = unsafe { &*header_ptr };

        // A creator publishes magic last; give an in-flight one a short
        // grace window before declaring the region foreign.
        let deadline = Instant::now() + CREATE_GRACE;
        let mut magic = header.magic.load(Ordering::Acquire);
        while magic == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
            magic = header.magic.load(Ordering::Acquire);
        }

        if magic != BUS_MAGIC {
            // Unsynchronized region; the version is whatever sits there.
            let version =
                unsafe { std::ptr::addr_of!((*header_ptr).version).read_volatile() };
            return Err(BusError::LayoutMismatch {
                expected_magic: BUS_MAGIC,
                expected_version: BUS_VERSION,
                magic,
                version,
            });
        }
        // magic was acquire-loaded, so the creator's header writes are
        // visible from here on.
        if header.version != BUS_VERSION {
            return Err(BusError::LayoutMismatch {
                expected_magic: BUS_MAGIC,
                expected_version: BUS_VERSION,
                magic,
                version: header.version,
            });
        }
        let need = region_size(header.slots, header.max_val_sz);
        if region.size() < need {
            return Err(BusError::TruncatedRegion {
                need,
                got: region.size(),
            });
        }
        Ok(())
    }

    fn attached(&self) -> Result<&Attached> {
        self.inner.as_deref().ok_or(BusError::NotOpen)
    }

    /// Name of the attached region, if the handle is open
    pub fn name(&self) -> Option<&str> {
        self.inner.as_deref().map(Attached::name)
    }

    /// Detach from the region
    ///
    /// Stops this handle's scrubber thread and unmaps. Idempotent; every
    /// later operation on the handle fails with [`BusError::NotOpen`]. Other
    /// attached processes are unaffected.
    pub fn close(&mut self) {
        if let Some(scrubber) = self.scrubber.take() {
            scrubber.stop();
        }
        if let Some(attached) = self.inner.take() {
            debug!(name = attached.name(), "detached from bus region");
        }
    }

    /// Set or update a key-value pair
    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.attached()?.table.set(key, value)
    }

    /// Look up a key
    ///
    /// Two-phase contract: pass `None` to learn the value's size, then call
    /// again with a buffer of at least that capacity. Returns `Ok(None)`
    /// when the key is absent.
    pub fn get(&self, key: &str, buf: Option<&mut [u8]>) -> Result<Option<usize>> {
        self.attached()?.table.get(key, buf)
    }

    /// Look up a key into a freshly allocated buffer
    pub fn get_vec(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let table = &self.attached()?.table;
        for _ in 0..GET_VEC_ATTEMPTS {
            let Some(len) = table.get(key, None)? else {
                return Ok(None);
            };
            let mut buf = vec![0u8; len];
            match table.get(key, Some(&mut buf)) {
                Ok(Some(n)) => {
                    buf.truncate(n);
                    return Ok(Some(buf));
                }
                Ok(None) => return Ok(None),
                // The value grew between the two phases; size it again.
                Err(BusError::BufferTooSmall { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(BusError::Contended)
    }

    /// Delete a key, returning the prior value length
    ///
    /// `Ok(None)` when the key was not present; deletion is not an error
    /// path.
    pub fn unset(&self, key: &str) -> Result<Option<usize>> {
        self.attached()?.table.unset(key)
    }

    /// Keys of occupied slots in physical table order, up to `max_keys`
    pub fn list(&self, max_keys: usize) -> Result<Vec<String>> {
        Ok(self.attached()?.table.collect_keys(max_keys))
    }

    /// Wait for a key's value to change
    ///
    /// Watches the key's slot epoch with a spin-then-backoff loop; no
    /// cross-process blocking primitive is involved. A key that is absent
    /// for the whole wait reports [`PollOutcome::TimedOut`], same as an
    /// untouched one.
    pub fn poll(&self, key: &str, timeout: Duration) -> Result<PollOutcome> {
        let table = &self.attached()?.table;
        let deadline = Instant::now() + timeout;
        let watched = table.find_slot(key)?;

        let mut spins = 0u32;
        let mut backoff = POLL_INITIAL_BACKOFF;
        loop {
            let changed = match watched {
                Some((idx, start)) => {
                    let epoch = table.slot_epoch(idx);
                    // Odd means a writer is mid-flight; only a completed
                    // mutation counts.
                    epoch & 1 == 0 && epoch != start
                }
                None => table.find_slot(key)?.is_some(),
            };
            if changed {
                return Ok(PollOutcome::Changed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(PollOutcome::TimedOut);
            }
            if spins < POLL_SPIN_LIMIT {
                spins += 1;
                core::hint::spin_loop();
            } else {
                std::thread::sleep(backoff.min(deadline - now));
                backoff = (backoff * 2).min(POLL_MAX_BACKOFF);
            }
        }
    }

    /// Current auto-vacuum flag
    pub fn auto_vacuum(&self) -> Result<bool> {
        let header = self.attached()?.table.header();
        Ok(header.auto_vacuum.load(Ordering::Acquire) == 1)
    }

    /// Toggle the auto-vacuum scrubber
    ///
    /// Header metadata only: the global data epoch is untouched, so pollers
    /// on unrelated keys never wake from a toggle.
    pub fn set_auto_vacuum(&self, enabled: bool) -> Result<()> {
        let header = self.attached()?.table.header();
        header
            .auto_vacuum
            .store(enabled as u32, Ordering::Release);
        Ok(())
    }

    /// Copy of the header fields for diagnostics
    pub fn header_snapshot(&self) -> Result<HeaderSnapshot> {
        let header = self.attached()?.table.header();
        Ok(HeaderSnapshot {
            magic: header.magic.load(Ordering::Acquire),
            version: header.version,
            slots: header.slots,
            max_val_sz: header.max_val_sz,
            epoch: header.epoch.load(Ordering::Acquire),
            auto_vacuum: header.auto_vacuum.load(Ordering::Acquire) == 1,
        })
    }

    /// Copy of one slot's fields for diagnostics; `Ok(None)` when the key
    /// is absent
    pub fn slot_snapshot(&self, key: &str) -> Result<Option<SlotSnapshot>> {
        self.attached()?.table.slot_snapshot(key)
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::slot_state;
    use std::thread;

    fn test_name(tag: &str) -> String {
        format!("kbbus_{}_{}", tag, std::process::id())
    }

    fn small() -> BusConfig {
        BusConfig {
            slots: 32,
            max_val_sz: 1024,
        }
    }

    struct Unlinker(String);
    impl Drop for Unlinker {
        fn drop(&mut self) {
            let _ = Bus::unlink(&self.0);
        }
    }

    #[test]
    fn test_set_get_unset_scenario() {
        let name = test_name("scenario");
        let _u = Unlinker(name.clone());
        let bus = Bus::create(&name, small()).unwrap();

        bus.set("hello", b"world").unwrap();

        let mut buf = [0u8; 1024];
        let len = bus.get("hello", Some(&mut buf)).unwrap().unwrap();
        assert_eq!(&buf[..len], b"world");

        assert_eq!(bus.unset("hello").unwrap(), Some(5));
        assert_eq!(bus.get("hello", None).unwrap(), None);
    }

    #[test]
    fn test_two_phase_get() {
        let name = test_name("twophase");
        let _u = Unlinker(name.clone());
        let bus = Bus::create(&name, small()).unwrap();
        bus.set("k", b"0123456789").unwrap();

        // Phase one: size query.
        let need = bus.get("k", None).unwrap().unwrap();
        assert_eq!(need, 10);

        // Phase two: sized buffer.
        let mut buf = vec![0u8; need];
        let len = bus.get("k", Some(&mut buf)).unwrap().unwrap();
        assert_eq!(len, 10);
        assert_eq!(&buf, b"0123456789");

        assert_eq!(bus.get_vec("k").unwrap().unwrap(), b"0123456789".to_vec());
        assert_eq!(bus.get_vec("missing").unwrap(), None);
    }

    #[test]
    fn test_cross_handle_visibility() {
        let name = test_name("crosshandle");
        let _u = Unlinker(name.clone());
        let writer = Bus::create(&name, small()).unwrap();
        let reader = Bus::open(&name).unwrap();

        writer.set("shared", b"value").unwrap();
        let mut buf = [0u8; 64];
        let len = reader.get("shared", Some(&mut buf)).unwrap().unwrap();
        assert_eq!(&buf[..len], b"value");

        // Both handles observe identical immutable header fields.
        let h1 = writer.header_snapshot().unwrap();
        let h2 = reader.header_snapshot().unwrap();
        assert_eq!(h1.slots, h2.slots);
        assert_eq!(h1.max_val_sz, h2.max_val_sz);
        assert_eq!(h1.magic, h2.magic);
    }

    #[test]
    fn test_create_fails_on_existing() {
        let name = test_name("exists");
        let _u = Unlinker(name.clone());
        let _bus = Bus::create(&name, small()).unwrap();
        assert!(matches!(
            Bus::create(&name, small()),
            Err(BusError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_open_missing_and_or_variants() {
        let name = test_name("orvariants");
        let _u = Unlinker(name.clone());

        assert!(matches!(
            Bus::open(&name),
            Err(BusError::NotFound { .. })
        ));

        let b1 = Bus::open_or_create(&name, small()).unwrap();
        b1.set("k", b"v").unwrap();

        // Both compositions attach to the existing region.
        let b2 = Bus::open_or_create(&name, small()).unwrap();
        let b3 = Bus::create_or_open(&name, small()).unwrap();
        assert_eq!(b2.get("k", None).unwrap(), Some(1));
        assert_eq!(b3.get("k", None).unwrap(), Some(1));
    }

    #[test]
    fn test_concurrent_open_or_create() {
        let name = test_name("race");
        let _u = Unlinker(name.clone());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let name = name.clone();
                thread::spawn(move || {
                    let bus = Bus::open_or_create(&name, small()).unwrap();
                    bus.header_snapshot().unwrap()
                })
            })
            .collect();
        for h in handles {
            let snap = h.join().unwrap();
            assert_eq!(snap.slots, 32);
            assert_eq!(snap.max_val_sz, 1024);
        }
    }

    #[test]
    fn test_open_rejects_foreign_region() {
        let name = test_name("foreign");
        let _u = Unlinker(name.clone());
        {
            let region = ShmRegion::create(&name, 4096).unwrap();
            // Stamp garbage where the magic lives.
            unsafe {
                region.as_ptr().cast::<u32>().write(0xDEAD_BEEF);
            }
        }
        assert!(matches!(
            Bus::open(&name),
            Err(BusError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn test_not_open_after_close() {
        let name = test_name("closed");
        let _u = Unlinker(name.clone());
        let mut bus = Bus::create(&name, small()).unwrap();
        bus.set("k", b"v").unwrap();

        bus.close();
        assert!(matches!(bus.set("k", b"v"), Err(BusError::NotOpen)));
        assert!(matches!(bus.get("k", None), Err(BusError::NotOpen)));
        assert!(matches!(bus.unset("k"), Err(BusError::NotOpen)));
        assert!(matches!(bus.list(8), Err(BusError::NotOpen)));
        assert!(matches!(
            bus.poll("k", Duration::from_millis(1)),
            Err(BusError::NotOpen)
        ));
        assert!(matches!(bus.auto_vacuum(), Err(BusError::NotOpen)));
        assert!(bus.name().is_none());
        // close is idempotent
        bus.close();

        // The region survives the detach.
        let again = Bus::open(&name).unwrap();
        assert_eq!(again.get("k", None).unwrap(), Some(1));
    }

    #[test]
    fn test_store_full_after_slots_inserts() {
        let name = test_name("full");
        let _u = Unlinker(name.clone());
        let bus = Bus::create(
            &name,
            BusConfig {
                slots: 8,
                max_val_sz: 64,
            },
        )
        .unwrap();

        for i in 0..8 {
            bus.set(&format!("key{i}"), b"v").unwrap();
        }
        assert!(matches!(
            bus.set("one-too-many", b"v"),
            Err(BusError::StoreFull)
        ));
    }

    #[test]
    fn test_list_returns_live_keys() {
        let name = test_name("list");
        let _u = Unlinker(name.clone());
        let bus = Bus::create(&name, small()).unwrap();

        for i in 0..6 {
            bus.set(&format!("key{i}"), b"v").unwrap();
        }
        bus.unset("key2").unwrap();

        let mut keys = bus.list(32).unwrap();
        keys.sort();
        assert_eq!(keys, vec!["key0", "key1", "key3", "key4", "key5"]);
        assert_eq!(bus.list(2).unwrap().len(), 2);
    }

    #[test]
    fn test_poll_sees_set_from_other_thread() {
        let name = test_name("pollset");
        let _u = Unlinker(name.clone());
        let bus = Bus::create(&name, small()).unwrap();
        bus.set("watched", b"v0").unwrap();

        let writer_name = name.clone();
        let writer = thread::spawn(move || {
            let bus = Bus::open(&writer_name).unwrap();
            thread::sleep(Duration::from_millis(50));
            bus.set("watched", b"v1").unwrap();
        });

        let started = Instant::now();
        let outcome = bus.poll("watched", Duration::from_secs(5)).unwrap();
        writer.join().unwrap();

        assert_eq!(outcome, PollOutcome::Changed);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_poll_sees_key_appear() {
        let name = test_name("pollappear");
        let _u = Unlinker(name.clone());
        let bus = Bus::create(&name, small()).unwrap();

        let writer_name = name.clone();
        let writer = thread::spawn(move || {
            let bus = Bus::open(&writer_name).unwrap();
            thread::sleep(Duration::from_millis(50));
            bus.set("late", b"v").unwrap();
        });

        let outcome = bus.poll("late", Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
        assert_eq!(outcome, PollOutcome::Changed);
    }

    #[test]
    fn test_poll_timeout_on_untouched_key() {
        let name = test_name("polltimeout");
        let _u = Unlinker(name.clone());
        let bus = Bus::create(&name, small()).unwrap();
        bus.set("still", b"v").unwrap();

        let started = Instant::now();
        let outcome = bus.poll("still", Duration::from_millis(100)).unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome, PollOutcome::TimedOut);
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));

        // An absent key reports identically.
        assert_eq!(
            bus.poll("never", Duration::from_millis(50)).unwrap(),
            PollOutcome::TimedOut
        );
    }

    #[test]
    fn test_poll_ignores_unrelated_mutations() {
        let name = test_name("pollunrelated");
        let _u = Unlinker(name.clone());
        let bus = Bus::create(&name, small()).unwrap();
        bus.set("quiet", b"v").unwrap();

        let writer_name = name.clone();
        let writer = thread::spawn(move || {
            let bus = Bus::open(&writer_name).unwrap();
            for i in 0..20 {
                bus.set(&format!("noisy{i}"), b"x").unwrap();
            }
            bus.set_auto_vacuum(false).unwrap();
            bus.set_auto_vacuum(true).unwrap();
        });

        let outcome = bus.poll("quiet", Duration::from_millis(200)).unwrap();
        writer.join().unwrap();
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    #[test]
    fn test_epoch_strictly_increases_and_av_toggle_is_silent() {
        let name = test_name("epoch");
        let _u = Unlinker(name.clone());
        let bus = Bus::create(&name, small()).unwrap();

        let mut last = bus.header_snapshot().unwrap().epoch;
        for i in 0..5 {
            bus.set(&format!("k{i}"), b"v").unwrap();
            let now = bus.header_snapshot().unwrap().epoch;
            assert!(now > last);
            last = now;
        }
        bus.unset("k0").unwrap();
        let now = bus.header_snapshot().unwrap().epoch;
        assert!(now > last);
        last = now;

        // Toggling auto-vacuum is metadata, not content.
        bus.set_auto_vacuum(false).unwrap();
        assert!(!bus.auto_vacuum().unwrap());
        bus.set_auto_vacuum(true).unwrap();
        assert!(bus.auto_vacuum().unwrap());
        assert_eq!(bus.header_snapshot().unwrap().epoch, last);
    }

    #[test]
    fn test_av_toggle_does_not_disturb_data() {
        let name = test_name("avdata");
        let _u = Unlinker(name.clone());
        let bus = Bus::create(&name, small()).unwrap();

        bus.set_auto_vacuum(false).unwrap();
        bus.set("a", b"alpha").unwrap();
        bus.unset("a").unwrap();
        bus.set_auto_vacuum(true).unwrap();
        bus.set("b", b"beta").unwrap();

        assert_eq!(bus.get("a", None).unwrap(), None);
        assert_eq!(bus.get_vec("b").unwrap().unwrap(), b"beta".to_vec());
        assert_eq!(bus.list(8).unwrap(), vec!["b"]);
    }

    #[test]
    fn test_header_and_slot_snapshots() {
        let name = test_name("snapshots");
        let _u = Unlinker(name.clone());
        let bus = Bus::create(&name, small()).unwrap();
        bus.set("snap", b"payload").unwrap();

        let header = bus.header_snapshot().unwrap();
        assert_eq!(header.magic, BUS_MAGIC);
        assert_eq!(header.version, BUS_VERSION);
        assert_eq!(header.slots, 32);
        assert_eq!(header.max_val_sz, 1024);

        let slot = bus.slot_snapshot("snap").unwrap().unwrap();
        assert_eq!(slot.key, "snap");
        assert_eq!(slot.val_len, 7);
        assert_eq!(slot.epoch % 2, 0);
        assert_eq!(slot.val_off % 1024, 0);

        assert!(bus.slot_snapshot("absent").unwrap().is_none());

        // Snapshots never count as mutations.
        let before = bus.header_snapshot().unwrap().epoch;
        let _ = bus.slot_snapshot("snap").unwrap();
        let _ = bus.header_snapshot().unwrap();
        assert_eq!(bus.header_snapshot().unwrap().epoch, before);
    }

    #[test]
    fn test_file_backed_bus_persists_across_detach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.bus");
        let path = path.to_str().unwrap().to_string();

        {
            let bus = Bus::create(&path, small()).unwrap();
            bus.set("durable", b"bytes").unwrap();
        }
        // All handles are gone; the file still carries the table.
        {
            let bus = Bus::open(&path).unwrap();
            assert_eq!(bus.get_vec("durable").unwrap().unwrap(), b"bytes".to_vec());
        }
        Bus::unlink(&path).unwrap();
    }

    #[test]
    fn test_scrubber_reclaims_tombstones() {
        let name = test_name("scrub");
        let _u = Unlinker(name.clone());
        let bus = Bus::create(
            &name,
            BusConfig {
                slots: 8,
                max_val_sz: 64,
            },
        )
        .unwrap();
        bus.set_auto_vacuum(true).unwrap();

        bus.set("gone", b"soon").unwrap();
        bus.unset("gone").unwrap();

        // The background sweep turns the tombstone back into an Empty slot.
        let table = &bus.attached().unwrap().table;
        let deadline = Instant::now() + Duration::from_secs(5);
        let reclaimed = loop {
            let tombstones = (0..table.slot_count() as usize)
                .filter(|&i| {
                    table.slot(i).state.load(Ordering::Acquire) == slot_state::TOMBSTONE
                })
                .count();
            if tombstones == 0 {
                break true;
            }
            if Instant::now() > deadline {
                break false;
            }
            thread::sleep(Duration::from_millis(20));
        };
        assert!(reclaimed, "scrubber did not reclaim the tombstoned slot");

        // Reclaimed capacity is reusable.
        for i in 0..8 {
            bus.set(&format!("fill{i}"), b"v").unwrap();
        }
    }

    #[test]
    fn test_scrubber_respects_disabled_flag() {
        let name = test_name("noscrub");
        let _u = Unlinker(name.clone());
        let bus = Bus::create(
            &name,
            BusConfig {
                slots: 8,
                max_val_sz: 64,
            },
        )
        .unwrap();
        bus.set_auto_vacuum(false).unwrap();

        bus.set("kept", b"around").unwrap();
        bus.unset("kept").unwrap();

        thread::sleep(Duration::from_millis(400));
        let table = &bus.attached().unwrap().table;
        let tombstones = (0..table.slot_count() as usize)
            .filter(|&i| table.slot(i).state.load(Ordering::Acquire) == slot_state::TOMBSTONE)
            .count();
        assert_eq!(tombstones, 1);
    }
}
