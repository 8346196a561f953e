//! Auto-vacuum scrubber
//!
//! Each attached handle runs one scrubber thread. While the region's
//! `auto_vacuum` flag is set, the thread periodically walks the slot table
//! and reclaims Tombstoned slots whose probe successor is Empty; such a
//! tombstone cannot sit inside any live probe chain, so flipping it back to
//! Empty only shortens future lookups. Slots are reclaimed under their
//! seqlock and the global data epoch is never touched.

use crate::bus::Attached;
use crate::table::SlotTable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::trace;

/// Pause between sweeps
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// One pass over the table; returns the number of slots reclaimed
pub(crate) fn sweep(table: &SlotTable) -> usize {
    let mut reclaimed = 0;
    for idx in 0..table.slot_count() as usize {
        if table.reclaim_tombstone(idx) {
            reclaimed += 1;
        }
    }
    reclaimed
}

/// Handle to a running scrubber thread
pub(crate) struct Scrubber {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Scrubber {
    pub(crate) fn spawn(shared: Arc<Attached>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || run(shared, thread_stop));
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the thread and wait for it to exit
    pub(crate) fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<Attached>, stop: Arc<AtomicBool>) {
    loop {
        std::thread::park_timeout(SWEEP_INTERVAL);
        if stop.load(Ordering::Acquire) {
            break;
        }
        if !shared.table.vacuum_enabled() {
            continue;
        }
        let reclaimed = sweep(&shared.table);
        if reclaimed > 0 {
            trace!(reclaimed, "vacuum sweep reclaimed tombstoned slots");
        }
    }
}
