//! KeyBus - Lock-free shared memory key-value bus
//!
//! This library provides a fixed-capacity key-value store living in a
//! shared memory region that any number of local processes attach to, with
//! atomic reads and writes, change notification by polling, and background
//! compaction of deleted entries.
//!
//! # Architecture
//!
//! - **Region**: a POSIX shared memory object (or a file-backed mapping for
//!   persistence) laid out as `header | slot table | value arena`
//! - **Slots**: open-addressed hash table with linear probing and tombstones
//! - **Seqlock epochs**: per-slot version counters serialize writers and let
//!   readers detect torn reads without ever blocking
//! - **Auto-vacuum**: an optional background scrubber reclaiming tombstoned
//!   slots to keep probe chains short
//!
//! # Example
//!
//! ```no_run
//! use keybus::{Bus, BusConfig};
//! use std::time::Duration;
//!
//! let bus = Bus::create("demo", BusConfig { slots: 32, max_val_sz: 1024 })?;
//! bus.set("hello", b"world")?;
//!
//! let value = bus.get_vec("hello")?.expect("just set");
//! assert_eq!(value, b"world");
//!
//! // Another process can attach and wait for changes:
//! // Bus::open("demo")?.poll("hello", Duration::from_secs(1))?;
//!
//! bus.unset("hello")?;
//! # Ok::<(), keybus::BusError>(())
//! ```

pub mod bus;
pub mod error;
pub mod layout;
pub mod seqlock;
pub mod shm;
pub mod table;
pub mod vacuum;

pub use bus::{Bus, BusConfig, PollOutcome};
pub use error::{BusError, Result};
pub use layout::{HeaderSnapshot, SlotSnapshot};
