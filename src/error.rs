//! Error types for KeyBus

use std::io;
use thiserror::Error;

/// Result type for KeyBus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur in KeyBus operations
///
/// Key lookups that simply miss are not errors: `get`, `unset` and
/// `slot_snapshot` report an absent key as `Ok(None)`, and `poll` folds it
/// into a timed-out outcome.
#[derive(Debug, Error)]
pub enum BusError {
    /// Failed to create the backing region
    #[error("Failed to create region '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open the backing region
    #[error("Failed to open region '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to size the backing region
    #[error("Failed to set region size: {0}")]
    Truncate(#[source] io::Error),

    /// Failed to unlink the backing region
    #[error("Failed to unlink region '{name}': {source}")]
    Unlink {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A region of that name already exists
    #[error("Region '{name}' already exists")]
    AlreadyExists { name: String },

    /// No region of that name exists
    #[error("Region '{name}' does not exist")]
    NotFound { name: String },

    /// The region exists but does not carry a compatible bus layout
    #[error(
        "Region layout mismatch: expected magic 0x{expected_magic:08X} v{expected_version}, \
         got 0x{magic:08X} v{version}"
    )]
    LayoutMismatch {
        expected_magic: u32,
        expected_version: u32,
        magic: u32,
        version: u32,
    },

    /// The region is smaller than its header claims
    #[error("Region truncated: need {need} bytes, mapped {got}")]
    TruncatedRegion { need: usize, got: usize },

    /// Rejected creation parameters (zero slots or zero value capacity)
    #[error("Invalid bus configuration: {reason}")]
    InvalidConfig { reason: &'static str },

    /// Key is empty or longer than the per-slot key capacity
    #[error("Invalid key: length {got} (must be 1..={max} bytes)")]
    InvalidKey { max: usize, got: usize },

    /// Value exceeds the `max_val_sz` fixed at creation
    #[error("Value too large: max {max} bytes, got {got}")]
    ValueTooLarge { max: usize, got: usize },

    /// Caller buffer cannot hold the stored value
    #[error("Buffer too small: need {need} bytes, got {got}")]
    BufferTooSmall { need: usize, got: usize },

    /// No free or reusable slot remains along the probe sequence
    #[error("Store is full")]
    StoreFull,

    /// The handle is not attached to a region
    #[error("Bus is not open")]
    NotOpen,

    /// Internal retry budget exhausted under pathological write contention
    #[error("Slot contention retry budget exhausted")]
    Contended,

    /// Region name too long for the backing namespace
    #[error("Region name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },
}
