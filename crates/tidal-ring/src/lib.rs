//! Shared-memory ring transport between two cooperating processes.
//!
//! One side (the [`RingWriter`]) creates a memory-mapped file, the other
//! (the [`RingReader`]) opens it. After a handshake through the two cursor
//! bytes at the start of the region, batches of up to 255 messages move
//! slot by slot without any syscall on the hot path. Each slot carries a
//! one-byte occupancy count: the writer only fills slots whose count is zero
//! and the reader zeroes the count once it has copied the slot out.
//!
//! The protocol is single-writer / single-reader per region.

mod error;
mod layout;
mod reader;
mod region;
mod writer;

pub use error::{Result, RingError};
pub use layout::{REGION_SIZE, SLOT_BYTES, SLOT_CAPACITY, SLOT_COUNT};
pub use reader::RingReader;
pub use writer::{RingWriter, WriterOptions};

use std::time::Duration;

/// Default time the writer waits for the reader to drain a slot.
pub const DEFAULT_OVERLOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// How both sides wait for each other once the ring is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RingMode {
    /// Never block; re-poll continuously for minimum latency.
    Pooling = 1,
    /// Sleep on the shared condition variable between polls.
    Blocking = 2,
}

impl RingMode {
    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(RingMode::Pooling),
            2 => Some(RingMode::Blocking),
            _ => None,
        }
    }
}

/// Lifecycle of one side of the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingState {
    Uninitialized,
    Handshaking,
    Active,
    Closed,
}
