//! Byte layout of the shared region.
//!
//! ```text
//! [0]        write cursor
//! [1]        read cursor
//! [2..256]   occupancy count of each slot, addressed by cursor value
//! [256..]    254 slots x 255 messages x 64 bytes
//! [..]       sync block (mutex, condvar, mode), 64-byte aligned
//! ```
//!
//! Cursor values 2..=255 address slot `value - 2`; values 0 and 1 are
//! reserved for the handshake.

use core::mem::size_of;

use tidal_proto::MESSAGE_SIZE;

use crate::region::SyncBlock;

/// Number of slots in the ring.
pub const SLOT_COUNT: usize = 254;

/// Messages per slot.
pub const SLOT_CAPACITY: usize = 255;

/// Bytes of message data per slot.
pub const SLOT_BYTES: usize = SLOT_CAPACITY * MESSAGE_SIZE;

/// Cursor value of the first slot.
pub(crate) const FIRST_CURSOR: u8 = 2;

/// Handshake sentinel: side is present and waiting.
pub(crate) const CURSOR_PRESENT: u8 = 1;

/// Handshake sentinel: nobody attached (also "closed" for the writer byte).
pub(crate) const CURSOR_ABSENT: u8 = 0;

pub(crate) const WRITE_CURSOR_OFFSET: usize = 0;
pub(crate) const READ_CURSOR_OFFSET: usize = 1;
pub(crate) const MESSAGES_OFFSET: usize = 2 + SLOT_COUNT;

const DATA_END: usize = MESSAGES_OFFSET + SLOT_COUNT * SLOT_BYTES;

pub(crate) const SYNC_OFFSET: usize = (DATA_END + 63) & !63;

/// Total size of the mapped file.
pub const REGION_SIZE: usize = SYNC_OFFSET + size_of::<SyncBlock>();

const _: () = assert!(FIRST_CURSOR as usize + SLOT_COUNT - 1 == u8::MAX as usize);

/// Byte offset of the first message of the slot addressed by `cursor`.
#[inline(always)]
pub(crate) const fn slot_offset(cursor: u8) -> usize {
    MESSAGES_OFFSET + (cursor - FIRST_CURSOR) as usize * SLOT_BYTES
}

/// Cursor following `cursor`, wrapping from the last slot back to the first.
#[inline(always)]
pub(crate) const fn next_cursor(cursor: u8) -> u8 {
    if cursor == u8::MAX {
        FIRST_CURSOR
    } else {
        cursor + 1
    }
}

/// Whether `cursor` addresses a data slot.
#[inline(always)]
pub(crate) const fn is_slot(cursor: u8) -> bool {
    cursor >= FIRST_CURSOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_layout() {
        assert_eq!(MESSAGES_OFFSET, 256);
        assert_eq!(slot_offset(FIRST_CURSOR), 256);
        assert_eq!(slot_offset(3), 256 + SLOT_BYTES);
        assert_eq!(slot_offset(u8::MAX), 256 + 253 * SLOT_BYTES);
        assert_eq!(SYNC_OFFSET % 64, 0);
        assert!(SYNC_OFFSET >= DATA_END);
    }

    #[test]
    fn test_cursor_wraps() {
        assert_eq!(next_cursor(2), 3);
        assert_eq!(next_cursor(254), 255);
        assert_eq!(next_cursor(255), FIRST_CURSOR);

        let mut c = FIRST_CURSOR;
        for _ in 0..SLOT_COUNT {
            c = next_cursor(c);
        }
        assert_eq!(c, FIRST_CURSOR);
    }
}
