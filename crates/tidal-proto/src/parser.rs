//! Zero-copy record parser.
//!
//! Uses bytemuck for safe transmutation from raw bytes. Records are always
//! [`MESSAGE_SIZE`] bytes so batch boundaries are implicit.

use bytemuck::try_from_bytes;
use core::fmt;
use thiserror::Error;

use crate::messages::*;

/// Parse error types.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Buffer doesn't hold a whole record.
    #[error("buffer too small: need {needed} bytes, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    /// Kind tag is not a known record kind.
    #[error("unknown message kind {0}")]
    UnknownKind(u16),

    /// Declared payload size doesn't match the kind.
    #[error("kind {kind} declares size {declared}, expected {expected}")]
    SizeMismatch { kind: u16, declared: u16, expected: u16 },

    /// Instrument definition carries a wrong security id.
    #[error("security id checksum mismatch: declared {declared}, computed {computed}")]
    ChecksumMismatch { declared: u32, computed: u32 },
}

/// Zero-copy record parser.
pub struct MessageParser;

impl MessageParser {
    /// View the first record of `buffer`.
    #[inline(always)]
    pub fn parse(buffer: &[u8]) -> Result<&Message, ParseError> {
        if buffer.len() < MESSAGE_SIZE {
            return Err(ParseError::BufferTooSmall {
                needed: MESSAGE_SIZE,
                got: buffer.len(),
            });
        }

        // Message is packed (align 1), so this cannot fail on alignment.
        try_from_bytes(&buffer[..MESSAGE_SIZE]).map_err(|_| ParseError::BufferTooSmall {
            needed: MESSAGE_SIZE,
            got: buffer.len(),
        })
    }

    /// Check the header of a record and decode its kind.
    #[inline]
    pub fn validate(msg: &Message) -> Result<MessageKind, ParseError> {
        let kind = msg.kind()?;

        // Copy to avoid reference to packed struct
        let declared = msg.header.size;
        if declared as usize != PAYLOAD_SIZE {
            return Err(ParseError::SizeMismatch {
                kind: kind as u16,
                declared,
                expected: PAYLOAD_SIZE as u16,
            });
        }

        Ok(kind)
    }

    /// Number of whole records in `len` bytes.
    #[inline(always)]
    pub const fn whole_records(len: usize) -> usize {
        len / MESSAGE_SIZE
    }
}

/// Hex rendering of at most the first 32 bytes of a buffer, for error logs.
pub struct HexSample<'a>(pub &'a [u8]);

impl fmt::Display for HexSample<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX: usize = 32;
        for (i, b) in self.0.iter().take(MAX).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02x}")?;
        }
        if self.0.len() > MAX {
            write!(f, " ..(+{})", self.0.len() - MAX)?;
        }
        Ok(())
    }
}
