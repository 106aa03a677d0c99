//! Instrument identity.
//!
//! A security id is the CRC-32C of the three fixed-width ASCII fields of an
//! [`Instrument`] record (venue, feed, symbol), so every producer derives the
//! same id for the same instrument without coordination.

use crate::messages::Instrument;
use crate::parser::ParseError;

/// Compute the security id for the given venue, feed and symbol fields.
pub fn security_id(exchange_id: &[u8; 8], feed_id: &[u8; 4], security: &[u8; 16]) -> u32 {
    let crc = crc32c::crc32c(exchange_id);
    let crc = crc32c::crc32c_append(crc, feed_id);
    crc32c::crc32c_append(crc, security)
}

/// Copy `s` into a NUL-padded fixed-width field, truncating if needed.
pub fn fixed_ascii<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let len = s.len().min(N);
    out[..len].copy_from_slice(&s.as_bytes()[..len]);
    out
}

/// Read a NUL-padded fixed-width field back as text.
pub fn ascii_str(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).unwrap_or("?")
}

impl Instrument {
    /// Build a definition record with a correct security id.
    pub fn new(exchange: &str, feed: &str, security: &str, time: i64) -> Self {
        let exchange_id = fixed_ascii::<8>(exchange);
        let feed_id = fixed_ascii::<4>(feed);
        let security = fixed_ascii::<16>(security);
        Self {
            time,
            exchange_time: 0,
            exchange_id,
            feed_id,
            security,
            security_id: security_id(&exchange_id, &feed_id, &security),
        }
    }

    /// Recompute the checksum and compare it with the declared id.
    pub fn verify(&self) -> Result<u32, ParseError> {
        let (exchange_id, feed_id, security) = (self.exchange_id, self.feed_id, self.security);
        let computed = security_id(&exchange_id, &feed_id, &security);
        let declared = self.security_id;
        if computed != declared {
            return Err(ParseError::ChecksumMismatch { declared, computed });
        }
        Ok(computed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_id_is_stable() {
        let a = Instrument::new("XNAS", "itch", "AAPL", 1);
        let b = Instrument::new("XNAS", "itch", "AAPL", 2);
        let c = Instrument::new("XNAS", "itch", "MSFT", 1);
        let (ida, idb, idc) = (a.security_id, b.security_id, c.security_id);
        assert_eq!(ida, idb);
        assert_ne!(ida, idc);
    }

    #[test]
    fn test_verify_detects_mismatch() {
        let mut instr = Instrument::new("XNAS", "itch", "AAPL", 1);
        assert!(instr.verify().is_ok());

        instr.security_id ^= 1;
        assert!(matches!(
            instr.verify(),
            Err(ParseError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_fixed_ascii_roundtrip() {
        let field = fixed_ascii::<4>("binance");
        assert_eq!(&field, b"bina");
        assert_eq!(ascii_str(&fixed_ascii::<8>("XNAS")), "XNAS");
    }
}
