//! Binary record definitions.
//!
//! Every record is a 64-byte [`Message`]: a 4-byte header, a 48-byte
//! kind-specific payload and two trailing fields written only by the engine.
//! Little-endian byte order is used throughout.

use bytemuck::{Pod, Zeroable};
use core::fmt;
use core::mem::size_of;

use crate::parser::ParseError;
use crate::security::ascii_str;

/// Size of every wire record.
pub const MESSAGE_SIZE: usize = 64;

/// Size of the kind-specific payload area.
pub const PAYLOAD_SIZE: usize = 48;

/// Decimal exponent of `price` fields (fixed-point, 5 fractional digits).
pub const PRICE_EXPONENT: i32 = -5;

/// Decimal exponent of `count` fields (fixed-point, 8 fractional digits).
pub const COUNT_EXPONENT: i32 = -8;

/// `Clear::source` value for clears emitted by the producer itself.
pub const CLEAR_FROM_PRODUCER: u32 = 0;

/// `Clear::source` value for clears synthesized on disconnect.
pub const CLEAR_FROM_DISCONNECT: u32 = 1;

/// Record kind discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    Trade = 10,
    Instrument = 11,
    Clear = 12,
    PriceLevel = 13,
    Hello = 42,
    Heartbeat = 69,
}

impl MessageKind {
    /// Whether records of this kind are fanned out to sinks.
    ///
    /// Hello and heartbeat records only keep a producer connection alive.
    #[inline(always)]
    pub const fn is_broadcast(self) -> bool {
        matches!(
            self,
            MessageKind::Trade
                | MessageKind::Instrument
                | MessageKind::Clear
                | MessageKind::PriceLevel
        )
    }
}

impl TryFrom<u16> for MessageKind {
    type Error = ParseError;

    fn try_from(value: u16) -> Result<Self, ParseError> {
        match value {
            10 => Ok(MessageKind::Trade),
            11 => Ok(MessageKind::Instrument),
            12 => Ok(MessageKind::Clear),
            13 => Ok(MessageKind::PriceLevel),
            42 => Ok(MessageKind::Hello),
            69 => Ok(MessageKind::Heartbeat),
            other => Err(ParseError::UnknownKind(other)),
        }
    }
}

/// Fixed-size record header (4 bytes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub struct MessageHeader {
    /// Record kind tag.
    pub kind: u16,
    /// Declared payload size, always [`PAYLOAD_SIZE`].
    pub size: u16,
}

const _: () = assert!(size_of::<MessageHeader>() == 4);

unsafe impl Pod for MessageHeader {}
unsafe impl Zeroable for MessageHeader {}

impl MessageHeader {
    pub const fn new(kind: MessageKind) -> Self {
        Self {
            kind: kind as u16,
            size: PAYLOAD_SIZE as u16,
        }
    }
}

/// A payload that fits the union area of a [`Message`].
pub trait Record: Pod {
    const KIND: MessageKind;
}

/// Price level update (book).
#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub struct PriceLevel {
    pub time: i64,                  // 8 bytes (producer time, ns)
    pub exchange_time: i64,         // 8 bytes
    pub security_id: u32,           // 4 bytes
    pub _padding: u32,              // 4 bytes
    pub level_id: i64,              // 8 bytes
    pub price: i64,                 // 8 bytes (fixed-point)
    pub count: i64,                 // 8 bytes (new count for level_id)
}

const _: () = assert!(size_of::<PriceLevel>() == PAYLOAD_SIZE);

unsafe impl Pod for PriceLevel {}
unsafe impl Zeroable for PriceLevel {}

impl Record for PriceLevel {
    const KIND: MessageKind = MessageKind::PriceLevel;
}

impl PriceLevel {
    pub fn new(security_id: u32, level_id: i64, price: i64, count: i64, time: i64) -> Self {
        Self {
            time,
            exchange_time: 0,
            security_id,
            _padding: 0,
            level_id,
            price,
            count,
        }
    }
}

/// Trade print.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub struct Trade {
    pub time: i64,                  // 8 bytes
    pub exchange_time: i64,         // 8 bytes
    pub security_id: u32,           // 4 bytes
    pub direction: u16,             // 2 bytes (0=unknown, 1=buy, 2=sell)
    pub _padding: u16,              // 2 bytes
    pub price: i64,                 // 8 bytes
    pub count: i64,                 // 8 bytes
    pub _reserved: [u8; 8],         // 8 bytes
}

const _: () = assert!(size_of::<Trade>() == PAYLOAD_SIZE);

unsafe impl Pod for Trade {}
unsafe impl Zeroable for Trade {}

impl Record for Trade {
    const KIND: MessageKind = MessageKind::Trade;
}

impl Trade {
    pub fn new(security_id: u32, direction: u16, price: i64, count: i64, time: i64) -> Self {
        Self {
            time,
            exchange_time: 0,
            security_id,
            direction,
            _padding: 0,
            price,
            count,
            _reserved: [0; 8],
        }
    }
}

/// Book clear for one instrument.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub struct Clear {
    pub time: i64,                  // 8 bytes
    pub exchange_time: i64,         // 8 bytes
    pub security_id: u32,           // 4 bytes
    pub source: u32,                // 4 bytes (CLEAR_FROM_*)
    pub _reserved: [u8; 24],        // 24 bytes
}

const _: () = assert!(size_of::<Clear>() == PAYLOAD_SIZE);

unsafe impl Pod for Clear {}
unsafe impl Zeroable for Clear {}

impl Record for Clear {
    const KIND: MessageKind = MessageKind::Clear;
}

impl Clear {
    pub fn new(security_id: u32, source: u32, time: i64) -> Self {
        Self {
            time,
            exchange_time: 0,
            security_id,
            source,
            _reserved: [0; 24],
        }
    }

    #[inline]
    pub fn is_disconnect(&self) -> bool {
        self.source == CLEAR_FROM_DISCONNECT
    }
}

/// Instrument definition. Resets the order book of the instrument downstream.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub struct Instrument {
    pub time: i64,                  // 8 bytes
    pub exchange_time: i64,         // 8 bytes
    pub exchange_id: [u8; 8],       // 8 bytes (ASCII, NUL padded)
    pub feed_id: [u8; 4],           // 4 bytes
    pub security: [u8; 16],         // 16 bytes
    pub security_id: u32,           // 4 bytes (checksum of the three fields)
}

const _: () = assert!(size_of::<Instrument>() == PAYLOAD_SIZE);

unsafe impl Pod for Instrument {}
unsafe impl Zeroable for Instrument {}

impl Record for Instrument {
    const KIND: MessageKind = MessageKind::Instrument;
}

/// Producer greeting, logged by the engine and never broadcast.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub struct Hello {
    pub time: i64,
    pub exchange_time: i64,
    pub name: [u8; 16],
    pub _reserved: [u8; 16],
}

const _: () = assert!(size_of::<Hello>() == PAYLOAD_SIZE);

unsafe impl Pod for Hello {}
unsafe impl Zeroable for Hello {}

impl Record for Hello {
    const KIND: MessageKind = MessageKind::Hello;
}

/// Liveness record.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub struct Heartbeat {
    pub time: i64,
    pub exchange_time: i64,
    pub _reserved: [u8; 32],
}

const _: () = assert!(size_of::<Heartbeat>() == PAYLOAD_SIZE);

unsafe impl Pod for Heartbeat {}
unsafe impl Zeroable for Heartbeat {}

impl Record for Heartbeat {
    const KIND: MessageKind = MessageKind::Heartbeat;
}

/// The 64-byte wire record.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct Message {
    pub header: MessageHeader,      // 4 bytes
    pub payload: [u8; PAYLOAD_SIZE],// 48 bytes (union of the records above)
    pub engine_time: i64,           // 8 bytes (written by the engine only)
    pub flush: u8,                  // 1 byte  (written by the engine only)
    pub _reserved: [u8; 3],         // 3 bytes
}

const _: () = assert!(size_of::<Message>() == MESSAGE_SIZE);

unsafe impl Pod for Message {}
unsafe impl Zeroable for Message {}

impl Default for Message {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        bytemuck::bytes_of(self) == bytemuck::bytes_of(other)
    }
}

impl Eq for Message {}

impl Message {
    /// Wrap a payload record.
    pub fn from_record<R: Record>(record: &R) -> Self {
        let mut msg = Self::zeroed();
        msg.header = MessageHeader::new(R::KIND);
        msg.payload.copy_from_slice(bytemuck::bytes_of(record));
        msg
    }

    /// Heartbeat record with the given producer time.
    pub fn heartbeat(time: i64) -> Self {
        Self::from_record(&Heartbeat {
            time,
            ..Heartbeat::default()
        })
    }

    /// Decode the kind tag.
    #[inline]
    pub fn kind(&self) -> Result<MessageKind, ParseError> {
        let kind = self.header.kind;
        MessageKind::try_from(kind)
    }

    /// View the payload as `R` if the kind tag matches.
    #[inline]
    pub fn record<R: Record>(&self) -> Option<&R> {
        let kind = self.header.kind;
        if kind != R::KIND as u16 {
            return None;
        }
        Some(bytemuck::from_bytes(&self.payload))
    }

    /// Producer time, the first field of every payload.
    #[inline(always)]
    pub fn time(&self) -> i64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.payload[..8]);
        i64::from_le_bytes(raw)
    }

    /// Security the record refers to, for kinds that carry one.
    pub fn security_id(&self) -> Option<u32> {
        match self.kind().ok()? {
            MessageKind::PriceLevel => self.record::<PriceLevel>().map(|r| r.security_id),
            MessageKind::Trade => self.record::<Trade>().map(|r| r.security_id),
            MessageKind::Clear => self.record::<Clear>().map(|r| r.security_id),
            MessageKind::Instrument => self.record::<Instrument>().map(|r| r.security_id),
            MessageKind::Hello | MessageKind::Heartbeat => None,
        }
    }

    #[inline(always)]
    pub fn is_flush(&self) -> bool {
        self.flush != 0
    }

    #[inline(always)]
    pub fn set_flush(&mut self, flush: bool) {
        self.flush = flush as u8;
    }

    #[inline(always)]
    pub fn set_engine_time(&mut self, nanos: i64) {
        self.engine_time = nanos;
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Pipe-separated single-line rendering used by log output.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let engine_time = self.engine_time;
        match self.kind() {
            Ok(MessageKind::PriceLevel) => {
                let r = *bytemuck::from_bytes::<PriceLevel>(&self.payload);
                let (sid, level, price, count, time) =
                    (r.security_id, r.level_id, r.price, r.count, r.time);
                write!(f, "book|{sid}|{level}|{price}|{count}|{time}|{engine_time}|")
            }
            Ok(MessageKind::Trade) => {
                let r = *bytemuck::from_bytes::<Trade>(&self.payload);
                let (sid, dir, price, count, time) =
                    (r.security_id, r.direction, r.price, r.count, r.time);
                write!(f, "trade|{sid}|{dir}|{price}|{count}|{time}|{engine_time}|")
            }
            Ok(MessageKind::Clear) => {
                let r = *bytemuck::from_bytes::<Clear>(&self.payload);
                let (sid, source, time) = (r.security_id, r.source, r.time);
                write!(f, "clear|{sid}|{source}|{time}|{engine_time}|")
            }
            Ok(MessageKind::Instrument) => {
                let r = *bytemuck::from_bytes::<Instrument>(&self.payload);
                let (sid, time) = (r.security_id, r.time);
                write!(
                    f,
                    "instr|{}|{}|{}|{sid}|{time}|{engine_time}|",
                    ascii_str(&r.exchange_id),
                    ascii_str(&r.feed_id),
                    ascii_str(&r.security),
                )
            }
            Ok(MessageKind::Hello) => {
                let r = *bytemuck::from_bytes::<Hello>(&self.payload);
                let time = r.time;
                write!(f, "hello|{}|{time}|", ascii_str(&r.name))
            }
            Ok(MessageKind::Heartbeat) => write!(f, "ping|{}|{engine_time}|", self.time()),
            Err(_) => {
                let kind = self.header.kind;
                write!(f, "unknown|{kind}|")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_sizes() {
        assert_eq!(size_of::<MessageHeader>(), 4);
        assert_eq!(size_of::<PriceLevel>(), 48);
        assert_eq!(size_of::<Instrument>(), 48);
        assert_eq!(size_of::<Message>(), 64);
    }

    #[test]
    fn test_record_view_checks_kind() {
        let msg = Message::from_record(&PriceLevel::new(7, 1, 10_000_000, 300, 55));
        assert_eq!(msg.kind(), Ok(MessageKind::PriceLevel));
        assert!(msg.record::<Trade>().is_none());

        let level = msg.record::<PriceLevel>().unwrap();
        // Copy values to avoid packed struct reference issues
        let security_id = level.security_id;
        let count = level.count;
        assert_eq!(security_id, 7);
        assert_eq!(count, 300);
        assert_eq!(msg.time(), 55);
        assert_eq!(msg.security_id(), Some(7));
    }

    #[test]
    fn test_engine_fields() {
        let mut msg = Message::heartbeat(1);
        assert!(!msg.is_flush());
        msg.set_flush(true);
        msg.set_engine_time(99);
        let engine_time = msg.engine_time;
        assert!(msg.is_flush());
        assert_eq!(engine_time, 99);
        assert_eq!(msg.security_id(), None);
    }

    #[test]
    fn test_unknown_kind() {
        let mut msg = Message::heartbeat(1);
        msg.header.kind = 7;
        assert_eq!(msg.kind(), Err(ParseError::UnknownKind(7)));
        assert_eq!(msg.to_string(), "unknown|7|");
    }

    #[test]
    fn test_display_trade() {
        let msg = Message::from_record(&Trade::new(3, 1, 500, 2, 10));
        assert_eq!(msg.to_string(), "trade|3|1|500|2|10|0|");
    }
}
