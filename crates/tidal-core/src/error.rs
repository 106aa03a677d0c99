use std::io;

use thiserror::Error;
use tidal_proto::ParseError;
use tidal_ring::RingError;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the ingestion path and engine lifecycle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("node pool exhausted ({capacity} nodes in use)")]
    PoolExhausted { capacity: usize },

    #[error(transparent)]
    Protocol(#[from] ParseError),

    #[error("record time is not set")]
    TimeNotSet,

    #[error("instrument {security_id} is not defined")]
    UnknownInstrument { security_id: u32 },

    #[error("instrument {security_id}: time {time} is earlier than {last}")]
    OutOfOrder { security_id: u32, time: i64, last: i64 },

    #[error("sink '{spec}' could not be created: {source}")]
    Sink {
        spec: String,
        #[source]
        source: SinkError,
    },

    #[error("invalid engine configuration: {0}")]
    Config(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

impl EngineError {
    /// Whether the error is a protocol violation by the producer.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            EngineError::Protocol(_)
                | EngineError::TimeNotSet
                | EngineError::UnknownInstrument { .. }
                | EngineError::OutOfOrder { .. }
        )
    }
}

/// Errors raised by sink creation and delivery.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("empty sink specification")]
    Empty,

    #[error("sink '{name}': {reason}")]
    InvalidParams { name: String, reason: String },

    #[error("plugin '{path}': {reason}")]
    Plugin { path: String, reason: String },

    #[error("plugin '{path}' has ABI version {found}, expected {expected}")]
    AbiMismatch { path: String, found: u32, expected: u32 },

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error(transparent)]
    Ring(#[from] RingError),
}

impl SinkError {
    pub(crate) fn params(name: &str, reason: impl Into<String>) -> Self {
        SinkError::InvalidParams {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_classification() {
        assert!(EngineError::TimeNotSet.is_protocol());
        assert!(EngineError::from(ParseError::UnknownKind(3)).is_protocol());
        assert!(EngineError::OutOfOrder { security_id: 1, time: 1, last: 2 }.is_protocol());
        assert!(!EngineError::PoolExhausted { capacity: 8 }.is_protocol());
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::OutOfOrder { security_id: 7, time: 10, last: 20 };
        assert_eq!(err.to_string(), "instrument 7: time 10 is earlier than 20");

        let err = SinkError::AbiMismatch {
            path: "libx.so".into(),
            found: 2,
            expected: 1,
        };
        assert!(err.to_string().contains("ABI version 2"));
    }
}
