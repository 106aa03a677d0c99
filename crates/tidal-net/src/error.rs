use std::io;
use std::time::Duration;

use thiserror::Error;
use tidal_core::EngineError;
use tidal_ring::RingError;

pub type Result<T> = std::result::Result<T, ImportError>;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid import spec '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("no data for {0:?}")]
    FeedTimeout(Duration),

    #[error("peer closed the feed")]
    Closed,
}

impl ImportError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        ImportError::Io {
            context: context.into(),
            source,
        }
    }
}
