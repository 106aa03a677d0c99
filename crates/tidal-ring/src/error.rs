use std::io;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RingError>;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("ring file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("ring file '{path}' has size {actual}, expected {expected}")]
    SizeMismatch {
        path: String,
        actual: u64,
        expected: u64,
    },

    #[error("{op} failed with code {code}")]
    Sync { op: &'static str, code: i32 },

    #[error("ring inconsistent: write cursor {write}, read cursor {read}")]
    Inconsistent { write: u8, read: u8 },

    #[error("ring already has a reader attached (read cursor {0})")]
    ReaderAttached(u8),

    #[error("ring write cursor changed under the writer (now {0})")]
    WriterConflict(u8),

    #[error("reader did not drain slot {slot} within {waited:?}")]
    Overload { slot: u8, waited: Duration },

    #[error("buffer of {got} bytes cannot hold {needed} bytes")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("ring closed by writer")]
    Closed,

    #[error("ring handshake cancelled")]
    Cancelled,
}

impl RingError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
