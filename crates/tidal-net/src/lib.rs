//! Producer-facing importers for the tidal engine.
//!
//! Each importer turns a byte source (a TCP connection, a named pipe, or a
//! shared-memory ring) into calls to [`tidal_core::Engine::proceed`].

pub mod error;
pub mod importer;
pub mod mmap;
pub mod pipe;
pub mod pump;
pub mod tcp;

pub use error::{ImportError, Result};
pub use importer::{spawn_importer, ImportSpec, RESTART_PAUSE};
pub use mmap::MmapImporter;
pub use pipe::PipeImporter;
pub use pump::Pump;
pub use tcp::{TcpImporter, FEED_TIMEOUT, MAX_CONNECTIONS, POLL_TICK};
