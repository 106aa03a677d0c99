//! Shared-memory ring importer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tidal_core::{Engine, Shutdown};
use tidal_ring::{RingError, RingMode, RingReader};

use crate::error::Result;
use crate::pump::Pump;

const READ_WAIT: Duration = Duration::from_secs(1);

pub struct MmapImporter {
    path: PathBuf,
}

impl MmapImporter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attach to the ring as its reader and forward every slot to the engine.
    ///
    /// Returns once the writer has closed the ring and it is drained.
    pub fn run(&self, engine: &Engine, shutdown: &Shutdown) -> Result<()> {
        let mut reader = RingReader::open(&self.path, shutdown.flag())?;
        let mut pump = Pump::new(engine, &self.path.display().to_string())?;
        let pooling = reader.mode() == RingMode::Pooling;

        while shutdown.is_running() {
            match reader.read(pump.spare()) {
                Ok(0) if pooling => std::hint::spin_loop(),
                Ok(0) => reader.wait(READ_WAIT),
                Ok(n) => pump.commit(n)?,
                Err(RingError::Closed) => {
                    tracing::info!(path = %self.path.display(), received = pump.received(), "ring writer closed");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
