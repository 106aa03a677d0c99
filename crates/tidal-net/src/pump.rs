//! Glue between a byte source and the engine's ingestion entry points.

use std::time::{Duration, Instant};

use tidal_core::{Engine, IngestBuffer, IngestContext};

use crate::error::Result;

/// One producer connection feeding the engine.
pub struct Pump<'a> {
    engine: &'a Engine,
    ctx: IngestContext,
    buffer: IngestBuffer,
    last_data: Instant,
    received: u64,
}

impl<'a> Pump<'a> {
    pub fn new(engine: &'a Engine, name: &str) -> Result<Self> {
        let ctx = engine.context_create(name);
        let buffer = engine.alloc_buffer()?;
        Ok(Self {
            engine,
            ctx,
            buffer,
            last_data: Instant::now(),
            received: 0,
        })
    }

    /// Free space to read the next bytes into.
    #[inline]
    pub fn spare(&mut self) -> &mut [u8] {
        self.buffer.spare()
    }

    /// Hand `n` freshly read bytes to the engine.
    pub fn commit(&mut self, n: usize) -> Result<()> {
        self.buffer.commit(n);
        self.engine.proceed(&mut self.buffer, &self.ctx)?;
        self.last_data = Instant::now();
        self.received += n as u64;
        Ok(())
    }

    /// Time since data last arrived.
    pub fn idle(&self) -> Duration {
        self.last_data.elapsed()
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}
