//! Writing side of the ring: creates the region and fills slots.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use tidal_proto::{Message, MESSAGE_SIZE};

use crate::error::{Result, RingError};
use crate::layout::*;
use crate::region::Region;
use crate::{RingMode, RingState, DEFAULT_OVERLOAD_TIMEOUT};

const HANDSHAKE_WAIT: Duration = Duration::from_secs(1);

/// Writer configuration.
#[derive(Clone, Copy, Debug)]
pub struct WriterOptions {
    pub mode: RingMode,
    /// How long a full slot may stay undrained before the write fails.
    pub overload_timeout: Duration,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            mode: RingMode::Blocking,
            overload_timeout: DEFAULT_OVERLOAD_TIMEOUT,
        }
    }
}

/// Single writer of a shared-memory ring.
pub struct RingWriter {
    region: Region,
    options: WriterOptions,
    cursor: u8,
    state: RingState,
}

impl RingWriter {
    /// Create the region at `path` and wait for a reader to complete the handshake.
    ///
    /// Returns [`RingError::Cancelled`] if `running` turns false first.
    pub fn create(path: impl AsRef<Path>, options: WriterOptions, running: &AtomicBool) -> Result<Self> {
        let path = path.as_ref();
        let region = Region::create(path, options.mode)?;
        let mut writer = Self {
            region,
            options,
            cursor: FIRST_CURSOR,
            state: RingState::Handshaking,
        };
        writer.handshake(running)?;
        writer.state = RingState::Active;
        tracing::info!(path = %path.display(), mode = ?options.mode, "ring writer active");
        Ok(writer)
    }

    fn handshake(&mut self, running: &AtomicBool) -> Result<()> {
        let (w, r) = (self.region.write_cursor(), self.region.read_cursor());
        let sync = self.region.sync();
        let guard = sync.lock()?;

        w.store(CURSOR_PRESENT, Ordering::Release);
        guard.notify_all();

        // Wait for the reader to announce itself.
        loop {
            let wc = w.load(Ordering::Acquire);
            let rc = r.load(Ordering::Acquire);
            if wc != CURSOR_PRESENT {
                return Err(RingError::WriterConflict(wc));
            }
            if rc == CURSOR_PRESENT {
                break;
            }
            if rc != CURSOR_ABSENT {
                return Err(RingError::Inconsistent { write: wc, read: rc });
            }
            if !running.load(Ordering::Relaxed) {
                w.store(CURSOR_ABSENT, Ordering::Release);
                return Err(RingError::Cancelled);
            }
            guard.wait_timeout(HANDSHAKE_WAIT);
        }

        w.store(FIRST_CURSOR, Ordering::Release);
        guard.notify_all();

        // Wait for the reader to move onto the first slot.
        loop {
            let rc = r.load(Ordering::Acquire);
            if rc == FIRST_CURSOR {
                return Ok(());
            }
            if rc != CURSOR_PRESENT {
                let wc = w.load(Ordering::Acquire);
                return Err(RingError::Inconsistent { write: wc, read: rc });
            }
            if !running.load(Ordering::Relaxed) {
                w.store(CURSOR_ABSENT, Ordering::Release);
                return Err(RingError::Cancelled);
            }
            guard.wait_timeout(HANDSHAKE_WAIT);
        }
    }

    /// Write `messages`, splitting them into slots of at most [`SLOT_CAPACITY`].
    pub fn write(&mut self, messages: &[Message]) -> Result<()> {
        if self.state != RingState::Active {
            return Err(RingError::Closed);
        }
        for chunk in messages.chunks(SLOT_CAPACITY) {
            self.write_slot(chunk)?;
        }
        Ok(())
    }

    fn write_slot(&mut self, chunk: &[Message]) -> Result<()> {
        let count = self.region.count(self.cursor);
        if count.load(Ordering::Acquire) != 0 {
            self.wait_drained()?;
        }

        let bytes: &[u8] = bytemuck::cast_slice(chunk);
        // SAFETY: the slot holds SLOT_BYTES and chunk has at most SLOT_CAPACITY
        // messages; count == 0 means the reader no longer touches the slot.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.region.slot_ptr(self.cursor), bytes.len());
        }
        debug_assert_eq!(bytes.len(), chunk.len() * MESSAGE_SIZE);
        count.store(chunk.len() as u8, Ordering::Release);

        self.cursor = next_cursor(self.cursor);
        self.region.write_cursor().store(self.cursor, Ordering::Release);

        if self.options.mode == RingMode::Blocking {
            self.region.sync().notify_if_free();
        }
        Ok(())
    }

    /// Wait until the reader zeroes the count of the current slot.
    fn wait_drained(&self) -> Result<()> {
        let count = self.region.count(self.cursor);
        let start = Instant::now();

        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if count.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            backoff.snooze();
        }

        loop {
            if count.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= self.options.overload_timeout {
                tracing::error!(
                    path = %self.region.path().display(),
                    slot = self.cursor - FIRST_CURSOR,
                    ?waited,
                    "ring reader is not draining"
                );
                return Err(RingError::Overload {
                    slot: self.cursor - FIRST_CURSOR,
                    waited,
                });
            }
            match self.options.mode {
                RingMode::Blocking => {
                    let guard = self.region.sync().lock()?;
                    if count.load(Ordering::Acquire) != 0 {
                        let left = self.options.overload_timeout - waited;
                        guard.wait_timeout(left.min(HANDSHAKE_WAIT));
                    }
                }
                RingMode::Pooling => std::thread::yield_now(),
            }
        }
    }

    pub fn state(&self) -> RingState {
        self.state
    }

    pub fn mode(&self) -> RingMode {
        self.options.mode
    }

    /// Slot index the next write goes to.
    pub fn slot(&self) -> usize {
        (self.cursor - FIRST_CURSOR) as usize
    }
}

impl Drop for RingWriter {
    fn drop(&mut self) {
        if self.state == RingState::Active {
            self.region.write_cursor().store(CURSOR_ABSENT, Ordering::Release);
            self.region.sync().notify_if_free();
            self.state = RingState::Closed;
            tracing::info!(path = %self.region.path().display(), "ring writer closed");
        }
    }
}
