//! Reading side of the ring: opens the region and drains slots in order.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tidal_proto::{Message, MESSAGE_SIZE};

use crate::error::{Result, RingError};
use crate::layout::*;
use crate::region::Region;
use crate::{RingMode, RingState};

const HANDSHAKE_WAIT: Duration = Duration::from_secs(1);
const INIT_POLL: Duration = Duration::from_millis(10);

/// Single reader of a shared-memory ring.
pub struct RingReader {
    region: Region,
    mode: RingMode,
    cursor: u8,
    state: RingState,
}

impl RingReader {
    /// Open the region at `path` and complete the handshake with its writer.
    pub fn open(path: impl AsRef<Path>, running: &AtomicBool) -> Result<Self> {
        let path = path.as_ref();
        let region = Region::open(path)?;

        // The writer publishes the mode only after the sync block is usable.
        let mode = loop {
            if let Some(mode) = region.sync().mode() {
                break mode;
            }
            if !running.load(Ordering::Relaxed) {
                return Err(RingError::Cancelled);
            }
            std::thread::sleep(INIT_POLL);
        };

        let mut reader = Self {
            region,
            mode,
            cursor: FIRST_CURSOR,
            state: RingState::Handshaking,
        };
        reader.handshake(running)?;
        reader.state = RingState::Active;
        tracing::info!(path = %path.display(), ?mode, "ring reader active");
        Ok(reader)
    }

    fn handshake(&mut self, running: &AtomicBool) -> Result<()> {
        let (w, r) = (self.region.write_cursor(), self.region.read_cursor());
        let guard = self.region.sync().lock()?;

        let rc = r.load(Ordering::Acquire);
        if rc != CURSOR_ABSENT {
            return Err(RingError::ReaderAttached(rc));
        }

        // Wait for the writer to announce itself.
        loop {
            let wc = w.load(Ordering::Acquire);
            if wc == CURSOR_PRESENT {
                break;
            }
            if wc != CURSOR_ABSENT {
                return Err(RingError::Inconsistent { write: wc, read: rc });
            }
            if !running.load(Ordering::Relaxed) {
                return Err(RingError::Cancelled);
            }
            guard.wait_timeout(HANDSHAKE_WAIT);
        }

        r.store(CURSOR_PRESENT, Ordering::Release);
        guard.notify_all();

        // Wait for the writer to move onto the first slot.
        loop {
            let wc = w.load(Ordering::Acquire);
            if wc == FIRST_CURSOR {
                break;
            }
            if wc != CURSOR_PRESENT {
                return Err(RingError::Inconsistent {
                    write: wc,
                    read: CURSOR_PRESENT,
                });
            }
            if !running.load(Ordering::Relaxed) {
                r.store(CURSOR_ABSENT, Ordering::Release);
                return Err(RingError::Cancelled);
            }
            guard.wait_timeout(HANDSHAKE_WAIT);
        }

        r.store(FIRST_CURSOR, Ordering::Release);
        guard.notify_all();
        Ok(())
    }

    /// Copy the next filled slot into `buf`.
    ///
    /// Returns the number of bytes copied, 0 if the slot is still empty, or
    /// [`RingError::Closed`] once the writer has gone and every slot is drained.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.state != RingState::Active {
            return Err(RingError::Closed);
        }

        let count = self.region.count(self.cursor);
        let n = count.load(Ordering::Acquire) as usize;
        if n == 0 {
            if !is_slot(self.region.write_cursor().load(Ordering::Acquire)) {
                self.state = RingState::Closed;
                return Err(RingError::Closed);
            }
            return Ok(0);
        }

        let bytes = n * MESSAGE_SIZE;
        if buf.len() < bytes {
            return Err(RingError::BufferTooSmall {
                needed: bytes,
                got: buf.len(),
            });
        }
        // SAFETY: count != 0 hands the slot to the reader until it is zeroed.
        unsafe {
            std::ptr::copy_nonoverlapping(self.region.slot_ptr(self.cursor), buf.as_mut_ptr(), bytes);
        }
        count.store(0, Ordering::Release);

        self.cursor = next_cursor(self.cursor);
        self.region.read_cursor().store(self.cursor, Ordering::Release);

        if self.mode == RingMode::Blocking {
            self.region.sync().notify_if_free();
        }
        Ok(bytes)
    }

    /// Copy the next filled slot into `out`, returning the number of messages.
    pub fn read_messages(&mut self, out: &mut [Message]) -> Result<usize> {
        let bytes = self.read(bytemuck::cast_slice_mut(out))?;
        Ok(bytes / MESSAGE_SIZE)
    }

    /// Park until the writer fills the current slot or `timeout` elapses.
    ///
    /// In pooling mode this only hints the CPU and returns immediately.
    pub fn wait(&self, timeout: Duration) {
        match self.mode {
            RingMode::Pooling => std::hint::spin_loop(),
            RingMode::Blocking => {
                if let Some(guard) = self.region.sync().try_lock() {
                    let filled = self.region.count(self.cursor).load(Ordering::Acquire) != 0;
                    let writer_gone = !is_slot(self.region.write_cursor().load(Ordering::Acquire));
                    if !filled && !writer_gone {
                        guard.wait_timeout(timeout);
                    }
                }
            }
        }
    }

    pub fn state(&self) -> RingState {
        self.state
    }

    pub fn mode(&self) -> RingMode {
        self.mode
    }

    /// Slot index the next read comes from.
    pub fn slot(&self) -> usize {
        (self.cursor - FIRST_CURSOR) as usize
    }
}
