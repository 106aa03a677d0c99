//! Per-connection instrument bookkeeping.
//!
//! Each ingestion connection owns one [`IntegrityContext`]. It tracks every
//! instrument the producer has defined together with the last producer time
//! seen for it, and rejects records that go back in time or refer to an
//! instrument the connection never defined.

use tidal_proto::{Clear, Instrument, Message, MessageKind, PriceLevel, Trade};

use crate::error::{EngineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstrumentState {
    pub security_id: u32,
    /// Last accepted producer time.
    pub time: i64,
    pub disconnected: bool,
}

#[derive(Debug, Default)]
pub struct IntegrityContext {
    name: String,
    /// Sorted by `security_id`.
    instruments: Vec<InstrumentState>,
    /// Index of the last instrument looked up; producers tend to repeat.
    last: Option<usize>,
}

impl IntegrityContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn get(&self, security_id: u32) -> Option<&InstrumentState> {
        self.instruments
            .binary_search_by_key(&security_id, |s| s.security_id)
            .ok()
            .map(|i| &self.instruments[i])
    }

    #[inline]
    fn find(&self, security_id: u32) -> std::result::Result<usize, usize> {
        if let Some(i) = self.last {
            if self.instruments[i].security_id == security_id {
                return Ok(i);
            }
        }
        self.instruments
            .binary_search_by_key(&security_id, |s| s.security_id)
    }

    /// Accept `time` for a defined instrument, rejecting time going backwards.
    pub fn validate(&mut self, security_id: u32, time: i64) -> Result<&mut InstrumentState> {
        let idx = self
            .find(security_id)
            .map_err(|_| EngineError::UnknownInstrument { security_id })?;
        self.last = Some(idx);

        let state = &mut self.instruments[idx];
        if time < state.time {
            return Err(EngineError::OutOfOrder {
                security_id,
                time,
                last: state.time,
            });
        }
        state.time = time;
        Ok(state)
    }

    /// Register an instrument definition.
    pub fn note_definition(&mut self, security_id: u32, time: i64) -> Result<()> {
        match self.find(security_id) {
            Ok(_) => {
                let reopened = {
                    let state = self.validate(security_id, time)?;
                    std::mem::replace(&mut state.disconnected, false)
                };
                match reopened {
                    true => tracing::info!(ctx = %self.name, security_id, "instrument reopened"),
                    false => tracing::warn!(ctx = %self.name, security_id, "duplicate instrument definition"),
                }
            }
            Err(pos) => {
                self.instruments.insert(
                    pos,
                    InstrumentState {
                        security_id,
                        time,
                        disconnected: false,
                    },
                );
                self.last = Some(pos);
            }
        }
        Ok(())
    }

    /// Validate a clear record; a disconnect clear closes the instrument.
    pub fn note_clear(&mut self, clear: &Clear) -> Result<()> {
        let (security_id, time) = (clear.security_id, clear.time);
        let state = self.validate(security_id, time)?;
        if clear.is_disconnect() {
            state.disconnected = true;
        }
        Ok(())
    }

    /// Check one record against the connection state.
    pub fn check(&mut self, kind: MessageKind, msg: &Message) -> Result<()> {
        match kind {
            MessageKind::Instrument => {
                let r = msg.record::<Instrument>().copied();
                if let Some(r) = r {
                    let (security_id, time) = (r.security_id, r.time);
                    self.note_definition(security_id, time)?;
                }
            }
            MessageKind::Clear => {
                if let Some(r) = msg.record::<Clear>().copied() {
                    self.note_clear(&r)?;
                }
            }
            MessageKind::PriceLevel => {
                if let Some(r) = msg.record::<PriceLevel>().copied() {
                    let (security_id, time) = (r.security_id, r.time);
                    self.validate(security_id, time)?;
                }
            }
            MessageKind::Trade => {
                if let Some(r) = msg.record::<Trade>().copied() {
                    let (security_id, time) = (r.security_id, r.time);
                    self.validate(security_id, time)?;
                }
            }
            MessageKind::Hello | MessageKind::Heartbeat => {}
        }
        Ok(())
    }

    /// Close every still-open instrument and return them.
    pub fn disconnect(&mut self) -> Vec<InstrumentState> {
        let mut closed = Vec::new();
        for state in self.instruments.iter_mut().filter(|s| !s.disconnected) {
            state.disconnected = true;
            closed.push(*state);
        }
        closed
    }
}
